//! TCP transport
//!
//! One connection per peer. Both sides send a `Hello` frame first; after
//! that every frame is a [`PeerMessage`]. Inbound traffic and connection
//! changes are reported as [`TransportEvent`]s on a channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::message::{Hello, PeerMessage};
use super::transport::{PeerId, Transport, TransportError, TransportEvent};
use super::wire;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_SIZE: usize = 256;

type Writer = Arc<Mutex<OwnedWriteHalf>>;

/// [`Transport`] over plain TCP connections
pub struct TcpTransport {
    local: PeerId,
    writers: Mutex<HashMap<PeerId, Writer>>,
    events: mpsc::Sender<TransportEvent>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

fn io_error(kind: std::io::ErrorKind, msg: &str) -> TransportError {
    TransportError::Io(std::io::Error::new(kind, msg.to_string()))
}

impl TcpTransport {
    /// Create a transport and the receiver for its events
    pub fn new(local: PeerId) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let transport = Arc::new(Self {
            local,
            writers: Mutex::new(HashMap::new()),
            events,
            shutdown: CancellationToken::new(),
        });
        (transport, rx)
    }

    /// Bind a listener and accept peers in the background
    pub async fn bind(self: &Arc<Self>, addr: &str) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, peer_id = %self.local, "listening for peers");

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = transport.shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let (socket, remote) = match accepted {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };

                let transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    if let Err(e) = transport.attach(socket).await {
                        debug!(error = %e, remote = %remote, "inbound handshake failed");
                    }
                });
            }
            debug!("accept loop stopped");
        });

        Ok(local_addr)
    }

    /// Open a connection to a peer and return its identity
    pub async fn connect(self: &Arc<Self>, addr: &str) -> Result<PeerId, TransportError> {
        let socket = TcpStream::connect(addr).await?;
        self.attach(socket).await
    }

    async fn attach(self: &Arc<Self>, socket: TcpStream) -> Result<PeerId, TransportError> {
        socket.set_nodelay(true)?;
        let (mut reader, mut writer) = socket.into_split();

        let hello = PeerMessage::Hello(Hello {
            peer_id: self.local.to_string(),
        })
        .encode()?;
        wire::write_frame(&mut writer, &hello).await?;

        let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, wire::read_frame(&mut reader))
            .await
            .map_err(|_| io_error(std::io::ErrorKind::TimedOut, "handshake timed out"))??
            .ok_or_else(|| io_error(std::io::ErrorKind::UnexpectedEof, "closed during handshake"))?;

        let peer = match PeerMessage::decode(&frame)? {
            PeerMessage::Hello(hello) => PeerId::new(hello.peer_id),
            _ => return Err(io_error(std::io::ErrorKind::InvalidData, "expected hello")),
        };

        let writer: Writer = Arc::new(Mutex::new(writer));
        self.writers
            .lock()
            .await
            .insert(peer.clone(), Arc::clone(&writer));

        info!(peer = %peer, "peer connected");
        let _ = self.events.send(TransportEvent::Connected(peer.clone())).await;

        let transport = Arc::clone(self);
        let reader_peer = peer.clone();
        tokio::spawn(async move {
            transport.read_loop(reader_peer, reader, writer).await;
        });

        Ok(peer)
    }

    async fn read_loop(self: Arc<Self>, peer: PeerId, mut reader: OwnedReadHalf, writer: Writer) {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = wire::read_frame(&mut reader) => frame,
            };

            match frame {
                Ok(Some(bytes)) => match PeerMessage::decode(&bytes) {
                    Ok(message) => {
                        let event = TransportEvent::Message {
                            from: peer.clone(),
                            message,
                        };
                        if self.events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, peer = %peer, "dropping undecodable message"),
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, peer = %peer, "peer connection failed");
                    break;
                }
            }
        }

        // a newer connection for the same peer may have replaced ours
        let removed = {
            let mut writers = self.writers.lock().await;
            match writers.get(&peer) {
                Some(current) if Arc::ptr_eq(current, &writer) => {
                    writers.remove(&peer);
                    true
                }
                _ => false,
            }
        };
        if removed {
            info!(peer = %peer, "peer disconnected");
            let _ = self.events.send(TransportEvent::Disconnected(peer)).await;
        }
    }

    /// Close the connection to a peer
    pub async fn disconnect(&self, peer: &PeerId) -> bool {
        let Some(writer) = self.writers.lock().await.remove(peer) else {
            return false;
        };
        if let Err(e) = writer.lock().await.shutdown().await {
            debug!(error = %e, peer = %peer, "error closing connection");
        }
        info!(peer = %peer, "peer disconnected");
        let _ = self.events.send(TransportEvent::Disconnected(peer.clone())).await;
        true
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.writers.lock().await.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Stop accepting and reading
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_id(&self) -> &PeerId {
        &self.local
    }

    async fn send(&self, peer: &PeerId, message: &PeerMessage) -> Result<(), TransportError> {
        let frame = message.encode()?;
        let writer = self
            .writers
            .lock()
            .await
            .get(peer)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected(peer.clone()))?;

        let mut writer = writer.lock().await;
        wire::write_frame(&mut *writer, &frame).await?;
        Ok(())
    }
}
