//! Remote chunk fetching
//!
//! Peers are asked one at a time. Each request waits for the matching
//! [`ChunkResponse`](super::message::ChunkResponse) up to a per-peer timeout
//! before the next peer is tried.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::message::{ChunkRequest, PeerMessage};
use super::peers::PeerSet;
use super::transport::{PeerId, Transport};
use crate::resource::ChunkFetcher;

type ChunkKey = (String, u32);

/// [`ChunkFetcher`] that asks connected peers over a [`Transport`]
pub struct PeerFetcher {
    transport: Arc<dyn Transport>,
    peers: Arc<PeerSet>,
    per_peer_timeout: Duration,
    pending: Mutex<HashMap<ChunkKey, Vec<oneshot::Sender<Option<Bytes>>>>>,
}

impl std::fmt::Debug for PeerFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerFetcher")
            .field("per_peer_timeout", &self.per_peer_timeout)
            .finish_non_exhaustive()
    }
}

impl PeerFetcher {
    pub fn new(transport: Arc<dyn Transport>, peers: Arc<PeerSet>, per_peer_timeout: Duration) -> Self {
        Self {
            transport,
            peers,
            per_peer_timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    async fn register(&self, key: ChunkKey) -> oneshot::Receiver<Option<Bytes>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().await;
        let waiters = pending.entry(key).or_default();
        waiters.retain(|w| !w.is_closed());
        waiters.push(tx);
        rx
    }

    /// Deliver a chunk response to everyone waiting on it
    ///
    /// Returns the number of waiters woken.
    pub async fn complete(&self, uri: &str, index: u32, data: Option<Bytes>) -> usize {
        let waiters = self
            .pending
            .lock()
            .await
            .remove(&(uri.to_string(), index))
            .unwrap_or_default();

        let mut woken = 0;
        for waiter in waiters {
            if waiter.send(data.clone()).is_ok() {
                woken += 1;
            }
        }
        trace!(uri = %uri, index, woken, "chunk response delivered");
        woken
    }

    /// Number of chunks with at least one waiter
    pub async fn pending_count(&self) -> usize {
        let mut pending = self.pending.lock().await;
        pending.retain(|_, waiters| {
            waiters.retain(|w| !w.is_closed());
            !waiters.is_empty()
        });
        pending.len()
    }
}

#[async_trait]
impl ChunkFetcher for PeerFetcher {
    async fn fetch_chunk(
        &self,
        uri: String,
        index: u32,
        exclude: Option<PeerId>,
        cancel: CancellationToken,
    ) -> Option<Bytes> {
        let candidates: Vec<PeerId> = self
            .peers
            .snapshot()
            .await
            .into_iter()
            .filter(|p| Some(p) != exclude.as_ref())
            .collect();

        for peer in candidates {
            if cancel.is_cancelled() {
                return None;
            }

            let rx = self.register((uri.clone(), index)).await;
            let request = PeerMessage::ChunkRequest(ChunkRequest {
                uri: uri.clone(),
                index,
            });
            if let Err(e) = self.transport.send(&peer, &request).await {
                debug!(error = %e, peer = %peer, uri = %uri, index, "chunk request failed");
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                answer = tokio::time::timeout(self.per_peer_timeout, rx) => match answer {
                    Ok(Ok(Some(data))) => {
                        debug!(peer = %peer, uri = %uri, index, "chunk fetched from peer");
                        return Some(data);
                    }
                    Ok(Ok(None)) => trace!(peer = %peer, uri = %uri, index, "peer lacks chunk"),
                    Ok(Err(_)) => trace!(peer = %peer, uri = %uri, index, "chunk waiter dropped"),
                    Err(_) => debug!(peer = %peer, uri = %uri, index, "peer did not answer in time"),
                },
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::ChunkResponse;
    use crate::network::transport::TransportError;

    /// Transport that answers every chunk request through the fetcher
    /// according to a per-peer table
    struct AnsweringTransport {
        local: PeerId,
        answers: HashMap<PeerId, Option<Bytes>>,
        fetcher: std::sync::Mutex<Option<Arc<PeerFetcher>>>,
        asked: std::sync::Mutex<Vec<PeerId>>,
    }

    #[async_trait]
    impl Transport for AnsweringTransport {
        fn local_id(&self) -> &PeerId {
            &self.local
        }

        async fn send(&self, peer: &PeerId, message: &PeerMessage) -> Result<(), TransportError> {
            self.asked.lock().unwrap().push(peer.clone());
            let PeerMessage::ChunkRequest(req) = message else {
                return Ok(());
            };
            let answer = match self.answers.get(peer) {
                Some(answer) => answer.clone(),
                None => return Err(TransportError::NotConnected(peer.clone())),
            };
            let fetcher = self.fetcher.lock().unwrap().clone().unwrap();
            let response = ChunkResponse {
                uri: req.uri.clone(),
                index: req.index,
                data: answer.as_ref().map(|b| b.to_vec()),
            };
            tokio::spawn(async move {
                fetcher
                    .complete(&response.uri, response.index, response.data.map(Bytes::from))
                    .await;
            });
            Ok(())
        }
    }

    async fn setup(answers: Vec<(&str, Option<&'static [u8]>)>) -> (Arc<PeerFetcher>, Arc<AnsweringTransport>) {
        let peers = Arc::new(PeerSet::new());
        let mut table = HashMap::new();
        for (peer, answer) in answers {
            peers.add(PeerId::new(peer)).await;
            table.insert(PeerId::new(peer), answer.map(Bytes::from_static));
        }
        let transport = Arc::new(AnsweringTransport {
            local: PeerId::new("me"),
            answers: table,
            fetcher: std::sync::Mutex::new(None),
            asked: std::sync::Mutex::new(Vec::new()),
        });
        let fetcher = Arc::new(PeerFetcher::new(
            transport.clone(),
            peers,
            Duration::from_millis(200),
        ));
        *transport.fetcher.lock().unwrap() = Some(fetcher.clone());
        (fetcher, transport)
    }

    #[tokio::test]
    async fn test_falls_through_to_peer_with_chunk() {
        let (fetcher, transport) = setup(vec![("a", None), ("b", Some(&b"data"[..]))]).await;

        let data = fetcher
            .fetch_chunk("/r".to_string(), 0, None, CancellationToken::new())
            .await;
        assert_eq!(data, Some(Bytes::from_static(b"data")));
        assert_eq!(
            transport.asked.lock().unwrap().clone(),
            vec![PeerId::new("a"), PeerId::new("b")]
        );
    }

    #[tokio::test]
    async fn test_excluded_peer_is_skipped() {
        let (fetcher, transport) = setup(vec![("a", Some(&b"data"[..])), ("b", None)]).await;

        let data = fetcher
            .fetch_chunk(
                "/r".to_string(),
                0,
                Some(PeerId::new("a")),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(data, None);
        assert_eq!(transport.asked.lock().unwrap().clone(), vec![PeerId::new("b")]);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_returns_none() {
        let (fetcher, transport) = setup(vec![("a", Some(&b"data"[..]))]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let data = fetcher.fetch_chunk("/r".to_string(), 0, None, cancel).await;
        assert_eq!(data, None);
        assert!(transport.asked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_without_waiters() {
        let (fetcher, _transport) = setup(vec![]).await;
        assert_eq!(fetcher.complete("/r", 0, None).await, 0);
        assert_eq!(fetcher.pending_count().await, 0);
    }
}
