//! Test network - routes messages between in-process transports
//!
//! Every node gets a [`TestTransport`] and the receiving half of its event
//! channel, exactly like [`TcpTransport::new`](crate::network::TcpTransport::new).
//! Sends to a peer can be made to fail to exercise partial-failure paths.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::trace;

use crate::network::{PeerId, PeerMessage, Transport, TransportError, TransportEvent};

/// Inbox capacity per node
const INBOX_CAPACITY: usize = 1000;

/// A simulated network of distribution nodes
#[derive(Debug, Default)]
pub struct TestNetwork {
    /// PeerId -> inbox of that node
    inboxes: RwLock<HashMap<PeerId, mpsc::Sender<TransportEvent>>>,
    /// Peers every send to fails
    failing: RwLock<HashSet<PeerId>>,
}

impl TestNetwork {
    /// Create a new empty test network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a node to the network
    pub async fn add_node(
        self: &Arc<Self>,
        id: &str,
    ) -> (Arc<TestTransport>, mpsc::Receiver<TransportEvent>) {
        let peer = PeerId::new(id);
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.inboxes.write().await.insert(peer.clone(), tx);

        let transport = Arc::new(TestTransport {
            local: peer,
            network: Arc::clone(self),
            sent: Mutex::new(Vec::new()),
        });
        (transport, rx)
    }

    /// Tell both nodes they are connected to each other
    pub async fn connect(&self, a: &PeerId, b: &PeerId) {
        self.signal(a, TransportEvent::Connected(b.clone())).await;
        self.signal(b, TransportEvent::Connected(a.clone())).await;
    }

    /// Tell both nodes the connection between them is gone
    pub async fn disconnect(&self, a: &PeerId, b: &PeerId) {
        self.signal(a, TransportEvent::Disconnected(b.clone())).await;
        self.signal(b, TransportEvent::Disconnected(a.clone())).await;
    }

    /// Make every send to `peer` fail
    pub async fn fail_sends_to(&self, peer: &PeerId) {
        self.failing.write().await.insert(peer.clone());
    }

    /// Undo [`fail_sends_to`](Self::fail_sends_to)
    pub async fn heal(&self, peer: &PeerId) {
        self.failing.write().await.remove(peer);
    }

    async fn signal(&self, to: &PeerId, event: TransportEvent) {
        let inbox = self.inboxes.read().await.get(to).cloned();
        if let Some(inbox) = inbox {
            let _ = inbox.send(event).await;
        }
    }

    async fn deliver(
        &self,
        from: &PeerId,
        to: &PeerId,
        message: &PeerMessage,
    ) -> Result<(), TransportError> {
        if self.failing.read().await.contains(to) {
            return Err(TransportError::NotConnected(to.clone()));
        }

        let inbox = self
            .inboxes
            .read()
            .await
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected(to.clone()))?;

        inbox
            .send(TransportEvent::Message {
                from: from.clone(),
                message: message.clone(),
            })
            .await
            .map_err(|_| TransportError::NotConnected(to.clone()))?;

        trace!(from = %from, to = %to, kind = ?message.message_type(), "delivered");
        Ok(())
    }
}

/// Transport of one node on a [`TestNetwork`]
#[derive(Debug)]
pub struct TestTransport {
    local: PeerId,
    network: Arc<TestNetwork>,
    /// Successfully delivered messages, in order
    sent: Mutex<Vec<(PeerId, PeerMessage)>>,
}

impl TestTransport {
    /// Every message delivered so far
    pub async fn sent(&self) -> Vec<(PeerId, PeerMessage)> {
        self.sent.lock().await.clone()
    }

    /// Messages delivered to `peer`, in order
    pub async fn sent_to(&self, peer: &PeerId) -> Vec<PeerMessage> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(to, _)| to == peer)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for TestTransport {
    fn local_id(&self) -> &PeerId {
        &self.local
    }

    async fn send(&self, peer: &PeerId, message: &PeerMessage) -> Result<(), TransportError> {
        self.network.deliver(&self.local, peer, message).await?;
        self.sent
            .lock()
            .await
            .push((peer.clone(), message.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ResourceInvalidated;

    fn invalidate(uri: &str) -> PeerMessage {
        PeerMessage::ResourceInvalidated(ResourceInvalidated {
            uri: uri.to_string(),
        })
    }

    #[tokio::test]
    async fn test_delivery_and_failure_injection() {
        let network = TestNetwork::new();
        let (a, _a_events) = network.add_node("a").await;
        let (_b, mut b_events) = network.add_node("b").await;
        let b = PeerId::new("b");

        a.send(&b, &invalidate("/x")).await.unwrap();
        assert_eq!(
            b_events.recv().await,
            Some(TransportEvent::Message {
                from: PeerId::new("a"),
                message: invalidate("/x"),
            })
        );

        network.fail_sends_to(&b).await;
        assert!(matches!(
            a.send(&b, &invalidate("/y")).await,
            Err(TransportError::NotConnected(_))
        ));
        network.heal(&b).await;
        a.send(&b, &invalidate("/z")).await.unwrap();

        assert_eq!(a.sent_to(&b).await, vec![invalidate("/x"), invalidate("/z")]);
        assert!(a.send(&PeerId::new("nobody"), &invalidate("/x")).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_signals_both_sides() {
        let network = TestNetwork::new();
        let (_a, mut a_events) = network.add_node("a").await;
        let (_b, mut b_events) = network.add_node("b").await;

        network.connect(&PeerId::new("a"), &PeerId::new("b")).await;
        assert_eq!(
            a_events.recv().await,
            Some(TransportEvent::Connected(PeerId::new("b")))
        );
        assert_eq!(
            b_events.recv().await,
            Some(TransportEvent::Connected(PeerId::new("a")))
        );

        network.disconnect(&PeerId::new("a"), &PeerId::new("b")).await;
        assert_eq!(
            a_events.recv().await,
            Some(TransportEvent::Disconnected(PeerId::new("b")))
        );
    }
}
