//! Set of currently connected peers

use tokio::sync::RwLock;

use super::transport::PeerId;

/// Connected peers in connection order
///
/// Callers take a snapshot before doing any network I/O so the lock is never
/// held across a send.
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: RwLock<Vec<PeerId>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. Returns false if it was already present.
    pub async fn add(&self, peer: PeerId) -> bool {
        let mut peers = self.peers.write().await;
        if peers.contains(&peer) {
            return false;
        }
        peers.push(peer);
        true
    }

    /// Remove a peer. Returns false if it was not present.
    pub async fn remove(&self, peer: &PeerId) -> bool {
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|p| p != peer);
        peers.len() != before
    }

    pub async fn contains(&self, peer: &PeerId) -> bool {
        self.peers.read().await.contains(peer)
    }

    pub async fn snapshot(&self) -> Vec<PeerId> {
        self.peers.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_remove() {
        let set = PeerSet::new();
        assert!(set.add(PeerId::new("a")).await);
        assert!(!set.add(PeerId::new("a")).await);
        assert!(set.add(PeerId::new("b")).await);
        assert_eq!(set.snapshot().await, vec![PeerId::new("a"), PeerId::new("b")]);

        assert!(set.remove(&PeerId::new("a")).await);
        assert!(!set.remove(&PeerId::new("a")).await);
        assert_eq!(set.len().await, 1);
        assert!(!set.contains(&PeerId::new("a")).await);
    }
}
