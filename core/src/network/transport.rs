//! Message transport between distribution tasks

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::message::{CodecError, PeerMessage};

/// Identity of a peer task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error sending to a peer
#[derive(Debug)]
pub enum TransportError {
    /// No open connection to the peer
    NotConnected(PeerId),
    /// Message could not be encoded
    Codec(CodecError),
    /// Connection failed while writing
    Io(std::io::Error),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::NotConnected(peer) => write!(f, "not connected to {}", peer),
            TransportError::Codec(e) => write!(f, "codec error: {}", e),
            TransportError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<CodecError> for TransportError {
    fn from(e: CodecError) -> Self {
        TransportError::Codec(e)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// Connection lifecycle and inbound traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(PeerId),
    Message { from: PeerId, message: PeerMessage },
    Disconnected(PeerId),
}

/// Point-to-point delivery of [`PeerMessage`]s
#[async_trait]
pub trait Transport: Send + Sync {
    /// Our own identity on this transport
    fn local_id(&self) -> &PeerId;

    /// Deliver one message. Failure affects only this peer.
    async fn send(&self, peer: &PeerId, message: &PeerMessage) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_display() {
        let peer = PeerId::new("node-a");
        assert_eq!(peer.to_string(), "node-a");
        assert_eq!(peer.as_str(), "node-a");
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::NotConnected(PeerId::new("node-b"));
        assert_eq!(err.to_string(), "not connected to node-b");
    }
}
