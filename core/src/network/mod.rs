//! Network layer for peer-to-peer chunk distribution
//!
//! Contains:
//! - `wire`: `[type][len][payload]` framing
//! - `message`: the peer message set and its codec
//! - `transport`: the [`Transport`] contract and peer identity
//! - `tcp`: TCP implementation of the transport
//! - `peers`: the set of connected peers
//! - `fetch`: asking peers for missing chunks

pub mod fetch;
pub mod message;
pub mod peers;
pub mod tcp;
pub mod transport;
pub mod wire;

pub use fetch::PeerFetcher;
pub use message::{
    ChunkRequest, ChunkResponse, CodecError, Hello, JobField, JobPayload, PeerMessage,
    ResourceExists, ResourceInvalidated,
};
pub use peers::PeerSet;
pub use tcp::TcpTransport;
pub use transport::{PeerId, Transport, TransportError, TransportEvent};
