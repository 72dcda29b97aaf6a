//! Distribution events for the application layer
//!
//! Emitted by the task as the shared namespace changes, so applications can
//! follow what peers are doing without polling the registry.

use crate::network::PeerId;

/// Events emitted by a distribution task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributionEvent {
    /// A resource was registered (locally or by a peer announcement)
    ResourceAdded(ResourceAddedEvent),
    /// A resource was dropped after a peer invalidated it
    ResourceInvalidated(ResourceInvalidatedEvent),
    /// A peer reported a different size for a known resource
    SizeMismatch(SizeMismatchEvent),
    /// A replicated chunk arrived through a distribution job
    ChunkReceived(ChunkReceivedEvent),
}

/// Event: a resource was registered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAddedEvent {
    pub uri: String,
    /// Peer that announced it, `None` when created locally
    pub origin: Option<PeerId>,
}

/// Event: a peer invalidated a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInvalidatedEvent {
    pub uri: String,
    pub origin: PeerId,
}

/// Event: chunk counts disagree
///
/// The registry is left as it is; this is the only place the disagreement
/// surfaces besides the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeMismatchEvent {
    pub uri: String,
    pub peer: PeerId,
    pub local_chunks: u32,
    pub reported_chunks: u32,
}

/// Event: a chunk was stored on behalf of a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReceivedEvent {
    pub uri: String,
    pub index: u32,
    pub from: PeerId,
}
