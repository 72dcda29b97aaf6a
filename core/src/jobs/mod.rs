//! Distribution jobs
//!
//! Replication is pull-by-scarcity: each job ships the locally stored chunk
//! with the fewest known remote copies (oldest first) to one peer, then cools
//! down before it can be dispatched again.
//!
//! - `job`: [`DistributionJob`] and the fixed [`JobPool`]
//! - `receiver`: rebuilding a job from its payload on the receiving peer

pub mod job;
pub mod receiver;

pub use job::{DistributionJob, JobPool, SelectedChunk};
pub use receiver::{DistributionJobReceiver, ReceivedChunk};

use crate::data::StoreError;

/// Job kinds understood by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Copy one chunk to a peer's store
    ChunkReplication,
}

impl JobKind {
    pub const ALL: &'static [JobKind] = &[JobKind::ChunkReplication];

    /// Name carried in [`JobPayload::kind`](crate::network::JobPayload)
    pub fn name(self) -> &'static str {
        match self {
            JobKind::ChunkReplication => "flowtree.chunk-replication",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Error rebuilding or applying a received job
#[derive(Debug)]
pub enum JobError {
    /// Payload names a kind we do not know
    UnknownKind(String),
    /// A required field never arrived
    MissingField(&'static str),
    /// A field could not be parsed
    InvalidField { key: String, reason: String },
    /// Chunk payload does not match its announced hash
    HashMismatch { uri: String, index: u32 },
    /// Storing the chunk failed
    Store(StoreError),
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::UnknownKind(kind) => write!(f, "unknown job kind: {}", kind),
            JobError::MissingField(key) => write!(f, "missing job field: {}", key),
            JobError::InvalidField { key, reason } => {
                write!(f, "invalid job field {}: {}", key, reason)
            }
            JobError::HashMismatch { uri, index } => {
                write!(f, "hash mismatch for chunk {} of {}", index, uri)
            }
            JobError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl std::error::Error for JobError {}

impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        JobError::Store(e)
    }
}
