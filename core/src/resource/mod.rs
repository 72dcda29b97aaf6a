//! Chunked resources
//!
//! A resource is an immutable byte sequence split into fixed-size chunks.
//! Chunks live in memory while the resource is cached, in the local
//! [`ChunkStore`] when persisted, and on remote peers otherwise. Missing
//! chunks are loaded lazily from the store, then from peers.
//!
//! - `uri` - registry path normalization
//! - `clock` - time source for time-of-arrival stamps
//! - `cache` - in-memory byte accounting
//! - `chunked` - the [`Resource`] itself

pub mod cache;
pub mod chunked;
pub mod clock;
pub mod uri;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::data::ChunkStore;
use crate::network::PeerId;

pub use cache::CacheAccounting;
pub use chunked::{ChunkLookup, Resource, CHUNK_SIZE};
pub use clock::{Clock, ManualClock, SystemClock};

/// Error from a resource operation
#[derive(Debug)]
pub enum ResourceError {
    /// Remote fetch did not finish within the fetch timeout
    FetchTimeout { uri: String, index: u32 },
    /// Reading the source stream failed
    Io(std::io::Error),
    /// Chunks handed over do not form a valid resource
    InvalidChunks(String),
}

impl std::fmt::Display for ResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceError::FetchTimeout { uri, index } => {
                write!(f, "timed out fetching chunk {} of {}", index, uri)
            }
            ResourceError::Io(e) => write!(f, "io error: {}", e),
            ResourceError::InvalidChunks(e) => write!(f, "invalid chunks: {}", e),
        }
    }
}

impl std::error::Error for ResourceError {}

impl From<std::io::Error> for ResourceError {
    fn from(e: std::io::Error) -> Self {
        ResourceError::Io(e)
    }
}

impl From<ResourceError> for std::io::Error {
    fn from(e: ResourceError) -> Self {
        match e {
            ResourceError::Io(e) => e,
            ResourceError::FetchTimeout { .. } => {
                std::io::Error::new(std::io::ErrorKind::TimedOut, e.to_string())
            }
            ResourceError::InvalidChunks(_) => {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
            }
        }
    }
}

/// Source of chunks held by remote peers
#[async_trait]
pub trait ChunkFetcher: Send + Sync {
    /// Try to obtain one chunk from the network
    ///
    /// `exclude` is a peer that must not be asked. Implementations stop early
    /// and return `None` once `cancel` fires.
    async fn fetch_chunk(
        &self,
        uri: String,
        index: u32,
        exclude: Option<PeerId>,
        cancel: CancellationToken,
    ) -> Option<Bytes>;
}

/// Everything a resource needs from the task that owns it
#[derive(Clone)]
pub struct ResourceContext {
    pub store: Arc<dyn ChunkStore>,
    pub fetcher: Option<Arc<dyn ChunkFetcher>>,
    pub cache: Arc<CacheAccounting>,
    pub clock: Arc<dyn Clock>,
    /// Bound on one remote fetch
    pub fetch_timeout: Duration,
    /// Persist loaded chunks only once the whole stream has been read
    pub commit_at_end: bool,
}

impl std::fmt::Debug for ResourceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceContext")
            .field("has_fetcher", &self.fetcher.is_some())
            .field("cache", &self.cache)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("commit_at_end", &self.commit_at_end)
            .finish_non_exhaustive()
    }
}

impl ResourceContext {
    /// Context with no network, the system clock and an unbounded cache
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        Self {
            store,
            fetcher: None,
            cache: Arc::new(CacheAccounting::new(u64::MAX)),
            clock: Arc::new(SystemClock),
            fetch_timeout: Duration::from_secs(30),
            commit_at_end: false,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ChunkFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_cache(mut self, cache: Arc<CacheAccounting>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_commit_at_end(mut self, commit_at_end: bool) -> Self {
        self.commit_at_end = commit_at_end;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_error_display() {
        let err = ResourceError::FetchTimeout {
            uri: "/a".to_string(),
            index: 3,
        };
        assert_eq!(err.to_string(), "timed out fetching chunk 3 of /a");
    }

    #[test]
    fn test_resource_error_into_io() {
        let err: std::io::Error = ResourceError::FetchTimeout {
            uri: "/a".to_string(),
            index: 0,
        }
        .into();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }
}
