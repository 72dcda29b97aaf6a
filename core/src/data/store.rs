//! Chunk store contract and the SQLite-backed implementation
//!
//! All operations are best-effort from the caller's point of view: a failure
//! is reported as a [`StoreError`], logged by the caller and retried on the
//! next natural cycle. Nothing in the core escalates a store failure.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::Connection;
use tokio::sync::Mutex;

use super::chunks::{self, LeastDuplicated, StoredChunk};
use super::start::{start_db, start_memory_db, StartError};

/// Error from a chunk store operation
#[derive(Debug)]
pub enum StoreError {
    /// Underlying database error
    Database(String),
    /// Store is not able to serve the request right now
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "database error: {}", e),
            StoreError::Unavailable(e) => write!(f, "store unavailable: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<StartError> for StoreError {
    fn from(e: StartError) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Persistent (resource, chunk index) -> bytes store
///
/// Implementations serialize their own writes; concurrent writers to the same
/// key resolve as last-write-wins.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Payload of one chunk
    async fn query(&self, uri: &str, index: u32) -> Result<Option<Bytes>, StoreError>;

    /// Time of arrival of one chunk
    async fn query_time_of_arrival(&self, uri: &str, index: u32) -> Result<Option<i64>, StoreError>;

    /// Persist (or replace) one chunk
    async fn store(&self, toa: i64, data: &[u8], uri: &str, index: u32) -> Result<(), StoreError>;

    /// Persist a chunk received at `now`, stamped strictly after every other
    /// stored chunk of the same resource. Returns the time of arrival used.
    async fn store_arrival(
        &self,
        now: i64,
        data: &[u8],
        uri: &str,
        index: u32,
    ) -> Result<i64, StoreError>;

    /// Remove one chunk. `Ok(false)` when it was not stored.
    async fn delete_chunk(&self, uri: &str, index: u32) -> Result<bool, StoreError>;

    /// Remove every chunk and the recorded size of a resource. `Ok(false)`
    /// when nothing was stored.
    async fn delete_resource(&self, uri: &str) -> Result<bool, StoreError>;

    /// Chunk with the fewest known remote copies, oldest first on ties
    async fn query_least_duplicated(&self) -> Result<Option<LeastDuplicated>, StoreError>;

    /// Record one more remote copy of a chunk
    async fn increment_duplication(&self, uri: &str, index: u32) -> Result<(), StoreError>;

    /// Select the least duplicated chunk and increment its count in one step.
    /// The returned count includes the increment.
    async fn claim_least_duplicated(&self) -> Result<Option<LeastDuplicated>, StoreError>;

    /// Remember the byte length of a fully loaded resource
    async fn store_resource_size(&self, uri: &str, total_bytes: u64) -> Result<(), StoreError>;

    /// Recorded byte length of a resource
    async fn query_resource_size(&self, uri: &str) -> Result<Option<u64>, StoreError>;

    /// Every stored chunk of a resource, ordered by index
    async fn query_resource(&self, uri: &str) -> Result<Vec<StoredChunk>, StoreError>;

    /// Every URI with at least one stored chunk
    async fn list_resources(&self) -> Result<Vec<String>, StoreError>;
}

/// [`ChunkStore`] backed by a single SQLite connection
#[derive(Clone)]
pub struct SqliteChunkStore {
    db: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteChunkStore").finish_non_exhaustive()
    }
}

impl SqliteChunkStore {
    /// Open (or create) an on-disk chunk store
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = start_db(path)?;
        Ok(Self::from_connection(conn))
    }

    /// Create a throwaway in-memory chunk store
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = start_memory_db()?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap an already initialized connection
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
        }
    }

    /// Shared connection handle (for inspection in tests and tools)
    pub fn db(&self) -> &Mutex<Connection> {
        &self.db
    }
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn query(&self, uri: &str, index: u32) -> Result<Option<Bytes>, StoreError> {
        let db = self.db.lock().await;
        Ok(chunks::get_chunk_data(&db, uri, index)?.map(Bytes::from))
    }

    async fn query_time_of_arrival(&self, uri: &str, index: u32) -> Result<Option<i64>, StoreError> {
        let db = self.db.lock().await;
        Ok(chunks::get_chunk_toa(&db, uri, index)?)
    }

    async fn store(&self, toa: i64, data: &[u8], uri: &str, index: u32) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        chunks::upsert_chunk(&db, toa, data, uri, index)?;
        Ok(())
    }

    async fn store_arrival(
        &self,
        now: i64,
        data: &[u8],
        uri: &str,
        index: u32,
    ) -> Result<i64, StoreError> {
        let db = self.db.lock().await;
        Ok(chunks::insert_arrival(&db, now, data, uri, index)?)
    }

    async fn delete_chunk(&self, uri: &str, index: u32) -> Result<bool, StoreError> {
        let db = self.db.lock().await;
        Ok(chunks::delete_chunk(&db, uri, index)?)
    }

    async fn delete_resource(&self, uri: &str) -> Result<bool, StoreError> {
        let db = self.db.lock().await;
        let removed = chunks::delete_uri(&db, uri)?;
        let sized = chunks::delete_resource_size(&db, uri)?;
        Ok(removed > 0 || sized)
    }

    async fn query_least_duplicated(&self) -> Result<Option<LeastDuplicated>, StoreError> {
        let db = self.db.lock().await;
        Ok(chunks::get_least_duplicated(&db)?)
    }

    async fn increment_duplication(&self, uri: &str, index: u32) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        if !chunks::increment_duplication(&db, uri, index)? {
            return Err(StoreError::Unavailable(format!(
                "chunk {} of {} is not stored",
                index, uri
            )));
        }
        Ok(())
    }

    async fn claim_least_duplicated(&self) -> Result<Option<LeastDuplicated>, StoreError> {
        let db = self.db.lock().await;
        Ok(chunks::claim_least_duplicated(&db)?)
    }

    async fn store_resource_size(&self, uri: &str, total_bytes: u64) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        chunks::set_resource_size(&db, uri, total_bytes)?;
        Ok(())
    }

    async fn query_resource_size(&self, uri: &str) -> Result<Option<u64>, StoreError> {
        let db = self.db.lock().await;
        Ok(chunks::get_resource_size(&db, uri)?)
    }

    async fn query_resource(&self, uri: &str) -> Result<Vec<StoredChunk>, StoreError> {
        let db = self.db.lock().await;
        Ok(chunks::get_chunks_for_uri(&db, uri)?)
    }

    async fn list_resources(&self) -> Result<Vec<String>, StoreError> {
        let db = self.db.lock().await;
        Ok(chunks::list_uris(&db)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_and_query() {
        let store = SqliteChunkStore::open_in_memory().unwrap();
        store.store(10, b"abc", "/a", 0).await.unwrap();

        assert_eq!(store.query("/a", 0).await.unwrap(), Some(Bytes::from_static(b"abc")));
        assert_eq!(store.query_time_of_arrival("/a", 0).await.unwrap(), Some(10));
        assert_eq!(store.query("/a", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_resource_reports_absence() {
        let store = SqliteChunkStore::open_in_memory().unwrap();
        assert!(!store.delete_resource("/missing").await.unwrap());

        store.store(10, b"abc", "/a", 0).await.unwrap();
        store.store_resource_size("/a", 3).await.unwrap();
        assert!(store.delete_resource("/a").await.unwrap());
        assert!(store.query_resource("/a").await.unwrap().is_empty());
        assert_eq!(store.query_resource_size("/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_increment_missing_chunk_is_error() {
        let store = SqliteChunkStore::open_in_memory().unwrap();
        let err = store.increment_duplication("/a", 0).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_on_disk_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunks.db");

        {
            let store = SqliteChunkStore::open(&path).unwrap();
            store.store(1, b"one", "/files/x", 0).await.unwrap();
        }

        let store = SqliteChunkStore::open(&path).unwrap();
        assert_eq!(store.list_resources().await.unwrap(), vec!["/files/x".to_string()]);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Database("locked".to_string());
        assert_eq!(err.to_string(), "database error: locked");
        let err = StoreError::Unavailable("offline".to_string());
        assert_eq!(err.to_string(), "store unavailable: offline");
    }
}
