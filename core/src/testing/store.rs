//! Chunk store wrapper with injectable failures

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::data::{ChunkStore, LeastDuplicated, StoredChunk, StoreError};

/// Delegates to an inner store, failing `delete_resource` for chosen URIs
pub struct FaultyStore {
    inner: Arc<dyn ChunkStore>,
    failing_deletes: RwLock<HashSet<String>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn ChunkStore>) -> Self {
        Self {
            inner,
            failing_deletes: RwLock::new(HashSet::new()),
        }
    }

    /// Make `delete_resource(uri)` fail until [`heal`](Self::heal)ed
    pub async fn fail_delete_for(&self, uri: &str) {
        self.failing_deletes.write().await.insert(uri.to_string());
    }

    pub async fn heal(&self, uri: &str) {
        self.failing_deletes.write().await.remove(uri);
    }
}

#[async_trait]
impl ChunkStore for FaultyStore {
    async fn query(&self, uri: &str, index: u32) -> Result<Option<Bytes>, StoreError> {
        self.inner.query(uri, index).await
    }

    async fn query_time_of_arrival(&self, uri: &str, index: u32) -> Result<Option<i64>, StoreError> {
        self.inner.query_time_of_arrival(uri, index).await
    }

    async fn store(&self, toa: i64, data: &[u8], uri: &str, index: u32) -> Result<(), StoreError> {
        self.inner.store(toa, data, uri, index).await
    }

    async fn store_arrival(
        &self,
        now: i64,
        data: &[u8],
        uri: &str,
        index: u32,
    ) -> Result<i64, StoreError> {
        self.inner.store_arrival(now, data, uri, index).await
    }

    async fn delete_chunk(&self, uri: &str, index: u32) -> Result<bool, StoreError> {
        self.inner.delete_chunk(uri, index).await
    }

    async fn delete_resource(&self, uri: &str) -> Result<bool, StoreError> {
        if self.failing_deletes.read().await.contains(uri) {
            return Err(StoreError::Unavailable(format!("delete of {} refused", uri)));
        }
        self.inner.delete_resource(uri).await
    }

    async fn query_least_duplicated(&self) -> Result<Option<LeastDuplicated>, StoreError> {
        self.inner.query_least_duplicated().await
    }

    async fn increment_duplication(&self, uri: &str, index: u32) -> Result<(), StoreError> {
        self.inner.increment_duplication(uri, index).await
    }

    async fn claim_least_duplicated(&self) -> Result<Option<LeastDuplicated>, StoreError> {
        self.inner.claim_least_duplicated().await
    }

    async fn store_resource_size(&self, uri: &str, total_bytes: u64) -> Result<(), StoreError> {
        self.inner.store_resource_size(uri, total_bytes).await
    }

    async fn query_resource_size(&self, uri: &str) -> Result<Option<u64>, StoreError> {
        self.inner.query_resource_size(uri).await
    }

    async fn query_resource(&self, uri: &str) -> Result<Vec<StoredChunk>, StoreError> {
        self.inner.query_resource(uri).await
    }

    async fn list_resources(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_resources().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SqliteChunkStore;

    #[tokio::test]
    async fn test_delete_fails_until_healed() {
        let store = FaultyStore::new(Arc::new(SqliteChunkStore::open_in_memory().unwrap()));
        store.store(1, b"x", "/a", 0).await.unwrap();

        store.fail_delete_for("/a").await;
        assert!(matches!(
            store.delete_resource("/a").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.query("/a", 0).await.unwrap().is_some());

        store.heal("/a").await;
        assert!(store.delete_resource("/a").await.unwrap());
    }
}
