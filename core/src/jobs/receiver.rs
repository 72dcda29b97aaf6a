//! Receiving side of a distribution job
//!
//! The receiver is rebuilt field by field, the same way the payload was
//! written. The `data` field is checked against `hash` and stored with the
//! receiver's own time of arrival.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{JobError, JobKind};
use crate::data::ChunkStore;
use crate::network::JobPayload;
use crate::resource::Clock;

/// Chunk stored by an applied job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedChunk {
    pub uri: String,
    pub index: u32,
    pub toa: i64,
    pub len: usize,
}

/// Job instance rebuilt from a peer's payload
pub struct DistributionJobReceiver {
    store: Arc<dyn ChunkStore>,
    clock: Arc<dyn Clock>,
    uri: Option<String>,
    index: Option<u32>,
    hash: Option<[u8; 32]>,
    stored: Option<ReceivedChunk>,
}

impl DistributionJobReceiver {
    pub fn new(store: Arc<dyn ChunkStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            uri: None,
            index: None,
            hash: None,
            stored: None,
        }
    }

    /// Apply one field
    ///
    /// `data` must come after `uri` and `i`; it is written to the store as
    /// soon as it is seen. Unknown keys are ignored.
    pub async fn set(&mut self, key: &str, value: &[u8]) -> Result<(), JobError> {
        match key {
            "uri" => {
                let uri = std::str::from_utf8(value).map_err(|e| JobError::InvalidField {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                self.uri = Some(uri.to_string());
            }
            "i" => {
                let index = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.parse::<u32>().ok())
                    .ok_or_else(|| JobError::InvalidField {
                        key: key.to_string(),
                        reason: "not a decimal chunk index".to_string(),
                    })?;
                self.index = Some(index);
            }
            "hash" => {
                let hash: [u8; 32] = value.try_into().map_err(|_| JobError::InvalidField {
                    key: key.to_string(),
                    reason: format!("expected 32 bytes, got {}", value.len()),
                })?;
                self.hash = Some(hash);
            }
            "data" => {
                let uri = self.uri.clone().ok_or(JobError::MissingField("uri"))?;
                let index = self.index.ok_or(JobError::MissingField("i"))?;
                if let Some(expected) = self.hash {
                    if blake3::hash(value).as_bytes() != &expected {
                        return Err(JobError::HashMismatch { uri, index });
                    }
                }
                let toa = self
                    .store
                    .store_arrival(self.clock.now_millis(), value, &uri, index)
                    .await?;
                debug!(uri = %uri, index = index, len = value.len(), "stored replicated chunk");
                self.stored = Some(ReceivedChunk {
                    uri,
                    index,
                    toa,
                    len: value.len(),
                });
            }
            other => {
                debug!(key = %other, "ignoring unknown job field");
            }
        }
        Ok(())
    }

    /// Resolve the payload's kind and apply every field in order
    pub async fn apply(mut self, payload: &JobPayload) -> Result<ReceivedChunk, JobError> {
        match JobKind::from_name(&payload.kind) {
            Some(JobKind::ChunkReplication) => {}
            None => {
                warn!(kind = %payload.kind, "unknown job kind");
                return Err(JobError::UnknownKind(payload.kind.clone()));
            }
        }

        for field in &payload.fields {
            self.set(&field.key, &field.value).await?;
        }

        self.stored.ok_or(JobError::MissingField("data"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SqliteChunkStore;
    use crate::resource::ManualClock;

    fn receiver(store: &Arc<SqliteChunkStore>, now: i64) -> DistributionJobReceiver {
        DistributionJobReceiver::new(store.clone(), Arc::new(ManualClock::new(now)))
    }

    fn payload(uri: &str, index: &str, data: &[u8]) -> JobPayload {
        JobPayload::new(JobKind::ChunkReplication.name())
            .with_field("uri", uri.as_bytes())
            .with_field("i", index.as_bytes())
            .with_field("hash", blake3::hash(data).as_bytes().to_vec())
            .with_field("data", data)
    }

    #[tokio::test]
    async fn test_apply_stores_with_local_toa() {
        let store = Arc::new(SqliteChunkStore::open_in_memory().unwrap());
        let received = receiver(&store, 5_000)
            .apply(&payload("/files/a", "3", b"chunk"))
            .await
            .unwrap();

        assert_eq!(
            received,
            ReceivedChunk {
                uri: "/files/a".to_string(),
                index: 3,
                toa: 5_000,
                len: 5,
            }
        );
        assert_eq!(
            store.query("/files/a", 3).await.unwrap().as_deref(),
            Some(&b"chunk"[..])
        );
        assert_eq!(
            store.query_time_of_arrival("/files/a", 3).await.unwrap(),
            Some(5_000)
        );
    }

    #[tokio::test]
    async fn test_chunks_received_in_same_millisecond_keep_arrival_order() {
        let store = Arc::new(SqliteChunkStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(5_000));

        let mut stamps = Vec::new();
        for index in ["0", "1", "2"] {
            let received = DistributionJobReceiver::new(store.clone(), clock.clone())
                .apply(&payload("/r", index, b"x"))
                .await
                .unwrap();
            stamps.push(received.toa);
        }
        assert_eq!(stamps, vec![5_000, 5_001, 5_002]);
        assert_eq!(store.query_time_of_arrival("/r", 2).await.unwrap(), Some(5_002));

        // other resources are stamped independently
        let other = DistributionJobReceiver::new(store.clone(), clock)
            .apply(&payload("/other", "0", b"y"))
            .await
            .unwrap();
        assert_eq!(other.toa, 5_000);
    }

    #[tokio::test]
    async fn test_hash_mismatch_rejected() {
        let store = Arc::new(SqliteChunkStore::open_in_memory().unwrap());
        let mut bad = payload("/a", "0", b"good");
        if let Some(field) = bad.fields.iter_mut().find(|f| f.key == "data") {
            field.value = b"evil".to_vec();
        }

        let err = receiver(&store, 1).apply(&bad).await.unwrap_err();
        assert!(matches!(err, JobError::HashMismatch { index: 0, .. }));
        assert!(store.query("/a", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_kind_and_bad_index() {
        let store = Arc::new(SqliteChunkStore::open_in_memory().unwrap());

        let unknown = JobPayload::new("flowtree.other");
        assert!(matches!(
            receiver(&store, 1).apply(&unknown).await,
            Err(JobError::UnknownKind(_))
        ));

        let bad_index = payload("/a", "x1", b"d");
        assert!(matches!(
            receiver(&store, 1).apply(&bad_index).await,
            Err(JobError::InvalidField { .. })
        ));
    }

    #[tokio::test]
    async fn test_data_before_uri_is_rejected() {
        let store = Arc::new(SqliteChunkStore::open_in_memory().unwrap());
        let mut rx = receiver(&store, 1);
        assert!(matches!(
            rx.set("data", b"d").await,
            Err(JobError::MissingField("uri"))
        ));
        rx.set("uri", b"/a").await.unwrap();
        rx.set("unused", b"?").await.unwrap();
        assert!(matches!(
            rx.set("data", b"d").await,
            Err(JobError::MissingField("i"))
        ));
    }
}
