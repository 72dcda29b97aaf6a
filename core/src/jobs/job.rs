//! Reusable distribution jobs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::JobKind;
use crate::data::ChunkStore;
use crate::network::{JobPayload, PeerSet};

/// Chunk picked by the last [`DistributionJob::encode`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedChunk {
    pub uri: String,
    pub index: u32,
    /// Duplication count including this job's copy
    pub dups: u32,
}

/// One slot of the job pool
///
/// A job is claimed by [`JobPool::next_job`], filled by [`encode`], shipped
/// by the scheduler and handed back to the pool by [`run`].
///
/// [`encode`]: DistributionJob::encode
/// [`run`]: DistributionJob::run
pub struct DistributionJob {
    slot: usize,
    in_use: AtomicBool,
    cooldown: Duration,
    store: Arc<dyn ChunkStore>,
    selected: Mutex<Option<SelectedChunk>>,
}

impl std::fmt::Debug for DistributionJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributionJob")
            .field("slot", &self.slot)
            .field("in_use", &self.is_in_use())
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

impl DistributionJob {
    pub fn new(slot: usize, store: Arc<dyn ChunkStore>, cooldown: Duration) -> Self {
        Self {
            slot,
            in_use: AtomicBool::new(false),
            cooldown,
            store,
            selected: Mutex::new(None),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    fn try_claim(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release(&self) {
        self.in_use.store(false, Ordering::SeqCst);
    }

    /// Chunk chosen by the last successful encode
    pub async fn selected(&self) -> Option<SelectedChunk> {
        self.selected.lock().await.clone()
    }

    /// Pick the scarcest chunk and serialize it for a peer
    ///
    /// Claims the chunk by recording one more remote copy before the payload
    /// is sent, so concurrent jobs move on to the next scarcest chunk. The
    /// count is an estimate and is never rolled back. Returns `None` (and
    /// frees the slot) when there is nothing to ship or the store fails.
    pub async fn encode(&self) -> Option<JobPayload> {
        let least = match self.store.claim_least_duplicated().await {
            Ok(Some(least)) => least,
            Ok(None) => {
                trace!(slot = self.slot, "no chunk to distribute");
                self.release();
                return None;
            }
            Err(e) => {
                warn!(error = %e, slot = self.slot, "least duplicated claim failed");
                self.release();
                return None;
            }
        };

        let data = match self.store.query(&least.uri, least.index).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                debug!(uri = %least.uri, index = least.index, "selected chunk vanished");
                self.release();
                return None;
            }
            Err(e) => {
                warn!(error = %e, uri = %least.uri, index = least.index, "chunk query failed");
                self.release();
                return None;
            }
        };

        let hash = blake3::hash(&data);
        debug!(
            slot = self.slot,
            uri = %least.uri,
            index = least.index,
            dups = least.dups,
            hash = %hex::encode(&hash.as_bytes()[..8]),
            "job encoded"
        );

        let payload = JobPayload::new(JobKind::ChunkReplication.name())
            .with_field("uri", least.uri.as_bytes())
            .with_field("i", least.index.to_string())
            .with_field("hash", hash.as_bytes().to_vec())
            .with_field("data", data.to_vec());

        *self.selected.lock().await = Some(SelectedChunk {
            uri: least.uri,
            index: least.index,
            dups: least.dups,
        });
        Some(payload)
    }

    /// Cool down, then return the job to the idle pool
    pub async fn run(&self) {
        tokio::time::sleep(self.cooldown).await;
        *self.selected.lock().await = None;
        self.release();
        trace!(slot = self.slot, "job idle");
    }
}

/// Fixed set of reusable jobs
#[derive(Debug)]
pub struct JobPool {
    jobs: Vec<Arc<DistributionJob>>,
    peers: Arc<PeerSet>,
}

impl JobPool {
    pub fn new(size: usize, store: Arc<dyn ChunkStore>, cooldown: Duration, peers: Arc<PeerSet>) -> Self {
        let jobs = (0..size)
            .map(|slot| Arc::new(DistributionJob::new(slot, store.clone(), cooldown)))
            .collect();
        Self { jobs, peers }
    }

    /// Claim an idle job
    ///
    /// `None` when every job is busy or no peer is connected, so outbound
    /// work never exceeds the pool size.
    pub async fn next_job(&self) -> Option<Arc<DistributionJob>> {
        if self.peers.is_empty().await {
            return None;
        }
        self.jobs.iter().find(|job| job.try_claim()).cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn idle_count(&self) -> usize {
        self.jobs.iter().filter(|job| !job.is_in_use()).count()
    }
}
