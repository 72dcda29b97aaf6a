//! Distribution scheduler
//!
//! Every interval, claims idle jobs from the pool, fills each with the
//! scarcest stored chunk and ships it to a random connected peer. A shipped
//! job is returned to the pool after its cooldown.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::network::PeerMessage;
use crate::protocol::DistributionTask;

impl DistributionTask {
    /// Run the distribution scheduler
    pub(crate) async fn run_distribution_scheduler(
        self: Arc<Self>,
        running: Arc<RwLock<bool>>,
        interval: Duration,
    ) {
        info!(interval_ms = interval.as_millis() as u64, "distribution scheduler started");

        loop {
            if !*running.read().await {
                break;
            }

            tokio::time::sleep(interval).await;

            let shipped = self.dispatch_jobs().await;
            if shipped > 0 {
                debug!(shipped, idle = self.jobs.idle_count(), "distribution round");
            }
        }

        info!("distribution scheduler stopped");
    }

    /// One scheduling round. Returns the number of jobs shipped.
    ///
    /// Stops early when the pool is exhausted, no peer is connected or the
    /// store has nothing to distribute.
    pub async fn dispatch_jobs(&self) -> usize {
        let mut shipped = 0;

        while let Some(job) = self.jobs.next_job().await {
            let Some(payload) = job.encode().await else {
                break;
            };

            let peers = self.peers.snapshot().await;
            let target = {
                let mut rng = rand::thread_rng();
                peers.choose(&mut rng).cloned()
            };

            match target {
                Some(peer) => {
                    match self
                        .transport
                        .send(&peer, &PeerMessage::JobPayload(payload))
                        .await
                    {
                        Ok(()) => {
                            trace!(slot = job.slot(), peer = %peer, "job shipped");
                            shipped += 1;
                        }
                        Err(e) => warn!(error = %e, peer = %peer, "failed to ship job"),
                    }
                }
                None => debug!(slot = job.slot(), "no peer left to ship job to"),
            }

            tokio::spawn(async move {
                job.run().await;
            });
        }

        shipped
    }
}
