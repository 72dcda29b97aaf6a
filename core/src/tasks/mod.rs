//! Background tasks for the DistributionTask
//!
//! This module contains the long-running background tasks:
//! - Incoming handler (transport events, see `handlers/incoming`)
//! - Distribution scheduler (dispatches replication jobs to peers)
//! - Eviction loop (keeps cached bytes under the configured limit)

mod eviction;
mod scheduler;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::network::TransportEvent;
use crate::protocol::DistributionTask;

impl DistributionTask {
    /// Start background tasks (incoming handler, scheduler, eviction)
    ///
    /// `transport_events` is the inbound side of the transport this task
    /// sends on.
    pub async fn start_background_tasks(
        self: &Arc<Self>,
        transport_events: mpsc::Receiver<TransportEvent>,
    ) {
        let mut tasks = self.tasks.write().await;

        // 1. Incoming handler
        let task = Arc::clone(self);
        let running = self.running.clone();
        let incoming_task = tokio::spawn(async move {
            task.run_incoming_handler(transport_events, running).await;
        });
        tasks.push(incoming_task);

        // 2. Distribution scheduler
        let task = Arc::clone(self);
        let running = self.running.clone();
        let interval = self.config.schedule_interval();
        let scheduler_task = tokio::spawn(async move {
            task.run_distribution_scheduler(running, interval).await;
        });
        tasks.push(scheduler_task);

        // 3. Eviction loop
        let task = Arc::clone(self);
        let running = self.running.clone();
        let eviction_task = tokio::spawn(async move {
            task.run_eviction_loop(running).await;
        });
        tasks.push(eviction_task);

        info!(count = tasks.len(), "background tasks started");
    }
}
