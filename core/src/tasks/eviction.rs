//! Cache eviction loop

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;

use crate::protocol::DistributionTask;

/// Recheck period when no pressure signal arrives
const EVICTION_RECHECK: Duration = Duration::from_secs(1);

impl DistributionTask {
    /// Run the eviction loop
    ///
    /// Wakes on cache pressure (or every [`EVICTION_RECHECK`]) and evicts
    /// least recently used resources while the cache is over its limit.
    pub(crate) async fn run_eviction_loop(self: Arc<Self>, running: Arc<RwLock<bool>>) {
        loop {
            if !*running.read().await {
                break;
            }

            tokio::select! {
                _ = self.ctx.cache.pressure() => {}
                _ = tokio::time::sleep(EVICTION_RECHECK) => {}
            }

            if self.ctx.cache.is_over() {
                self.check_full().await;
            }
        }

        info!("eviction loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::data::ChunkStore;
    use crate::protocol::DistributionConfig;
    use crate::resource::CHUNK_SIZE;
    use crate::testing::{TestNetwork, TestNode};

    #[tokio::test]
    async fn test_pressure_triggers_eviction() {
        let network = TestNetwork::new();
        let config = DistributionConfig::for_testing().with_max_cache(CHUNK_SIZE as u64);
        let node = TestNode::start_with_config(&network, "a", config)
            .await
            .unwrap();

        let resource = node.task.create_resource("/big").await.unwrap();
        let data = vec![9u8; CHUNK_SIZE * 2];
        resource.load_from_stream(&data[..]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(3), async {
            while node.task.cache().is_over() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(resource.cached_bytes().await, 0);
        assert!(node.task.get_resource("/big", None).await.is_some());
        assert_eq!(node.store.query_resource("/big").await.unwrap().len(), 2);

        node.stop().await;
    }
}
