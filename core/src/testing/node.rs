//! A running distribution task on a [`TestNetwork`]

use std::sync::Arc;

use crate::data::{SqliteChunkStore, StoreError};
use crate::network::PeerId;
use crate::protocol::{DistributionConfig, DistributionTask};

use super::network::{TestNetwork, TestTransport};

/// Task, transport and store of one simulated node
pub struct TestNode {
    pub task: Arc<DistributionTask>,
    pub transport: Arc<TestTransport>,
    pub store: Arc<SqliteChunkStore>,
}

impl TestNode {
    /// Start a node with [`DistributionConfig::for_testing`]
    pub async fn start(network: &Arc<TestNetwork>, id: &str) -> Result<Self, StoreError> {
        Self::start_with_config(network, id, DistributionConfig::for_testing()).await
    }

    /// Start a node with its background tasks running on an in-memory store
    pub async fn start_with_config(
        network: &Arc<TestNetwork>,
        id: &str,
        config: DistributionConfig,
    ) -> Result<Self, StoreError> {
        let (transport, events) = network.add_node(id).await;
        let store = Arc::new(SqliteChunkStore::open_in_memory()?);
        let task = DistributionTask::new(config, store.clone(), transport.clone());
        task.start_background_tasks(events).await;

        Ok(Self {
            task,
            transport,
            store,
        })
    }

    pub fn id(&self) -> PeerId {
        self.task.local_id().clone()
    }

    pub async fn stop(&self) {
        self.task.stop().await;
    }
}
