//! Main DistributionTask implementation
//!
//! This is the core DistributionTask struct and initialization logic.
//! Implementation is split across:
//! - `protocol/` (this module): core struct, start/stop, registry operations
//! - `handlers/`: peer message handling
//! - `tasks/`: background loops (incoming events, job scheduler, eviction)

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::data::{ChunkStore, SqliteChunkStore};
use crate::jobs::JobPool;
use crate::network::{
    PeerFetcher, PeerId, PeerMessage, PeerSet, ResourceExists, ResourceInvalidated, TcpTransport,
    Transport,
};
use crate::resource::{CacheAccounting, Clock, Resource, ResourceContext, SystemClock};

use super::config::DistributionConfig;
use super::error::TaskError;
use super::events::DistributionEvent;
use super::registry::Entry;

/// Default database file when none is configured
const DEFAULT_DB_PATH: &str = "flowtree_chunks.db";

/// Kind of change announced to peers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// The resource exists here (carries the chunk count when known)
    Exists,
    /// The resource was deleted and should be dropped
    Invalidated,
}

/// A distributed resource namespace
///
/// Owns the registry of resources and directories, keeps connected peers
/// informed of changes, and runs the replication jobs that spread stored
/// chunks across the network.
pub struct DistributionTask {
    /// Configuration
    pub(crate) config: DistributionConfig,
    /// Our id on the transport
    pub(crate) local_id: PeerId,
    /// URI -> resource or directory
    pub(crate) registry: Mutex<HashMap<String, Entry>>,
    /// Persistent chunk store
    pub(crate) store: Arc<dyn ChunkStore>,
    /// Outbound messages
    pub(crate) transport: Arc<dyn Transport>,
    /// Set when started over TCP
    tcp: Option<Arc<TcpTransport>>,
    /// Connected peers
    pub(crate) peers: Arc<PeerSet>,
    /// Pending remote chunk requests
    pub(crate) fetcher: Arc<PeerFetcher>,
    /// Shared by every resource of this task
    pub(crate) ctx: ResourceContext,
    /// Replication jobs
    pub(crate) jobs: JobPool,
    /// Event sender
    pub(crate) event_tx: mpsc::Sender<DistributionEvent>,
    /// Event receiver (taken once)
    event_rx: Arc<RwLock<Option<mpsc::Receiver<DistributionEvent>>>>,
    /// Running flag
    pub(crate) running: Arc<RwLock<bool>>,
    /// Background tasks
    pub(crate) tasks: Arc<RwLock<Vec<tokio::task::JoinHandle<()>>>>,
}

impl std::fmt::Debug for DistributionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributionTask")
            .field("local_id", &self.local_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DistributionTask {
    /// Start a task over TCP
    ///
    /// Opens the chunk database, binds the listen address (if any), loads
    /// the stored resource list, starts the background loops and dials the
    /// bootstrap peers. A bootstrap peer that cannot be reached is logged
    /// and skipped.
    pub async fn start(config: DistributionConfig) -> Result<Arc<Self>, TaskError> {
        let db_path = config
            .db_path
            .clone()
            .unwrap_or_else(|| DEFAULT_DB_PATH.into());
        let store = SqliteChunkStore::open(&db_path)
            .map_err(|e| TaskError::StartFailed(format!("failed to open chunk store: {}", e)))?;

        let local_id = PeerId::new(
            config
                .peer_id
                .clone()
                .unwrap_or_else(|| hex::encode(rand::random::<[u8; 16]>())),
        );
        let (tcp, transport_events) = TcpTransport::new(local_id.clone());

        if let Some(addr) = &config.listen_addr {
            let bound = tcp.bind(addr).await.map_err(|e| {
                TaskError::StartFailed(format!("failed to listen on {}: {}", addr, e))
            })?;
            info!(addr = %bound, "listening for peers");
        }

        let bootstrap = config.bootstrap_peers.clone();
        let task = Arc::new(Self::build(
            config,
            Arc::new(store),
            tcp.clone(),
            Some(tcp),
            Arc::new(SystemClock),
        ));

        let loaded = task.init_from_store().await?;
        info!(
            peer_id = %task.local_id,
            db = %db_path.display(),
            resources = loaded,
            "distribution task started"
        );

        task.start_background_tasks(transport_events).await;

        for addr in bootstrap {
            if let Err(e) = task.connect_peer(&addr).await {
                warn!(error = %e, addr = %addr, "failed to reach bootstrap peer");
            }
        }

        Ok(task)
    }

    /// Build a task on an existing store and transport
    ///
    /// Nothing is spawned; feed the transport's events to
    /// [`start_background_tasks`](Self::start_background_tasks) or drive
    /// [`handle_message`](Self::handle_message) by hand.
    pub fn new(
        config: DistributionConfig,
        store: Arc<dyn ChunkStore>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Self::with_clock(config, store, transport, Arc::new(SystemClock))
    }

    /// Like [`new`](Self::new) with an explicit time source
    pub fn with_clock(
        config: DistributionConfig,
        store: Arc<dyn ChunkStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self::build(config, store, transport, None, clock))
    }

    fn build(
        config: DistributionConfig,
        store: Arc<dyn ChunkStore>,
        transport: Arc<dyn Transport>,
        tcp: Option<Arc<TcpTransport>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let local_id = transport.local_id().clone();
        let peers = Arc::new(PeerSet::new());
        let fetcher = Arc::new(PeerFetcher::new(
            transport.clone(),
            peers.clone(),
            config.peer_fetch_timeout(),
        ));
        let ctx = ResourceContext::new(store.clone())
            .with_fetcher(fetcher.clone())
            .with_cache(Arc::new(CacheAccounting::new(config.max_cache_bytes)))
            .with_clock(clock)
            .with_fetch_timeout(config.fetch_timeout())
            .with_commit_at_end(config.commit_at_end);
        let jobs = JobPool::new(
            config.job_pool_size,
            store.clone(),
            config.job_cooldown(),
            peers.clone(),
        );

        let (event_tx, event_rx) = mpsc::channel(1000);

        Self {
            config,
            local_id,
            registry: Mutex::new(HashMap::new()),
            store,
            transport,
            tcp,
            peers,
            fetcher,
            ctx,
            jobs,
            event_tx,
            event_rx: Arc::new(RwLock::new(Some(event_rx))),
            running: Arc::new(RwLock::new(true)),
            tasks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Stop the task
    pub async fn stop(&self) {
        info!("stopping distribution task...");

        {
            let mut running = self.running.write().await;
            *running = false;
        }

        if let Some(tcp) = &self.tcp {
            tcp.shutdown();
        }

        {
            let mut tasks = self.tasks.write().await;
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        info!("distribution task stopped");
    }

    /// Get the event receiver
    ///
    /// Can only be called once - subsequent calls return None.
    pub async fn events(&self) -> Option<mpsc::Receiver<DistributionEvent>> {
        let mut rx = self.event_rx.write().await;
        rx.take()
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &DistributionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    /// Cache accounting shared by every resource of this task
    pub fn cache(&self) -> &Arc<CacheAccounting> {
        &self.ctx.cache
    }

    /// Currently connected peers
    pub async fn peers(&self) -> Vec<PeerId> {
        self.peers.snapshot().await
    }

    /// Check if the task is running
    pub(crate) async fn check_running(&self) -> Result<(), TaskError> {
        let running = self.running.read().await;
        if !*running {
            return Err(TaskError::NotRunning);
        }
        Ok(())
    }

    /// Dial a peer over TCP
    pub async fn connect_peer(&self, addr: &str) -> Result<PeerId, TaskError> {
        self.check_running().await?;
        let tcp = self
            .tcp
            .as_ref()
            .ok_or_else(|| TaskError::Network("task has no TCP transport".to_string()))?;
        let peer = tcp.connect(addr).await?;
        info!(peer = %peer, addr = %addr, "connected to peer");
        Ok(peer)
    }

    /// Queue an event for the application; dropped when nobody keeps up
    pub(crate) async fn emit(&self, event: DistributionEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                debug!(event = ?event, "event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => trace!("event receiver dropped"),
        }
    }

    /// Message announcing `uri` in its current state
    pub(crate) async fn announcement(&self, uri: &str, kind: Notification) -> PeerMessage {
        match kind {
            Notification::Exists => {
                let resource = match self.registry.lock().await.get(uri) {
                    Some(Entry::Resource(resource)) => Some(resource.clone()),
                    _ => None,
                };
                let chunk_count = match resource {
                    Some(resource) => resource.chunk_count().await,
                    None => None,
                };
                PeerMessage::ResourceExists(ResourceExists {
                    uri: uri.to_string(),
                    chunk_count,
                })
            }
            Notification::Invalidated => PeerMessage::ResourceInvalidated(ResourceInvalidated {
                uri: uri.to_string(),
            }),
        }
    }

    /// Tell every connected peer about `uri`
    ///
    /// Each peer is sent the message at most once. A failed send is logged
    /// and the remaining peers are still notified. Returns the number of
    /// peers reached.
    pub async fn notify_peers(&self, uri: &str, kind: Notification) -> usize {
        self.notify_peers_except(uri, kind, None).await
    }

    pub(crate) async fn notify_peers_except(
        &self,
        uri: &str,
        kind: Notification,
        except: Option<&PeerId>,
    ) -> usize {
        let message = self.announcement(uri, kind).await;
        let peers = self.peers.snapshot().await;

        let mut notified = 0;
        for peer in peers.iter().filter(|p| Some(*p) != except) {
            match self.transport.send(peer, &message).await {
                Ok(()) => notified += 1,
                Err(e) => warn!(error = %e, peer = %peer, uri = %uri, "failed to notify peer"),
            }
        }

        debug!(uri = %uri, kind = ?kind, notified, peers = peers.len(), "notified peers");
        notified
    }

    /// Register a newly connected peer and replay every known resource to it
    ///
    /// Returns the number of announcements delivered.
    pub async fn on_peer_connect(&self, peer: PeerId) -> usize {
        if !self.peers.add(peer.clone()).await {
            trace!(peer = %peer, "peer already known");
        }

        let uris = self.resource_uris().await;
        let mut sent = 0;
        for uri in &uris {
            let message = self.announcement(uri, Notification::Exists).await;
            match self.transport.send(&peer, &message).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(error = %e, peer = %peer, uri = %uri, "failed to replay resource");
                }
            }
        }

        info!(peer = %peer, replayed = sent, known = uris.len(), "peer connected");
        sent
    }

    pub async fn on_peer_disconnect(&self, peer: &PeerId) {
        if self.peers.remove(peer).await {
            info!(peer = %peer, "peer disconnected");
        }
    }

    /// Re-announce every resource to every peer. Returns the number of resources.
    pub async fn announce_all(&self) -> usize {
        let uris = self.resource_uris().await;
        for uri in &uris {
            self.notify_peers(uri, Notification::Exists).await;
        }
        uris.len()
    }

    /// URIs of every registered resource, sorted
    pub async fn resource_uris(&self) -> Vec<String> {
        let registry = self.registry.lock().await;
        let mut uris: Vec<String> = registry
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Resource(_)))
            .map(|(uri, _)| uri.clone())
            .collect();
        uris.sort();
        uris
    }

    pub(crate) fn new_resource(&self, uri: &str, chunk_count: Option<u32>) -> Arc<Resource> {
        Arc::new(match chunk_count {
            Some(count) => Resource::with_chunk_count(uri, self.ctx.clone(), count),
            None => Resource::new(uri, self.ctx.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestNetwork, TestTransport};

    async fn task_on(network: &Arc<TestNetwork>, id: &str) -> (Arc<DistributionTask>, Arc<TestTransport>) {
        let (transport, _events) = network.add_node(id).await;
        let store = Arc::new(SqliteChunkStore::open_in_memory().unwrap());
        let task = DistributionTask::new(DistributionConfig::for_testing(), store, transport.clone());
        (task, transport)
    }

    #[tokio::test]
    async fn test_notify_fan_out_survives_failed_peer() {
        let network = TestNetwork::new();
        let (task, transport) = task_on(&network, "a").await;
        let (_b, mut b_events) = network.add_node("b").await;
        let (_c, mut c_events) = network.add_node("c").await;
        let (_d, _d_events) = network.add_node("d").await;

        for peer in ["b", "c", "d"] {
            task.on_peer_connect(PeerId::new(peer)).await;
        }
        network.fail_sends_to(&PeerId::new("d")).await;

        assert!(task.create_resource("/files/x").await.is_some());
        assert_eq!(
            task.notify_peers("/files/x", Notification::Exists).await,
            2
        );

        // one announcement from create_resource, one from the explicit call
        assert_eq!(transport.sent_to(&PeerId::new("b")).await.len(), 2);
        assert_eq!(transport.sent_to(&PeerId::new("d")).await.len(), 0);
        assert!(b_events.try_recv().is_ok());
        assert!(c_events.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_on_peer_connect_replays_resources() {
        let network = TestNetwork::new();
        let (task, transport) = task_on(&network, "a").await;
        let (_b, _b_events) = network.add_node("b").await;

        task.create_resource("/files/one").await.unwrap();
        task.create_resource("/files/two").await.unwrap();
        task.create_directory("/dir").await.unwrap();

        assert_eq!(task.on_peer_connect(PeerId::new("b")).await, 2);
        let uris: Vec<String> = transport
            .sent_to(&PeerId::new("b"))
            .await
            .into_iter()
            .filter_map(|m| match m {
                PeerMessage::ResourceExists(e) => Some(e.uri),
                _ => None,
            })
            .collect();
        assert_eq!(uris, vec!["/files/one".to_string(), "/files/two".to_string()]);

        task.on_peer_disconnect(&PeerId::new("b")).await;
        assert!(task.peers().await.is_empty());
        assert_eq!(task.announce_all().await, 2);
    }

    #[tokio::test]
    async fn test_events_taken_once_and_stop() {
        let network = TestNetwork::new();
        let (task, _) = task_on(&network, "a").await;
        assert!(task.events().await.is_some());
        assert!(task.events().await.is_none());

        task.stop().await;
        assert!(matches!(task.check_running().await, Err(TaskError::NotRunning)));
        assert!(matches!(
            task.connect_peer("127.0.0.1:1").await,
            Err(TaskError::NotRunning)
        ));
    }
}
