//! Distribution task configuration

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a distribution task
#[derive(Clone)]
pub struct DistributionConfig {
    /// Identity announced to peers
    /// If None, a random id is generated at start
    pub peer_id: Option<String>,

    /// Path to the chunk database
    /// If None, uses `flowtree_chunks.db` in the working directory
    pub db_path: Option<PathBuf>,

    /// Address to accept peer connections on (e.g. `0.0.0.0:7766`)
    /// If None, the task only dials out
    pub listen_addr: Option<String>,

    /// Peers to connect to at start (`host:port`)
    pub bootstrap_peers: Vec<String>,

    /// In-memory cache limit across all resources (bytes)
    /// Default: 250 MB
    pub max_cache_bytes: u64,

    /// Number of reusable distribution jobs
    /// Default: 10
    pub job_pool_size: usize,

    /// Cooldown before a dispatched job can be reused (milliseconds)
    /// Default: 10000
    pub job_cooldown_ms: u64,

    /// How often the scheduler dispatches idle jobs (milliseconds)
    /// Default: 1000
    pub schedule_interval_ms: u64,

    /// Bound on one remote chunk fetch across all peers (seconds)
    /// Default: 30
    pub fetch_timeout_secs: u64,

    /// How long to wait for a single peer to answer a chunk request (milliseconds)
    /// Default: 5000
    pub peer_fetch_timeout_ms: u64,

    /// Persist streamed chunks only once the whole stream has been read
    /// Default: false
    pub commit_at_end: bool,
}

impl fmt::Debug for DistributionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributionConfig")
            .field("peer_id", &self.peer_id)
            .field("db_path", &self.db_path)
            .field("listen_addr", &self.listen_addr)
            .field("bootstrap_peers", &self.bootstrap_peers)
            .field("max_cache_bytes", &self.max_cache_bytes)
            .field("job_pool_size", &self.job_pool_size)
            .field("job_cooldown_ms", &self.job_cooldown_ms)
            .field("schedule_interval_ms", &self.schedule_interval_ms)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("peer_fetch_timeout_ms", &self.peer_fetch_timeout_ms)
            .field("commit_at_end", &self.commit_at_end)
            .finish()
    }
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            db_path: None,
            listen_addr: None,
            bootstrap_peers: vec![],
            max_cache_bytes: 250 * 1000 * 1000, // 250 MB
            job_pool_size: 10,
            job_cooldown_ms: 10_000,
            schedule_interval_ms: 1_000,
            fetch_timeout_secs: 30,
            peer_fetch_timeout_ms: 5_000,
            commit_at_end: false,
        }
    }
}

impl DistributionConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the announced peer id
    pub fn with_peer_id(mut self, id: impl Into<String>) -> Self {
        self.peer_id = Some(id.into());
        self
    }

    /// Set the database path
    pub fn with_db_path(mut self, path: PathBuf) -> Self {
        self.db_path = Some(path);
        self
    }

    /// Set the listen address
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Add a bootstrap peer
    pub fn with_bootstrap_peer(mut self, addr: impl Into<String>) -> Self {
        self.bootstrap_peers.push(addr.into());
        self
    }

    /// Set the in-memory cache limit
    pub fn with_max_cache(mut self, bytes: u64) -> Self {
        self.max_cache_bytes = bytes;
        self
    }

    /// Set the job pool size and cooldown
    pub fn with_jobs(mut self, pool_size: usize, cooldown_ms: u64) -> Self {
        self.job_pool_size = pool_size;
        self.job_cooldown_ms = cooldown_ms;
        self
    }

    /// Set the scheduler interval
    pub fn with_schedule_interval(mut self, millis: u64) -> Self {
        self.schedule_interval_ms = millis;
        self
    }

    /// Set the remote fetch timeout
    pub fn with_fetch_timeout(mut self, secs: u64) -> Self {
        self.fetch_timeout_secs = secs;
        self
    }

    /// Set the per-peer fetch timeout
    pub fn with_peer_fetch_timeout(mut self, millis: u64) -> Self {
        self.peer_fetch_timeout_ms = millis;
        self
    }

    /// Defer persistence of streamed chunks to the end of the stream
    pub fn with_commit_at_end(mut self, commit_at_end: bool) -> Self {
        self.commit_at_end = commit_at_end;
        self
    }

    /// Configuration for testing (small cache, fast cycles)
    pub fn for_testing() -> Self {
        Self {
            peer_id: None,
            db_path: None,
            listen_addr: None,
            bootstrap_peers: vec![],
            max_cache_bytes: 10 * 1000 * 1000, // 10 MB
            job_pool_size: 4,
            job_cooldown_ms: 50,
            schedule_interval_ms: 20,
            fetch_timeout_secs: 2,
            peer_fetch_timeout_ms: 200,
            commit_at_end: false,
        }
    }

    pub fn job_cooldown(&self) -> Duration {
        Duration::from_millis(self.job_cooldown_ms)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn peer_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_fetch_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DistributionConfig::default();
        assert_eq!(config.max_cache_bytes, 250_000_000);
        assert_eq!(config.job_pool_size, 10);
        assert_eq!(config.job_cooldown(), Duration::from_secs(10));
        assert!(config.bootstrap_peers.is_empty());
    }

    #[test]
    fn test_builders() {
        let config = DistributionConfig::new()
            .with_peer_id("node-a")
            .with_listen_addr("127.0.0.1:7766")
            .with_bootstrap_peer("10.0.0.2:7766")
            .with_bootstrap_peer("10.0.0.3:7766")
            .with_max_cache(1024)
            .with_jobs(2, 5)
            .with_commit_at_end(true);

        assert_eq!(config.peer_id.as_deref(), Some("node-a"));
        assert_eq!(config.bootstrap_peers.len(), 2);
        assert_eq!(config.max_cache_bytes, 1024);
        assert_eq!(config.job_pool_size, 2);
        assert_eq!(config.job_cooldown(), Duration::from_millis(5));
        assert!(config.commit_at_end);
    }

    #[test]
    fn test_debug_lists_fields() {
        let text = format!("{:?}", DistributionConfig::for_testing());
        assert!(text.contains("max_cache_bytes"));
        assert!(text.contains("schedule_interval_ms"));
    }
}
