//! Flowtree Core
//!
//! A distributed chunk cache: resources are split into fixed-size chunks,
//! kept in memory while hot, persisted to a local SQLite store and spread
//! across peers by replication jobs that always pick the scarcest chunk.
//!
//! This crate provides:
//! - A shared namespace of resources and directories per task
//! - Lazy chunk loading from memory, the local store, then peers
//! - Existence/invalidation announcements between peers
//! - Scarcity-driven chunk replication
//!
//! # Module Structure
//!
//! - `protocol/`: Public interface (DistributionTask, config, events, registry)
//! - `handlers/`: Peer message handlers
//! - `tasks/`: Background loops (incoming events, job scheduler, eviction)
//! - `resource/`: Chunked resources, cache accounting and URIs
//! - `jobs/`: Distribution jobs and their receiving side
//! - `network/`: Wire format, transport and peer bookkeeping
//! - `data/`: SQLite chunk store
//! - `testing/`: Test utilities
//!
//! # Quick Start
//!
//! ```ignore
//! use flowtree_core::{DistributionConfig, DistributionTask};
//! use tokio::io::AsyncWriteExt;
//!
//! let task = DistributionTask::start(DistributionConfig::for_testing()).await?;
//!
//! // Write a new resource; peers are told once it is loaded
//! let (mut writer, loaded) = task.open_writer("/files/hello").await?;
//! writer.write_all(b"Hello!").await?;
//! drop(writer);
//! loaded.await??;
//!
//! // Follow what peers do
//! let mut events = task.events().await.unwrap();
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

// Public interface
pub mod protocol;

// Internal modules
pub(crate) mod handlers;
pub(crate) mod tasks;

// Infrastructure modules (pub for flexibility)
pub mod data;
pub mod jobs;
pub mod network;
pub mod resource;
pub mod testing;

// Re-export main API types for convenience
pub use protocol::{
    DistributionConfig,
    DistributionEvent,
    DistributionTask,
    Notification,
    ResourceProvider,
    TaskError,
};
pub use resource::{ChunkLookup, Resource};
