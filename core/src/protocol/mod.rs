//! Distribution task - public interface
//!
//! This module provides the public API of a flowtree node.
//! External code imports types and methods from here.
//!
//! # Module Structure
//!
//! - `core.rs`: DistributionTask struct, start/stop, peer notification
//! - `config.rs`: DistributionConfig builder
//! - `error.rs`: TaskError
//! - `events.rs`: events for the application layer
//! - `registry.rs`: resource and directory operations
//!
//! # Example
//!
//! ```ignore
//! use flowtree_core::{DistributionConfig, DistributionTask};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DistributionConfig::new().with_listen_addr("0.0.0.0:7400");
//!     let task = DistributionTask::start(config).await?;
//!
//!     let resource = task.create_resource("/files/notes").await;
//!
//!     task.stop().await;
//!     Ok(())
//! }
//! ```

mod config;
pub(crate) mod core;
mod error;
mod events;
pub(crate) mod registry;

// Core task
pub use config::DistributionConfig;
pub use core::{DistributionTask, Notification};

// Error type
pub use error::TaskError;

// Events (for app layer)
pub use events::{
    ChunkReceivedEvent, DistributionEvent, ResourceAddedEvent, ResourceInvalidatedEvent,
    SizeMismatchEvent,
};

// Registry types
pub use registry::{DirectoryEntry, ResourceProvider, FILES_DIR};
