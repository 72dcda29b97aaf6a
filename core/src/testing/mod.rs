//! Testing utilities for flowtree
//!
//! Provides an in-process simulation of a peer network so distribution tasks
//! can be exercised without sockets.
//!
//! # Example
//!
//! ```ignore
//! let network = TestNetwork::new();
//!
//! let alice = TestNode::start(&network, "alice").await?;
//! let bob = TestNode::start(&network, "bob").await?;
//! network.connect(&alice.id(), &bob.id()).await;
//!
//! // alice's announcement reaches bob
//! alice.task.create_resource("/files/report").await;
//! ```

pub mod network;
pub mod node;
pub mod store;

pub use network::{TestNetwork, TestTransport};
pub use node::TestNode;
pub use store::FaultyStore;
