//! Peer message handlers
//!
//! - `incoming/`: transport events and the messages peers send us

pub(crate) mod incoming;
