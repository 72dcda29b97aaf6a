//! Data layer for the chunk store
//!
//! Provides storage and retrieval for:
//! - Chunk payloads keyed by (resource URI, chunk index)
//! - Time of arrival per chunk
//! - Duplication counts used to pick the scarcest chunk
//!
//! Organized as:
//! - `schema` - table definitions
//! - `start` - opening the database
//! - `chunks` - SQL operations on `&Connection`
//! - `store` - the async [`ChunkStore`] contract and its SQLite implementation

pub mod chunks;
pub mod schema;
pub mod start;
pub mod store;

pub use chunks::{LeastDuplicated, StoredChunk};
pub use schema::create_all_tables;
pub use start::{start_db, start_memory_db, StartError};
pub use store::{ChunkStore, SqliteChunkStore, StoreError};

/// Current Unix time in milliseconds
pub fn current_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
