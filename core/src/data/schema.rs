//! Database schema definitions for the chunk store
//!
//! `chunks` holds every chunk this node keeps on disk, keyed by resource URI
//! and chunk index. `resources` remembers the byte length of resources that
//! were loaded completely, so a reopened resource knows where it ends.

use rusqlite::Connection;

/// Creates all required database tables
pub fn create_all_tables(conn: &Connection) -> rusqlite::Result<()> {
    create_chunk_table(conn)?;
    create_resource_table(conn)?;
    Ok(())
}

/// Chunk table: persisted resource content
///
/// - `toa` is the time of arrival (Unix millis), strictly increasing per URI
/// - `hash` is the BLAKE3 digest of `data` (32 bytes)
/// - `dups` counts the known remote copies of the chunk
///
/// The least-duplicated lookup orders by `(dups, toa)`, so both are indexed.
pub fn create_chunk_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS chunks (
            uri TEXT NOT NULL,
            chunk_index INTEGER NOT NULL CHECK (chunk_index >= 0),
            toa INTEGER NOT NULL,
            data BLOB NOT NULL,
            hash BLOB NOT NULL CHECK (length(hash) = 32),
            dups INTEGER NOT NULL DEFAULT 0 CHECK (dups >= 0),
            PRIMARY KEY (uri, chunk_index)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_chunks_scarcity ON chunks(dups, toa)",
        [],
    )?;

    Ok(())
}

/// Resource table: byte length of fully loaded resources
pub fn create_resource_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS resources (
            uri TEXT PRIMARY KEY,
            total_bytes INTEGER NOT NULL CHECK (total_bytes >= 0)
        )",
        [],
    )?;
    Ok(())
}
