//! Chunk table operations
//!
//! Every function takes a plain `&Connection`; locking is the caller's job
//! (see [`super::store::SqliteChunkStore`]).

use rusqlite::{params, Connection, OptionalExtension};

/// A chunk row as read back from the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    pub uri: String,
    pub index: u32,
    pub toa: i64,
    pub data: Vec<u8>,
    pub hash: [u8; 32],
    pub dups: u32,
}

/// The scarcest chunk in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeastDuplicated {
    pub uri: String,
    pub index: u32,
    pub dups: u32,
    pub toa: i64,
}

fn parse_u32_from_i64(value: i64, column_index: usize) -> rusqlite::Result<u32> {
    u32::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(column_index, value))
}

fn parse_hash(vec: &[u8], column_index: usize) -> rusqlite::Result<[u8; 32]> {
    if vec.len() != 32 {
        return Err(rusqlite::Error::InvalidColumnType(
            column_index,
            "hash".to_string(),
            rusqlite::types::Type::Blob,
        ));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(vec);
    Ok(out)
}

fn parse_stored_chunk_row(row: &rusqlite::Row) -> rusqlite::Result<StoredChunk> {
    let index_raw: i64 = row.get(1)?;
    let hash_vec: Vec<u8> = row.get(4)?;
    let dups_raw: i64 = row.get(5)?;

    Ok(StoredChunk {
        uri: row.get(0)?,
        index: parse_u32_from_i64(index_raw, 1)?,
        toa: row.get(2)?,
        data: row.get(3)?,
        hash: parse_hash(&hash_vec, 4)?,
        dups: parse_u32_from_i64(dups_raw, 5)?,
    })
}

/// Insert or replace a chunk
///
/// Content and time of arrival are overwritten; the duplication count of an
/// existing row is kept, since re-storing identical content does not change
/// how many peers hold it.
pub fn upsert_chunk(
    conn: &Connection,
    toa: i64,
    data: &[u8],
    uri: &str,
    index: u32,
) -> rusqlite::Result<()> {
    let hash = blake3::hash(data);
    conn.execute(
        "INSERT INTO chunks (uri, chunk_index, toa, data, hash, dups)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)
         ON CONFLICT(uri, chunk_index) DO UPDATE SET
             toa = excluded.toa,
             data = excluded.data,
             hash = excluded.hash",
        params![uri, i64::from(index), toa, data, hash.as_bytes().as_slice()],
    )?;
    Ok(())
}

/// Get the payload of one chunk
pub fn get_chunk_data(conn: &Connection, uri: &str, index: u32) -> rusqlite::Result<Option<Vec<u8>>> {
    conn.query_row(
        "SELECT data FROM chunks WHERE uri = ?1 AND chunk_index = ?2",
        params![uri, i64::from(index)],
        |row| row.get(0),
    )
    .optional()
}

/// Get the time of arrival of one chunk
pub fn get_chunk_toa(conn: &Connection, uri: &str, index: u32) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT toa FROM chunks WHERE uri = ?1 AND chunk_index = ?2",
        params![uri, i64::from(index)],
        |row| row.get(0),
    )
    .optional()
}

/// Highest time of arrival stored for a resource
pub fn get_latest_toa(conn: &Connection, uri: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT MAX(toa) FROM chunks WHERE uri = ?1", [uri], |row| {
        row.get(0)
    })
}

/// Store a chunk that just arrived
///
/// The time of arrival is `now`, or one past the newest chunk of the same
/// resource when that is not earlier, so stamps within a resource stay
/// strictly increasing. Returns the stamp used.
pub fn insert_arrival(
    conn: &Connection,
    now: i64,
    data: &[u8],
    uri: &str,
    index: u32,
) -> rusqlite::Result<i64> {
    let tx = conn.unchecked_transaction()?;
    let toa = match get_latest_toa(&tx, uri)? {
        Some(last) if last >= now => last + 1,
        _ => now,
    };
    upsert_chunk(&tx, toa, data, uri, index)?;
    tx.commit()?;
    Ok(toa)
}

/// Get the full row of one chunk
pub fn get_chunk(conn: &Connection, uri: &str, index: u32) -> rusqlite::Result<Option<StoredChunk>> {
    conn.query_row(
        "SELECT uri, chunk_index, toa, data, hash, dups FROM chunks
         WHERE uri = ?1 AND chunk_index = ?2",
        params![uri, i64::from(index)],
        parse_stored_chunk_row,
    )
    .optional()
}

/// Get every chunk of a resource, ordered by index
pub fn get_chunks_for_uri(conn: &Connection, uri: &str) -> rusqlite::Result<Vec<StoredChunk>> {
    let mut stmt = conn.prepare(
        "SELECT uri, chunk_index, toa, data, hash, dups FROM chunks
         WHERE uri = ?1 ORDER BY chunk_index",
    )?;
    let rows = stmt.query_map([uri], parse_stored_chunk_row)?;
    rows.collect()
}

/// List the distinct URIs with stored chunks or a recorded size
pub fn list_uris(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT uri FROM chunks UNION SELECT uri FROM resources ORDER BY uri",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

/// Delete one chunk. Returns whether a row was removed.
pub fn delete_chunk(conn: &Connection, uri: &str, index: u32) -> rusqlite::Result<bool> {
    let removed = conn.execute(
        "DELETE FROM chunks WHERE uri = ?1 AND chunk_index = ?2",
        params![uri, i64::from(index)],
    )?;
    Ok(removed > 0)
}

/// Delete every chunk of a resource. Returns the number of rows removed.
pub fn delete_uri(conn: &Connection, uri: &str) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM chunks WHERE uri = ?1", [uri])
}

/// Find the chunk with the fewest known remote copies
///
/// Ties are broken by the earliest time of arrival, then by URI and index so
/// the answer is deterministic.
pub fn get_least_duplicated(conn: &Connection) -> rusqlite::Result<Option<LeastDuplicated>> {
    conn.query_row(
        "SELECT uri, chunk_index, dups, toa FROM chunks
         ORDER BY dups ASC, toa ASC, uri ASC, chunk_index ASC
         LIMIT 1",
        [],
        |row| {
            let index_raw: i64 = row.get(1)?;
            let dups_raw: i64 = row.get(2)?;
            Ok(LeastDuplicated {
                uri: row.get(0)?,
                index: parse_u32_from_i64(index_raw, 1)?,
                dups: parse_u32_from_i64(dups_raw, 2)?,
                toa: row.get(3)?,
            })
        },
    )
    .optional()
}

/// Bump the duplication count of a chunk. Returns whether the chunk exists.
pub fn increment_duplication(conn: &Connection, uri: &str, index: u32) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE chunks SET dups = dups + 1 WHERE uri = ?1 AND chunk_index = ?2",
        params![uri, i64::from(index)],
    )?;
    Ok(updated > 0)
}

/// Pick the scarcest chunk and record one more copy of it
///
/// Selection and increment run in one transaction, so two callers never
/// claim the same chunk at the same count. The returned `dups` is the count
/// after the increment.
pub fn claim_least_duplicated(conn: &Connection) -> rusqlite::Result<Option<LeastDuplicated>> {
    let tx = conn.unchecked_transaction()?;
    let Some(mut least) = get_least_duplicated(&tx)? else {
        return Ok(None);
    };
    increment_duplication(&tx, &least.uri, least.index)?;
    tx.commit()?;

    least.dups += 1;
    Ok(Some(least))
}

/// Record the byte length of a fully loaded resource
pub fn set_resource_size(conn: &Connection, uri: &str, total_bytes: u64) -> rusqlite::Result<()> {
    let total = i64::try_from(total_bytes)
        .map_err(|_| rusqlite::Error::ToSqlConversionFailure("resource too large".into()))?;
    conn.execute(
        "INSERT INTO resources (uri, total_bytes) VALUES (?1, ?2)
         ON CONFLICT(uri) DO UPDATE SET total_bytes = excluded.total_bytes",
        params![uri, total],
    )?;
    Ok(())
}

/// Byte length recorded for a resource
pub fn get_resource_size(conn: &Connection, uri: &str) -> rusqlite::Result<Option<u64>> {
    let total: Option<i64> = conn
        .query_row(
            "SELECT total_bytes FROM resources WHERE uri = ?1",
            [uri],
            |row| row.get(0),
        )
        .optional()?;
    total
        .map(|t| u64::try_from(t).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(0, t)))
        .transpose()
}

/// Forget the recorded size of a resource. Returns whether one was recorded.
pub fn delete_resource_size(conn: &Connection, uri: &str) -> rusqlite::Result<bool> {
    let removed = conn.execute("DELETE FROM resources WHERE uri = ?1", [uri])?;
    Ok(removed > 0)
}
