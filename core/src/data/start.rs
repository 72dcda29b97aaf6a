//! Database initialization and startup
//!
//! Opens the chunk database and ensures all required tables exist.

use std::path::Path;

use rusqlite::Connection;

use super::schema::create_all_tables;

/// Error type for database startup
#[derive(Debug)]
pub enum StartError {
    /// Parent directory for the database could not be created
    Io(std::io::Error),
    /// SQLite error
    Database(rusqlite::Error),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::Io(e) => write!(f, "io error: {}", e),
            StartError::Database(e) => write!(f, "database error: {}", e),
        }
    }
}

impl std::error::Error for StartError {}

impl From<rusqlite::Error> for StartError {
    fn from(e: rusqlite::Error) -> Self {
        StartError::Database(e)
    }
}

impl From<std::io::Error> for StartError {
    fn from(e: std::io::Error) -> Self {
        StartError::Io(e)
    }
}

/// Opens the chunk database and ensures all required tables exist
///
/// Creates the parent directory when missing. Schema creation is idempotent
/// (`CREATE TABLE IF NOT EXISTS`), so reopening an existing database keeps
/// its content.
pub fn start_db(db_path: impl AsRef<Path>) -> Result<Connection, StartError> {
    let db_path = db_path.as_ref();
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(db_path)?;

    // PRAGMA returns the new mode, so use query_row instead of execute
    let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;

    create_all_tables(&conn)?;
    Ok(conn)
}

/// Create an in-memory database for testing
pub fn start_memory_db() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    // WAL mode doesn't work with in-memory databases, skip it
    create_all_tables(&conn)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_creates_tables_on_new_db() {
        let dir = TempDir::new().unwrap();
        let conn = start_db(dir.path().join("nested").join("chunks.db")).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"chunks".to_string()), "chunks table missing");
    }

    #[test]
    fn test_reopening_db_preserves_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunks.db");

        {
            let conn = start_db(&path).unwrap();
            conn.execute(
                "INSERT INTO chunks (uri, chunk_index, toa, data, hash) VALUES (?1, 0, 1, ?2, ?3)",
                rusqlite::params!["/a", vec![1u8, 2, 3], [0u8; 32].as_slice()],
            )
            .unwrap();
        }

        let conn = start_db(&path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1, "data should be preserved, table not recreated");
    }

    #[test]
    fn test_memory_db() {
        let conn = start_memory_db().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
