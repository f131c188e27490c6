use crate::core::error::{self, StoreError};
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Busy timeout for every connection the store opens.
const BUSY_TIMEOUT_SECS: u64 = 5;

pub fn db_connect(db_path: &Path) -> Result<Connection, error::StoreError> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
    Ok(conn)
}

/// Opens an existing database for reading; WAL lets these run beside the writer.
pub fn db_connect_read(db_path: &Path) -> Result<Connection, error::StoreError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS))?;
    Ok(conn)
}
