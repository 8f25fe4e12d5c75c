pub mod health;
pub mod retry;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use health::{DbHealthMonitor, HealthStatus};
pub use retry::{is_retryable_db_error, transaction_with_retry, RetryPolicy};

/// A connection shared between async callers. Work on it runs on the
/// blocking pool with the mutex held.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Open (or create) the database at the given path with the store's pragmas applied.
pub fn open_database(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    // WAL lets readers proceed while a writer holds the lock
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(busy_timeout)?;

    tracing::info!(path = %path.display(), "database opened");
    Ok(conn)
}

/// Open an in-memory database for testing.
pub fn open_memory_database() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// Wrap a connection for use with [`transaction_with_retry`] and [`DbHealthMonitor`].
pub fn shared(conn: Connection) -> SharedConnection {
    Arc::new(Mutex::new(conn))
}

#[derive(Debug, Clone)]
pub struct DatabaseHealthReport {
    pub integrity_ok: bool,
    /// Output of `PRAGMA integrity_check` when it is not `ok`.
    pub integrity_details: String,
    pub sqlite_version: String,
    pub journal_mode: String,
    pub busy_timeout_ms: i64,
    pub page_count: i64,
    pub page_size: i64,
}

impl DatabaseHealthReport {
    pub fn size_bytes(&self) -> i64 {
        self.page_count * self.page_size
    }
}

/// Run integrity and configuration checks against an open connection.
pub fn check_database_health(conn: &Connection) -> Result<DatabaseHealthReport> {
    let integrity: Vec<String> = {
        let mut stmt = conn.prepare("PRAGMA integrity_check")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    let integrity_ok = integrity.len() == 1 && integrity[0] == "ok";

    let sqlite_version: String = conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
    let journal_mode: String = conn.pragma_query_value(None, "journal_mode", |row| row.get(0))?;
    let busy_timeout_ms: i64 = conn.pragma_query_value(None, "busy_timeout", |row| row.get(0))?;
    let page_count: i64 = conn.pragma_query_value(None, "page_count", |row| row.get(0))?;
    let page_size: i64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;

    Ok(DatabaseHealthReport {
        integrity_ok,
        integrity_details: if integrity_ok { String::new() } else { integrity.join("; ") },
        sqlite_version,
        journal_mode,
        busy_timeout_ms,
        page_count,
        page_size,
    })
}
