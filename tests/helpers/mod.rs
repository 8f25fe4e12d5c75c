#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use agentmem::config::BackpressureConfig;
use agentmem::db::{self, RetryPolicy, SharedConnection};
use agentmem::governance::FixedHeapProbe;
use agentmem::BackpressureManager;
use rusqlite::Connection;
use tempfile::TempDir;

/// Open a file-backed database in a fresh temp dir. Keep the `TempDir` alive
/// for as long as the connection is used.
pub fn temp_db() -> (TempDir, std::path::PathBuf, Connection) {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("memory.db");
    let conn = db::open_database(&path, Duration::from_millis(0)).unwrap();
    conn.execute_batch(
        "CREATE TABLE tools (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            version INTEGER NOT NULL DEFAULT 1
        );",
    )
    .unwrap();
    (tmp, path, conn)
}

/// A second connection to `path` that fails immediately instead of waiting on locks.
pub fn impatient_connection(path: &std::path::Path) -> SharedConnection {
    db::shared(db::open_database(path, Duration::from_millis(0)).unwrap())
}

pub fn tool_count(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM tools", [], |row| row.get(0))
        .unwrap()
}

/// Retry policy with millisecond delays so tests stay quick.
pub fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(40),
        backoff_multiplier: 2.0,
    }
}

/// A manager whose memory readings are controlled by the returned probe.
/// Starts at 100 MB used of a 1000 MB limit.
pub fn test_manager() -> (BackpressureManager, FixedHeapProbe) {
    let probe = FixedHeapProbe::from_mb(100, 1000);
    let manager =
        BackpressureManager::with_probe(&BackpressureConfig::default(), Arc::new(probe.clone()));
    (manager, probe)
}
