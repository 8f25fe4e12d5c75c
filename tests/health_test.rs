mod helpers;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentmem::config::{AgentMemConfig, HealthConfig};
use agentmem::db::{self, DbHealthMonitor};

fn quick_health() -> HealthConfig {
    HealthConfig {
        check_interval_ms: 10,
        max_reconnect_attempts: 3,
        reconnect_delay_ms: 5,
    }
}

#[tokio::test]
async fn from_config_opens_the_configured_file() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db_path = tmp.path().join("nested").join("memory.db");
    let mut config = AgentMemConfig::default();
    config.storage.db_path = db_path.to_string_lossy().into_owned();
    config.health = quick_health();

    let monitor = DbHealthMonitor::from_config(&config);
    let conn = monitor.get_db_with_health_check().await.unwrap();
    assert!(db_path.exists());

    let timeout: i64 = conn
        .lock()
        .unwrap()
        .pragma_query_value(None, "busy_timeout", |row| row.get(0))
        .unwrap();
    assert_eq!(timeout, 5000);
    assert!(monitor.is_db_healthy().await);
}

#[tokio::test]
async fn seeded_connection_is_reused() {
    let (_tmp, _path, conn) = helpers::temp_db();
    let conn = db::shared(conn);
    let monitor = DbHealthMonitor::new(quick_health(), || anyhow::bail!("should not reconnect"))
        .with_connection(Arc::clone(&conn));

    let handed_out = monitor.get_db_with_health_check().await.unwrap();
    assert!(Arc::ptr_eq(&conn, &handed_out));
    assert_eq!(monitor.status().reconnect_count, 0);
}

#[tokio::test]
async fn reconnect_succeeds_after_transient_failures() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let monitor = DbHealthMonitor::new(quick_health(), move || {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            anyhow::bail!("unable to open database file");
        }
        db::open_memory_database()
    });

    assert!(monitor.attempt_reconnect().await);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let status = monitor.status();
    assert!(status.healthy);
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.reconnect_count, 1);
}

#[tokio::test]
async fn periodic_checks_restore_a_missing_connection() {
    let monitor = DbHealthMonitor::new(quick_health(), db::open_memory_database);
    assert!(monitor.connection().is_none());

    monitor.start_health_checks().unwrap();
    monitor.start_health_checks().unwrap();
    assert!(monitor.is_checking());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(monitor.connection().is_some());
    assert!(monitor.status().healthy);

    monitor.stop_health_checks();
    monitor.stop_health_checks();
    assert!(!monitor.is_checking());
}

#[test]
fn health_report_reflects_pragmas() {
    let (_tmp, _path, conn) = helpers::temp_db();
    let report = db::check_database_health(&conn).unwrap();
    assert!(report.integrity_ok);
    assert_eq!(report.journal_mode.to_lowercase(), "wal");
    assert_eq!(report.busy_timeout_ms, 0);
}
