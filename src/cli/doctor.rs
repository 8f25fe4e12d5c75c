//! CLI `doctor` command: probe the database through the health monitor and print a report.

use anyhow::{Context, Result};
use std::sync::PoisonError;

use agentmem::config::AgentMemConfig;
use agentmem::db::{self, DbHealthMonitor};

use super::format_bytes;

pub async fn doctor(config: &AgentMemConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("It is created on first use by the memory store.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    let monitor = DbHealthMonitor::from_config(config);
    let conn = monitor
        .get_db_with_health_check()
        .await
        .context("database did not answer a liveness probe (may be corrupt or locked)")?;

    let report = {
        let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
        db::check_database_health(&conn).context("failed to run health check")?
    };
    let status = monitor.status();

    println!("AgentMem Health Report");
    println!("======================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("SQLite:            v{}", report.sqlite_version);
    println!("Journal mode:      {}", report.journal_mode);
    println!("Busy timeout:      {} ms", report.busy_timeout_ms);
    println!("Pages:             {} x {} B", report.page_count, report.page_size);
    println!();
    println!("Liveness:          {}", if status.healthy { "OK" } else { "FAILED" });
    if let Some(checked) = status.last_check {
        println!("Last check:        {}", checked.to_rfc3339());
    }
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", report.integrity_details);
        println!();
        println!("Recovery steps:");
        println!("  1. Stop every process using the database");
        println!("  2. Restore from a backup: cp backup.db {}", db_path.display());
    }

    Ok(())
}
