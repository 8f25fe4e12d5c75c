//! CLI `monitor` command: run the memory and database monitors in the foreground.

use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentmem::config::AgentMemConfig;
use agentmem::db::DbHealthMonitor;
use agentmem::BackpressureManager;

pub async fn monitor(config: &AgentMemConfig, seconds: u64) -> Result<()> {
    let manager = BackpressureManager::from_config(&config.backpressure);
    let memory = manager.memory();

    let events = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&events);
    let subscription = memory.on_pressure(move |stats| {
        counter.fetch_add(1, Ordering::Relaxed);
        println!(
            "pressure: {:.2} MB of {:.2} MB ({:.2}%)",
            stats.heap_used_mb, stats.heap_limit_mb, stats.utilization_percent
        );
        Ok(())
    });

    println!(
        "Watching memory every {} ms for {seconds}s (threshold {:.0}%)",
        config.backpressure.monitor_interval_ms,
        memory.threshold() * 100.0
    );
    manager.start_monitoring()?;

    // Only watch a database that already exists; the store creates it.
    let health = if config.resolved_db_path().exists() {
        let health = DbHealthMonitor::from_config(config);
        health.start_health_checks()?;
        Some(health)
    } else {
        tracing::info!("no database yet, skipping health checks");
        None
    };

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
        _ = tokio::signal::ctrl_c() => println!("interrupted"),
    }

    manager.stop_monitoring();
    subscription.unsubscribe();
    if let Some(health) = &health {
        health.stop_health_checks();
    }

    let final_stats = memory.check();
    println!();
    println!("Pressure events:     {}", events.load(Ordering::Relaxed));
    println!(
        "Final utilization:   {:.2}% ({})",
        final_stats.utilization_percent,
        if final_stats.under_pressure { "under pressure" } else { "ok" }
    );
    if let Some(health) = health {
        let healthy = health.is_db_healthy().await || health.attempt_reconnect().await;
        let status = health.status();
        println!(
            "Database:            {} ({} reconnects)",
            if healthy { "healthy" } else { "unreachable" },
            status.reconnect_count
        );
    }
    Ok(())
}
