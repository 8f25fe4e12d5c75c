use anyhow::Result;
use serde_json::json;
use std::sync::Arc;

use agentmem::config::AgentMemConfig;
use agentmem::governance::{MemoryPressureMonitor, MemoryStats, ProcessHeapProbe};

/// Print process memory and the configured governance defaults.
///
/// Registries live inside the running store, so this one-shot command has no
/// semaphores, queues or rate limiters to report.
pub fn stats(config: &AgentMemConfig, json: bool) -> Result<()> {
    let memory_monitor = memory_monitor(config);
    let memory = memory_monitor.stats();

    if json {
        let report = json_report(config, &memory, memory_monitor.threshold());
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Memory");
    println!("{}", "=".repeat(40));
    println!("  Used:                {:.2} MB", memory.heap_used_mb);
    println!("  Allocated:           {:.2} MB", memory.heap_total_mb);
    println!("  Limit:               {:.2} MB", memory.heap_limit_mb);
    println!("  Utilization:         {:.2}%", memory.utilization_percent);
    println!(
        "  Threshold:           {:.0}%",
        memory_monitor.threshold() * 100.0
    );
    println!(
        "  Under pressure:      {}",
        if memory.under_pressure { "yes" } else { "no" }
    );
    println!();

    let defaults = &config.backpressure;
    println!("Defaults");
    println!("{}", "=".repeat(40));
    println!("  Max concurrent:      {}", defaults.default_max_concurrent);
    println!("  Queue size:          {}", defaults.default_queue_size);
    println!(
        "  Rate limit:          {} tokens, {}/s",
        defaults.default_max_tokens, defaults.default_refill_rate
    );
    match defaults.acquire_timeout_ms {
        Some(ms) => println!("  Acquire timeout:     {ms} ms"),
        None => println!("  Acquire timeout:     none"),
    }
    println!();

    println!(
        "Retry policy:          {} retries, {}..{} ms, x{}",
        config.retry.max_retries,
        config.retry.initial_delay_ms,
        config.retry.max_delay_ms,
        config.retry.backoff_multiplier
    );

    Ok(())
}

fn memory_monitor(config: &AgentMemConfig) -> MemoryPressureMonitor {
    let limit = config
        .backpressure
        .heap_limit_mb
        .map(|mb| mb.saturating_mul(1024 * 1024));
    MemoryPressureMonitor::with_probe(
        config.backpressure.memory_threshold,
        Arc::new(ProcessHeapProbe::new(limit)),
    )
}

fn json_report(config: &AgentMemConfig, memory: &MemoryStats, threshold: f64) -> serde_json::Value {
    let defaults = &config.backpressure;
    json!({
        "memoryPressure": memory,
        "threshold": threshold,
        "defaults": {
            "maxConcurrent": defaults.default_max_concurrent,
            "queueSize": defaults.default_queue_size,
            "maxTokens": defaults.default_max_tokens,
            "refillRate": defaults.default_refill_rate,
            "acquireTimeoutMs": defaults.acquire_timeout_ms,
        },
        "retry": {
            "maxRetries": config.retry.max_retries,
            "initialDelayMs": config.retry.initial_delay_ms,
            "maxDelayMs": config.retry.max_delay_ms,
            "backoffMultiplier": config.retry.backoff_multiplier,
        },
    })
}
