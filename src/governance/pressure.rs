//! Heap-pressure detection and fan-out.
//!
//! [`MemoryPressureMonitor`] compares the process's memory use against a hard
//! limit and notifies subscribers while the ratio stays above the threshold.
//! The memory source is a [`HeapProbe`]; production code uses
//! [`ProcessHeapProbe`] (resident set size via `sysinfo`), tests use
//! [`FixedHeapProbe`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{GovernanceError, GovernanceResult};

/// Default fraction of the limit above which the process is under pressure.
pub const DEFAULT_PRESSURE_THRESHOLD: f64 = 0.85;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Raw memory figures in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSnapshot {
    /// Memory actually in use.
    pub used_bytes: u64,
    /// Memory reserved by the process, used or not.
    pub total_bytes: u64,
    /// Hard ceiling the process must stay under.
    pub limit_bytes: u64,
}

/// Source of [`HeapSnapshot`]s.
pub trait HeapProbe: Send + Sync {
    fn snapshot(&self) -> HeapSnapshot;
}

/// Reads the current process's memory through `sysinfo`.
///
/// Resident set size is reported as used, virtual size as total. The limit is
/// the configured override, or physical memory when none is set.
pub struct ProcessHeapProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
    limit_override: Option<u64>,
}

impl ProcessHeapProbe {
    pub fn new(limit_bytes: Option<u64>) -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| tracing::warn!(error = %e, "cannot determine current pid; heap usage reads as 0"))
            .ok();
        Self {
            system: Mutex::new(System::new()),
            pid,
            limit_override: limit_bytes,
        }
    }
}

impl HeapProbe for ProcessHeapProbe {
    fn snapshot(&self) -> HeapSnapshot {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let (used_bytes, total_bytes) = match self.pid {
            Some(pid) if system.refresh_process(pid) => system
                .process(pid)
                .map(|p| (p.memory(), p.virtual_memory()))
                .unwrap_or_default(),
            _ => (0, 0),
        };
        let limit_bytes = match self.limit_override {
            Some(limit) => limit,
            None => {
                system.refresh_memory();
                system.total_memory()
            }
        };
        HeapSnapshot {
            used_bytes,
            total_bytes: total_bytes.max(used_bytes),
            limit_bytes,
        }
    }
}

/// A probe whose figures are set by hand.
#[derive(Debug, Clone, Default)]
pub struct FixedHeapProbe {
    used: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
    limit: Arc<AtomicU64>,
}

impl FixedHeapProbe {
    pub fn new(used_bytes: u64, limit_bytes: u64) -> Self {
        Self {
            used: Arc::new(AtomicU64::new(used_bytes)),
            total: Arc::new(AtomicU64::new(used_bytes)),
            limit: Arc::new(AtomicU64::new(limit_bytes)),
        }
    }

    /// Convenience constructor taking megabytes.
    pub fn from_mb(used_mb: u64, limit_mb: u64) -> Self {
        Self::new(used_mb * 1024 * 1024, limit_mb * 1024 * 1024)
    }

    pub fn set_used(&self, bytes: u64) {
        self.used.store(bytes, Ordering::Relaxed);
        self.total.fetch_max(bytes, Ordering::Relaxed);
    }

    pub fn set_used_mb(&self, mb: u64) {
        self.set_used(mb * 1024 * 1024);
    }

    pub fn set_total(&self, bytes: u64) {
        self.total.store(bytes, Ordering::Relaxed);
    }
}

impl HeapProbe for FixedHeapProbe {
    fn snapshot(&self) -> HeapSnapshot {
        HeapSnapshot {
            used_bytes: self.used.load(Ordering::Relaxed),
            total_bytes: self.total.load(Ordering::Relaxed),
            limit_bytes: self.limit.load(Ordering::Relaxed),
        }
    }
}

/// Memory figures as reported to callers and subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub heap_used_mb: f64,
    pub heap_total_mb: f64,
    pub heap_limit_mb: f64,
    /// `used / limit * 100`, never relative to `total`.
    pub utilization_percent: f64,
    pub under_pressure: bool,
}

/// Callback invoked on every monitoring tick that finds pressure.
pub type PressureHandler = Arc<dyn Fn(&MemoryStats) -> anyhow::Result<()> + Send + Sync>;

struct Inner {
    threshold: f64,
    probe: Arc<dyn HeapProbe>,
    subscribers: Mutex<Vec<(u64, PressureHandler)>>,
    next_subscriber_id: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let timer = self.timer.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = timer.take() {
            handle.abort();
        }
    }
}

/// Polls heap usage and fans out pressure events. Cloning yields another
/// handle to the same subscribers and timer.
#[derive(Clone)]
pub struct MemoryPressureMonitor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryPressureMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPressureMonitor")
            .field("threshold", &self.inner.threshold)
            .field("monitoring", &self.is_monitoring())
            .finish()
    }
}

impl Default for MemoryPressureMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_PRESSURE_THRESHOLD)
    }
}

impl MemoryPressureMonitor {
    /// Monitor the current process, limited by physical memory.
    pub fn new(threshold: f64) -> Self {
        Self::with_probe(threshold, Arc::new(ProcessHeapProbe::new(None)))
    }

    pub fn with_probe(threshold: f64, probe: Arc<dyn HeapProbe>) -> Self {
        let threshold = if threshold > 0.0 && threshold < 1.0 {
            threshold
        } else {
            tracing::warn!(threshold, "pressure threshold outside (0, 1); using default");
            DEFAULT_PRESSURE_THRESHOLD
        };
        Self {
            inner: Arc::new(Inner {
                threshold,
                probe,
                subscribers: Mutex::new(Vec::new()),
                next_subscriber_id: AtomicU64::new(0),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.inner.threshold
    }

    /// `true` when `used / limit` is strictly above the threshold.
    pub fn is_under_pressure(&self) -> bool {
        self.stats().under_pressure
    }

    pub fn stats(&self) -> MemoryStats {
        let snap = self.inner.probe.snapshot();
        let ratio = if snap.limit_bytes == 0 {
            0.0
        } else {
            snap.used_bytes as f64 / snap.limit_bytes as f64
        };
        MemoryStats {
            heap_used_mb: round2(snap.used_bytes as f64 / BYTES_PER_MB),
            heap_total_mb: round2(snap.total_bytes as f64 / BYTES_PER_MB),
            heap_limit_mb: round2(snap.limit_bytes as f64 / BYTES_PER_MB),
            utilization_percent: round2(ratio * 100.0),
            under_pressure: ratio > self.inner.threshold,
        }
    }

    /// Register a pressure subscriber. Keep the returned handle to unsubscribe later.
    pub fn on_pressure<F>(&self, handler: F) -> PressureSubscription
    where
        F: Fn(&MemoryStats) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers().push((id, Arc::new(handler)));
        PressureSubscription {
            id,
            monitor: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    /// Run one monitoring tick: read stats and, under pressure, notify every
    /// subscriber. A failing subscriber is logged and skipped.
    pub fn check(&self) -> MemoryStats {
        let stats = self.stats();
        if !stats.under_pressure {
            return stats;
        }

        tracing::warn!(
            heap_used_mb = stats.heap_used_mb,
            heap_limit_mb = stats.heap_limit_mb,
            utilization = stats.utilization_percent,
            "memory pressure detected"
        );

        // Snapshot so handlers may subscribe or unsubscribe while running.
        let handlers: Vec<PressureHandler> = self
            .subscribers()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&stats))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "memory pressure subscriber failed"),
                Err(_) => tracing::error!("memory pressure subscriber panicked"),
            }
        }
        stats
    }

    /// Start checking every `interval`. A second call while running is a no-op.
    pub fn start_monitoring(&self, interval: Duration) -> GovernanceResult<()> {
        let mut timer = self.timer();
        if timer.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::debug!("memory monitoring already running");
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| GovernanceError::NoRuntime {
            component: "memory pressure monitor",
        })?;

        let weak = Arc::downgrade(&self.inner);
        let period = interval.max(Duration::from_millis(1));
        *timer = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; checks start one period in.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                MemoryPressureMonitor { inner }.check();
            }
        }));
        tracing::info!(interval_ms = period.as_millis() as u64, "memory monitoring started");
        Ok(())
    }

    /// Cancel the monitoring timer. Safe to call when not running.
    pub fn stop_monitoring(&self) {
        if let Some(handle) = self.timer().take() {
            handle.abort();
            tracing::info!("memory monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.timer().as_ref().is_some_and(|h| !h.is_finished())
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<(u64, PressureHandler)>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle returned by [`MemoryPressureMonitor::on_pressure`].
///
/// Dropping it leaves the subscriber registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[derive(Debug)]
pub struct PressureSubscription {
    id: u64,
    monitor: Weak<Inner>,
}

impl PressureSubscription {
    /// Remove the subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.monitor.upgrade() else {
            return false;
        };
        let mut subs = inner.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|(id, _)| *id != self.id);
        subs.len() != before
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
