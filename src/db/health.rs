//! Connection liveness probing and bounded reconnect.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::SharedConnection;
use crate::config::{AgentMemConfig, HealthConfig};
use crate::error::{GovernanceError, GovernanceResult};

/// Opens a fresh connection for reconnect attempts.
pub type Connector = Arc<dyn Fn() -> Result<Connection> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub reconnect_count: u64,
}

#[derive(Default)]
struct State {
    conn: Option<SharedConnection>,
    healthy: bool,
    last_check: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    reconnect_count: u64,
}

struct Inner {
    config: HealthConfig,
    connect: Connector,
    state: Mutex<State>,
    /// Serializes reconnects so concurrent callers don't open several connections.
    reconnecting: tokio::sync::Mutex<()>,
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

/// Tracks the health of one cached connection and replaces it when it stops answering.
#[derive(Clone)]
pub struct DbHealthMonitor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DbHealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbHealthMonitor")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

impl DbHealthMonitor {
    pub fn new(config: HealthConfig, connect: impl Fn() -> Result<Connection> + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connect: Arc::new(connect),
                state: Mutex::new(State::default()),
                reconnecting: tokio::sync::Mutex::new(()),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Monitor the configured database file.
    pub fn from_config(config: &AgentMemConfig) -> Self {
        let path = config.resolved_db_path();
        let busy_timeout = Duration::from_millis(config.storage.busy_timeout_ms);
        Self::new(config.health.clone(), move || super::open_database(&path, busy_timeout))
    }

    /// Seed the monitor with an already-open connection.
    pub fn with_connection(self, conn: SharedConnection) -> Self {
        {
            let mut state = self.state();
            state.conn = Some(conn);
            state.healthy = true;
        }
        self
    }

    /// The cached connection, without probing it.
    pub fn connection(&self) -> Option<SharedConnection> {
        self.state().conn.clone()
    }

    /// Probe the cached connection with `SELECT 1`. Never fails: any error,
    /// or having no connection at all, reports `false`.
    pub async fn is_db_healthy(&self) -> bool {
        let Some(conn) = self.connection() else {
            self.record_check(false);
            return false;
        };
        let healthy = probe(conn).await;
        self.record_check(healthy);
        healthy
    }

    /// Try to open a new connection up to `max_reconnect_attempts` times,
    /// sleeping `reconnect_delay_ms` between tries. Returns whether a live
    /// connection is now cached.
    pub async fn attempt_reconnect(&self) -> bool {
        let _guard = self.inner.reconnecting.lock().await;
        let attempts = self.inner.config.max_reconnect_attempts.max(1);
        let delay = Duration::from_millis(self.inner.config.reconnect_delay_ms);

        for attempt in 1..=attempts {
            let connect = Arc::clone(&self.inner.connect);
            let opened = tokio::task::spawn_blocking(move || connect())
                .await
                .context("connect task panicked")
                .and_then(|r| r);

            match opened {
                Ok(conn) => {
                    let conn = super::shared(conn);
                    if probe(Arc::clone(&conn)).await {
                        {
                            let mut state = self.state();
                            state.conn = Some(conn);
                            state.reconnect_count += 1;
                        }
                        self.record_check(true);
                        tracing::info!(attempt, "database reconnected");
                        return true;
                    }
                    tracing::warn!(attempt, "reconnected database failed liveness probe");
                }
                Err(e) => tracing::warn!(attempt, error = %e, "database reconnect failed"),
            }

            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }

        self.record_check(false);
        tracing::error!(attempts, "database reconnect attempts exhausted");
        false
    }

    /// Return a live connection, reconnecting first if the cached one is unhealthy.
    pub async fn get_db_with_health_check(&self) -> Result<SharedConnection> {
        if self.is_db_healthy().await {
            if let Some(conn) = self.connection() {
                return Ok(conn);
            }
        }
        if self.attempt_reconnect().await {
            if let Some(conn) = self.connection() {
                return Ok(conn);
            }
        }
        anyhow::bail!(
            "database unavailable after {} reconnect attempts",
            self.inner.config.max_reconnect_attempts.max(1)
        )
    }

    /// Probe every `check_interval_ms` and reconnect when the probe fails.
    /// A second call while running is a no-op.
    pub fn start_health_checks(&self) -> GovernanceResult<()> {
        let mut timer = self.timer();
        if timer.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| GovernanceError::NoRuntime {
            component: "database health monitor",
        })?;

        let weak = Arc::downgrade(&self.inner);
        let period = Duration::from_millis(self.inner.config.check_interval_ms.max(1));
        *timer = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let monitor = DbHealthMonitor { inner };
                if !monitor.is_db_healthy().await {
                    tracing::warn!("database health check failed, reconnecting");
                    monitor.attempt_reconnect().await;
                }
            }
        }));
        tracing::info!(interval_ms = period.as_millis() as u64, "database health checks started");
        Ok(())
    }

    /// Cancel periodic checks. Safe to call when not running.
    pub fn stop_health_checks(&self) {
        if let Some(handle) = self.timer().take() {
            handle.abort();
            tracing::info!("database health checks stopped");
        }
    }

    pub fn is_checking(&self) -> bool {
        self.timer().as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn status(&self) -> HealthStatus {
        let state = self.state();
        HealthStatus {
            healthy: state.healthy,
            last_check: state.last_check,
            consecutive_failures: state.consecutive_failures,
            reconnect_count: state.reconnect_count,
        }
    }

    fn record_check(&self, healthy: bool) {
        let mut state = self.state();
        state.healthy = healthy;
        state.last_check = Some(Utc::now());
        if healthy {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn probe(conn: SharedConnection) -> bool {
    let result = tokio::task::spawn_blocking(move || {
        let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
    })
    .await;
    match result {
        Ok(Ok(1)) => true,
        Ok(Ok(_)) => false,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "database liveness probe failed");
            false
        }
        Err(e) => {
            tracing::debug!(error = %e, "database liveness probe panicked");
            false
        }
    }
}
