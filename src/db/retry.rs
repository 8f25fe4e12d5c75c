//! Transaction execution with retry on storage contention.

use std::error::Error as StdError;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, ErrorCode};

use super::SharedConnection;
use crate::config::RetryConfig;

/// Lowercased message fragments that indicate lock contention.
const CONTENTION_PHRASES: &[&str] = &[
    "database is locked",
    "database is busy",
    "database table is locked",
    "sqlite_busy",
    "sqlite_locked",
    "sqlite_protocol",
];

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        let max_delay = Duration::from_millis(config.max_delay_ms);
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms).min(max_delay),
            max_delay,
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based): the initial delay
    /// scaled by the multiplier per attempt, capped at the maximum.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial_delay.as_secs_f64() * 1000.0;
        let max_ms = self.max_delay.as_secs_f64() * 1000.0;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let ms = (initial_ms * self.backoff_multiplier.powi(exponent))
            .min(max_ms)
            .max(0.0);
        Duration::from_secs_f64(ms / 1000.0)
    }

    /// Total number of times the work may run.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// `true` if `err`, or anything in its source chain, is transient lock contention.
///
/// Constraint violations and every other failure are not retryable.
pub fn is_retryable_db_error(err: &(dyn StdError + 'static)) -> bool {
    std::iter::successors(Some(err), |&e| e.source()).any(|e| {
        if let Some(sqlite) = e.downcast_ref::<rusqlite::Error>() {
            if matches!(
                sqlite.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::FileLockingProtocolFailed)
            ) {
                return true;
            }
        }
        let message = e.to_string().to_lowercase();
        CONTENTION_PHRASES.iter().any(|phrase| message.contains(phrase))
    })
}

fn is_retryable(err: &anyhow::Error) -> bool {
    let err: &(dyn StdError + 'static) = err.as_ref();
    is_retryable_db_error(err)
}

enum Attempt<T> {
    Committed(T),
    /// The connection was already inside a transaction; `work` ran as-is.
    Direct(Result<T>),
    Failed(anyhow::Error),
}

/// Run `work` inside a transaction, retrying with exponential backoff while it
/// fails with lock contention.
///
/// Runs at most `policy.max_retries + 1` times. Non-retryable errors return
/// immediately; after the last attempt the last error is returned. If the
/// connection is already inside a transaction, `work` runs exactly once on it
/// and the caller's transaction decides the outcome.
pub async fn transaction_with_retry<T, F>(db: &SharedConnection, policy: &RetryPolicy, work: F) -> Result<T>
where
    T: Send + 'static,
    F: Fn(&Connection) -> Result<T> + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let mut attempt = 0u32;

    loop {
        let db = Arc::clone(db);
        let work = Arc::clone(&work);
        let outcome = tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().unwrap_or_else(PoisonError::into_inner);
            if !conn.is_autocommit() {
                return Attempt::Direct(work(&conn));
            }
            match run_in_transaction(&mut conn, work.as_ref()) {
                Ok(value) => Attempt::Committed(value),
                Err(e) => Attempt::Failed(e),
            }
        })
        .await
        .context("transaction worker panicked")?;

        let err = match outcome {
            Attempt::Committed(value) => {
                if attempt > 0 {
                    tracing::debug!(attempts = attempt + 1, "transaction committed after retry");
                }
                return Ok(value);
            }
            Attempt::Direct(result) => return result,
            Attempt::Failed(err) => err,
        };

        if !is_retryable(&err) {
            return Err(err);
        }
        if attempt >= policy.max_retries {
            tracing::error!(
                attempts = attempt + 1,
                error = %err,
                "transaction failed, retries exhausted"
            );
            return Err(err);
        }

        let delay = policy.delay_for(attempt);
        tracing::warn!(
            attempt = attempt + 1,
            max_attempts = policy.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "database busy, retrying transaction"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

fn run_in_transaction<T>(conn: &mut Connection, work: &(dyn Fn(&Connection) -> Result<T> + Send + Sync)) -> Result<T> {
    let tx = conn.transaction()?;
    let value = work(&tx)?;
    tx.commit()?;
    Ok(value)
}
