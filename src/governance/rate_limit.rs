//! Token-bucket rate limiter for throttling external calls (embedding
//! providers, sync adapters).
//!
//! Tokens refill continuously at `refill_rate` per second up to `max_tokens`.
//! The balance is fractional internally so low refill rates still accrue
//! between observations; callers only ever see floored values.
//!
//! There is no fairness among callers suspended in [`TokenBucketRateLimiter::consume`]:
//! each one sleeps for its own estimated wait and retries, so under contention
//! a later caller can win. Put a [`Semaphore`](super::Semaphore) in front of
//! the limiter when ordering matters.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{GovernanceError, GovernanceResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// Bucket capacity.
    pub max_tokens: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: 10.0,
            refill_rate: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    /// Floored token balance.
    pub tokens: u64,
    pub max_tokens: f64,
    pub refill_rate: f64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill_at: Instant,
}

#[derive(Debug)]
struct Inner {
    name: String,
    capacity: f64,
    refill_per_ms: f64,
    bucket: Mutex<Bucket>,
}

/// Continuous-refill token bucket. Cloning yields another handle to the same bucket.
#[derive(Debug, Clone)]
pub struct TokenBucketRateLimiter {
    inner: Arc<Inner>,
}

impl TokenBucketRateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        let capacity = config.max_tokens.max(0.0);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                capacity,
                refill_per_ms: config.refill_rate.max(0.0) / 1000.0,
                bucket: Mutex::new(Bucket {
                    tokens: capacity,
                    last_refill_at: Instant::now(),
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Take `n` tokens if the balance allows it. A refusal leaves the balance untouched.
    pub fn try_consume(&self, n: f64) -> bool {
        let mut bucket = self.refilled();
        if bucket.tokens >= n {
            bucket.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Suspend until `n` tokens could be taken.
    pub async fn consume(&self, n: f64) -> GovernanceResult<()> {
        self.consume_inner(n, None).await
    }

    /// Like [`consume`](Self::consume), but gives up when `cancel` fires.
    pub async fn consume_with_cancel(
        &self,
        n: f64,
        cancel: &CancellationToken,
    ) -> GovernanceResult<()> {
        self.consume_inner(n, Some(cancel)).await
    }

    /// Floored token balance after refill.
    pub fn available(&self) -> u64 {
        self.refilled().tokens.floor() as u64
    }

    /// Milliseconds until `n` tokens will be available, `0` if they already are.
    pub fn wait_time(&self, n: f64) -> u64 {
        let bucket = self.refilled();
        self.wait_time_locked(&bucket, n)
    }

    pub fn stats(&self) -> RateLimiterStats {
        let bucket = self.refilled();
        RateLimiterStats {
            tokens: bucket.tokens.floor() as u64,
            max_tokens: self.inner.capacity,
            refill_rate: self.inner.refill_per_ms * 1000.0,
        }
    }

    async fn consume_inner(&self, n: f64, cancel: Option<&CancellationToken>) -> GovernanceResult<()> {
        if n > self.inner.capacity {
            tracing::warn!(
                limiter = %self.inner.name,
                requested = n,
                capacity = self.inner.capacity,
                "requested tokens exceed bucket capacity; consume will never succeed"
            );
        }
        loop {
            // Recomputed every pass: a concurrent consumer may have drained
            // the tokens this caller slept for.
            let wait_ms = {
                let mut bucket = self.refilled();
                if bucket.tokens >= n {
                    bucket.tokens -= n;
                    return Ok(());
                }
                self.wait_time_locked(&bucket, n).max(1)
            };
            tracing::trace!(limiter = %self.inner.name, wait_ms, "rate limited, sleeping");

            let sleep = tokio::time::sleep(Duration::from_millis(wait_ms));
            match cancel {
                Some(token) => tokio::select! {
                    _ = sleep => {}
                    _ = token.cancelled() => {
                        return Err(GovernanceError::Cancelled {
                            resource: self.inner.name.clone(),
                        });
                    }
                },
                None => sleep.await,
            }
        }
    }

    fn wait_time_locked(&self, bucket: &Bucket, n: f64) -> u64 {
        if bucket.tokens >= n {
            return 0;
        }
        if self.inner.refill_per_ms <= 0.0 {
            return u64::MAX;
        }
        ((n - bucket.tokens) / self.inner.refill_per_ms).ceil() as u64
    }

    /// Lock the bucket and bring its balance up to date.
    fn refilled(&self) -> MutexGuard<'_, Bucket> {
        let mut bucket = self
            .inner
            .bucket
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed_ms = now.duration_since(bucket.last_refill_at).as_secs_f64() * 1000.0;
        bucket.tokens = (bucket.tokens + elapsed_ms * self.inner.refill_per_ms).min(self.inner.capacity);
        bucket.last_refill_at = now;
        bucket
    }
}
