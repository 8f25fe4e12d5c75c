//! Counting semaphore with a FIFO wait list.
//!
//! A released permit is handed straight to the oldest waiter instead of being
//! returned to the pool, so a caller arriving later can never overtake a
//! caller that is already waiting.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{GovernanceError, GovernanceResult};

/// Construction options for a [`Semaphore`].
#[derive(Debug, Clone)]
pub struct SemaphoreConfig {
    /// Number of permits. Values below 1 are raised to 1.
    pub max_concurrent: usize,
    /// How long a pending `acquire` may wait before failing.
    pub timeout: Option<Duration>,
}

impl SemaphoreConfig {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Point-in-time view of a semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SemaphoreStats {
    /// Permits currently held.
    pub current: usize,
    /// Total permits.
    pub max: usize,
    /// Callers suspended in `acquire`.
    pub waiting: usize,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

struct State {
    in_use: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

struct Inner {
    name: String,
    max: usize,
    timeout: Option<Duration>,
    state: Mutex<State>,
}

/// Bounded concurrency permits. Cloning yields another handle to the same permits.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Semaphore {
    pub fn new(name: impl Into<String>, config: SemaphoreConfig) -> Self {
        let name = name.into();
        let max = config.max_concurrent.max(1);
        if config.max_concurrent == 0 {
            tracing::warn!(semaphore = %name, "max_concurrent of 0 raised to 1");
        }
        Self {
            inner: Arc::new(Inner {
                name,
                max,
                timeout: config.timeout,
                state: Mutex::new(State {
                    in_use: 0,
                    waiters: VecDeque::new(),
                    next_waiter_id: 0,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn max(&self) -> usize {
        self.inner.max
    }

    /// Wait for a permit. Fails with [`GovernanceError::SemaphoreTimeout`] if a
    /// timeout is configured and elapses first.
    pub async fn acquire(&self) -> GovernanceResult<()> {
        self.acquire_inner(None).await
    }

    /// Like [`acquire`](Self::acquire), but also gives up when `cancel` fires.
    pub async fn acquire_with_cancel(&self, cancel: &CancellationToken) -> GovernanceResult<()> {
        self.acquire_inner(Some(cancel)).await
    }

    /// Acquire a permit that is released automatically when the guard drops.
    pub async fn acquire_permit(&self) -> GovernanceResult<SemaphorePermit> {
        self.acquire().await?;
        Ok(SemaphorePermit {
            semaphore: self.clone(),
        })
    }

    /// Take a permit only if one is free right now.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        // Waiters only exist while every permit is held, so this cannot barge.
        if state.in_use < self.inner.max {
            state.in_use += 1;
            true
        } else {
            false
        }
    }

    /// Non-blocking counterpart of [`acquire_permit`](Self::acquire_permit).
    pub fn try_acquire_permit(&self) -> Option<SemaphorePermit> {
        self.try_acquire().then(|| SemaphorePermit {
            semaphore: self.clone(),
        })
    }

    /// Return one permit, handing it to the oldest live waiter if there is one.
    pub fn release(&self) {
        let mut state = self.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            // A closed receiver belongs to an acquire that was abandoned.
            if waiter.tx.send(()).is_ok() {
                return;
            }
        }
        if state.in_use == 0 {
            tracing::warn!(semaphore = %self.inner.name, "release without a held permit ignored");
            return;
        }
        state.in_use -= 1;
    }

    pub fn available(&self) -> usize {
        self.inner.max - self.lock().in_use
    }

    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn stats(&self) -> SemaphoreStats {
        let state = self.lock();
        SemaphoreStats {
            current: state.in_use,
            max: self.inner.max,
            waiting: state.waiters.len(),
        }
    }

    async fn acquire_inner(&self, cancel: Option<&CancellationToken>) -> GovernanceResult<()> {
        let mut pending = {
            let mut state = self.lock();
            if state.in_use < self.inner.max {
                state.in_use += 1;
                return Ok(());
            }
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, tx });
            PendingAcquire {
                semaphore: self,
                id,
                rx,
                settled: false,
            }
        };

        let timeout = self.inner.timeout;
        let deadline = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let err = tokio::select! {
            granted = &mut pending.rx => {
                pending.settled = true;
                return match granted {
                    Ok(()) => Ok(()),
                    Err(_) => Err(GovernanceError::Cancelled {
                        resource: self.inner.name.clone(),
                    }),
                };
            }
            _ = deadline => {
                let timeout_ms = timeout.map(|t| t.as_millis() as u64).unwrap_or_default();
                tracing::warn!(
                    semaphore = %self.inner.name,
                    max = self.inner.max,
                    timeout_ms,
                    "semaphore acquire timed out"
                );
                GovernanceError::SemaphoreTimeout {
                    name: self.inner.name.clone(),
                    max: self.inner.max,
                    timeout_ms,
                }
            }
            _ = cancelled => GovernanceError::Cancelled {
                resource: self.inner.name.clone(),
            },
        };

        if pending.withdraw() {
            // The permit arrived between the timer firing and the withdrawal.
            return Ok(());
        }
        Err(err)
    }

    fn remove_waiter(&self, id: u64) -> bool {
        let mut state = self.lock();
        match state.waiters.iter().position(|w| w.id == id) {
            Some(pos) => {
                state.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A waiter entry that removes itself from the wait list if the acquiring
/// future is dropped, returning any permit that was already handed over.
struct PendingAcquire<'a> {
    semaphore: &'a Semaphore,
    id: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl PendingAcquire<'_> {
    /// Leave the wait list. Returns `true` if a permit had already been
    /// transferred, in which case the caller now owns it.
    fn withdraw(&mut self) -> bool {
        self.settled = true;
        if self.semaphore.remove_waiter(self.id) {
            return false;
        }
        // Transfers happen under the state lock, so the value is already sent.
        self.rx.try_recv().is_ok()
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if !self.settled && self.withdraw() {
            self.semaphore.release();
        }
    }
}

/// RAII permit: calls [`Semaphore::release`] on drop.
#[must_use = "dropping the permit releases it immediately"]
pub struct SemaphorePermit {
    semaphore: Semaphore,
}

impl SemaphorePermit {
    pub fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}
