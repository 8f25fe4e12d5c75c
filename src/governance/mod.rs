//! Admission control and load-shedding primitives.
//!
//! Handlers take a [`Semaphore`] permit or [`TokenBucketRateLimiter`] tokens
//! before expensive work, park overflow in a [`BoundedQueue`], and consult
//! [`BackpressureManager::has_backpressure`] to decide whether to reject new
//! requests outright.

pub mod manager;
pub mod pressure;
pub mod queue;
pub mod rate_limit;
pub mod semaphore;

pub use manager::{BackpressureManager, BackpressureStats, SharedQueue};
pub use pressure::{
    FixedHeapProbe, HeapProbe, HeapSnapshot, MemoryPressureMonitor, MemoryStats,
    PressureSubscription, ProcessHeapProbe,
};
pub use queue::{BoundedQueue, QueueStats};
pub use rate_limit::{RateLimiterConfig, RateLimiterStats, TokenBucketRateLimiter};
pub use semaphore::{Semaphore, SemaphoreConfig, SemaphorePermit, SemaphoreStats};
