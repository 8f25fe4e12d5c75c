//! Resource governance for an AI-agent memory store.
//!
//! The store's request handlers and storage layer call into this crate to
//! protect the process from overload:
//!
//! | Primitive | Purpose |
//! |-----------|---------|
//! | [`Semaphore`] | Bounded concurrency with a FIFO wait list and optional timeout |
//! | [`BoundedQueue`] | Fixed-capacity FIFO buffer that never blocks |
//! | [`TokenBucketRateLimiter`] | Continuous-refill throttling for external calls |
//! | [`MemoryPressureMonitor`] | Heap polling with pressure event fan-out |
//! | [`LruCache`] | Capacity-, TTL- and memory-bounded cache that trims under pressure |
//! | [`BackpressureManager`] | Named registry of the above with one aggregate load signal |
//!
//! Storage mutations run through [`db::transaction_with_retry`], which retries
//! SQLite lock contention with exponential backoff, and connections are handed
//! out by [`db::DbHealthMonitor`], which reconnects when a liveness probe fails.
//!
//! # Modules
//!
//! - [`cache`]: LRU cache, size estimation, and deterministic cache keys
//! - [`config`]: Configuration loading from TOML files and environment variables
//! - [`db`]: SQLite connection setup, retrying transactions, and health checks
//! - [`error`]: Resource-exhaustion error type
//! - [`governance`]: Semaphore, queue, rate limiter, memory monitor, and registry

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod governance;

pub use cache::{cache_key, LruCache, LruCacheOptions};
pub use error::{GovernanceError, GovernanceResult};
pub use governance::{
    BackpressureManager, BoundedQueue, MemoryPressureMonitor, Semaphore, TokenBucketRateLimiter,
};
