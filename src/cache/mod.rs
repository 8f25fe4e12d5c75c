//! Read-through caching for repeated lookups (scope resolution, tag queries).
//!
//! [`LruCache`] bounds entries by count, age, and estimated memory, and sheds
//! load on its own when a [`MemoryPressureMonitor`](crate::governance::MemoryPressureMonitor)
//! reports heap pressure. Keys are usually built with [`cache_key`].

pub mod key;
pub mod lru_cache;
pub mod size;

pub use key::cache_key;
pub use lru_cache::{CacheStats, EvictionSummary, LruCache, LruCacheOptions};
pub use size::{estimate_serialized, EstimateSize};
