//! Capacity-, TTL-, and memory-bounded LRU cache.
//!
//! All public operations take one lock per cache, so recency updates on
//! `get` and structural changes on `set` never interleave. Eviction
//! callbacks run after the lock is released and may call back into the cache.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::size::{EstimateSize, UNKNOWN_OBJECT_BYTES};
use crate::config::CacheConfig;
use crate::governance::pressure::DEFAULT_PRESSURE_THRESHOLD;
use crate::governance::MemoryPressureMonitor;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub type EvictCallback<K, V> = Arc<dyn Fn(&K, &V) + Send + Sync>;
pub type SizeEstimator<V> = Arc<dyn Fn(&V) -> usize + Send + Sync>;

pub struct LruCacheOptions<K, V> {
    /// Maximum number of entries. Values below 1 are raised to 1.
    pub max_size: usize,
    /// Entries older than this are dropped on access.
    pub ttl: Option<Duration>,
    /// Cap on the summed size estimates.
    pub max_memory_mb: Option<f64>,
    pub size_estimator: Option<SizeEstimator<V>>,
    /// Called for every removed entry, whatever the reason.
    pub on_evict: Option<EvictCallback<K, V>>,
    /// `set` sheds ~10% of entries while this reports pressure. Defaults to a
    /// monitor of this process; `None` disables shedding.
    pub pressure_monitor: Option<MemoryPressureMonitor>,
    pub pressure_check_interval: Duration,
}

impl<K, V> LruCacheOptions<K, V> {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ttl: None,
            max_memory_mb: None,
            size_estimator: None,
            on_evict: None,
            pressure_monitor: Some(MemoryPressureMonitor::new(DEFAULT_PRESSURE_THRESHOLD)),
            pressure_check_interval: Duration::from_millis(100),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            ttl: config.ttl_ms.map(Duration::from_millis),
            max_memory_mb: config.max_memory_mb,
            pressure_check_interval: Duration::from_millis(config.pressure_check_interval_ms),
            ..Self::new(config.max_size)
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_max_memory_mb(mut self, mb: f64) -> Self {
        self.max_memory_mb = Some(mb);
        self
    }

    pub fn with_size_estimator(mut self, f: impl Fn(&V) -> usize + Send + Sync + 'static) -> Self {
        self.size_estimator = Some(Arc::new(f));
        self
    }

    pub fn on_evict(mut self, f: impl Fn(&K, &V) + Send + Sync + 'static) -> Self {
        self.on_evict = Some(Arc::new(f));
        self
    }

    pub fn with_pressure_monitor(mut self, monitor: MemoryPressureMonitor) -> Self {
        self.pressure_monitor = Some(monitor);
        self
    }

    /// Never shed entries on memory pressure.
    pub fn without_pressure_check(mut self) -> Self {
        self.pressure_monitor = None;
        self
    }

    pub fn with_pressure_check_interval(mut self, interval: Duration) -> Self {
        self.pressure_check_interval = interval;
        self
    }
}

impl<K, V> Default for LruCacheOptions<K, V> {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub memory_mb: f64,
}

/// Result of [`LruCache::evict_until_memory`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionSummary {
    pub evicted: usize,
    pub final_memory_mb: f64,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    bytes: usize,
}

struct State<K, V> {
    /// Iteration order is most- to least-recently used.
    entries: ::lru::LruCache<K, Entry<V>>,
    memory_bytes: usize,
    last_pressure_check: Option<Instant>,
}

impl<K: Hash + Eq, V> State<K, V> {
    fn pop_lru(&mut self) -> Option<(K, V)> {
        let (key, entry) = self.entries.pop_lru()?;
        self.memory_bytes = self.memory_bytes.saturating_sub(entry.bytes);
        Some((key, entry.value))
    }

    fn remove<Q>(&mut self, key: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (key, entry) = self.entries.pop_entry(key)?;
        self.memory_bytes = self.memory_bytes.saturating_sub(entry.bytes);
        Some((key, entry.value))
    }
}

pub struct LruCache<K, V> {
    state: Mutex<State<K, V>>,
    max_size: usize,
    ttl: Option<Duration>,
    max_memory_bytes: Option<usize>,
    estimator: Option<SizeEstimator<V>>,
    on_evict: Option<EvictCallback<K, V>>,
    pressure_monitor: Option<MemoryPressureMonitor>,
    pressure_check_interval: Duration,
}

impl<K, V> std::fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCache")
            .field("max_size", &self.max_size)
            .field("ttl", &self.ttl)
            .field("max_memory_bytes", &self.max_memory_bytes)
            .finish_non_exhaustive()
    }
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + EstimateSize + 'static,
{
    /// Create a cache that sizes values with [`EstimateSize`] unless the
    /// options carry their own estimator.
    pub fn new(mut options: LruCacheOptions<K, V>) -> Self {
        if options.size_estimator.is_none() {
            options.size_estimator = Some(Arc::new(|v: &V| v.estimated_bytes()));
        }
        Self::with_options(options)
    }
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a cache for any value type. Without a size estimator every
    /// entry counts as [`UNKNOWN_OBJECT_BYTES`].
    pub fn with_options(options: LruCacheOptions<K, V>) -> Self {
        let max_size = options.max_size.max(1);
        Self {
            state: Mutex::new(State {
                entries: ::lru::LruCache::unbounded(),
                memory_bytes: 0,
                last_pressure_check: None,
            }),
            max_size,
            ttl: options.ttl,
            max_memory_bytes: options
                .max_memory_mb
                .map(|mb| (mb.max(0.0) * BYTES_PER_MB) as usize),
            estimator: options.size_estimator,
            on_evict: options.on_evict,
            pressure_monitor: options.pressure_monitor,
            pressure_check_interval: options.pressure_check_interval,
        }
    }

    /// Look up `key`, promoting it to most-recently-used. Expired entries are
    /// evicted and reported as absent.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut state = self.lock();
        let expired = self.is_expired(state.entries.peek(key)?);
        if expired {
            let evicted = state.remove(key);
            drop(state);
            self.notify(evicted);
            return None;
        }
        state.entries.get(key).map(|e| e.value.clone())
    }

    /// Existence check honouring TTL. Does not change recency or evict.
    pub fn has<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let state = self.lock();
        state
            .entries
            .peek(key)
            .is_some_and(|entry| !self.is_expired(entry))
    }

    pub fn set(&self, key: K, value: V) {
        let bytes = self.estimate(&value);
        let mut evicted = Vec::new();
        {
            let mut state = self.lock();

            if self.pressure_check_due(&mut state) {
                let batch = (state.entries.len() / 10).max(1);
                let before = evicted.len();
                for _ in 0..batch {
                    match state.pop_lru() {
                        Some(pair) => evicted.push(pair),
                        None => break,
                    }
                }
                tracing::debug!(
                    evicted = evicted.len() - before,
                    remaining = state.entries.len(),
                    "cache shed entries under memory pressure"
                );
            }

            // Replacing re-inserts at the most-recently-used position.
            evicted.extend(state.remove(&key));

            if state.entries.len() >= self.max_size {
                evicted.extend(state.pop_lru());
            }

            state.entries.put(
                key,
                Entry {
                    value,
                    inserted_at: Instant::now(),
                    bytes,
                },
            );
            state.memory_bytes += bytes;

            if let Some(limit) = self.max_memory_bytes {
                while state.memory_bytes > limit {
                    match state.pop_lru() {
                        Some(pair) => evicted.push(pair),
                        None => break,
                    }
                }
            }
        }
        self.notify_all(evicted);
    }

    /// Return the cached value for `key`, or compute, store, and return it.
    pub fn get_or_try_insert_with<E>(&self, key: K, f: impl FnOnce() -> Result<V, E>) -> Result<V, E> {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = f()?;
        self.set(key, value.clone());
        Ok(value)
    }

    pub fn delete<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let evicted = self.lock().remove(key);
        let removed = evicted.is_some();
        self.notify(evicted);
        removed
    }

    /// Remove every entry whose key satisfies `predicate`.
    pub fn delete_matching(&self, predicate: impl Fn(&K) -> bool) -> usize {
        let evicted: Vec<(K, V)> = {
            let mut state = self.lock();
            let doomed: Vec<K> = state
                .entries
                .iter()
                .filter(|(k, _)| predicate(*k))
                .map(|(k, _)| k.clone())
                .collect();
            doomed.iter().filter_map(|k| state.remove(k)).collect()
        };
        let count = evicted.len();
        self.notify_all(evicted);
        count
    }

    /// Remove up to `n` least-recently-used entries.
    pub fn evict_oldest(&self, n: usize) -> usize {
        let evicted: Vec<(K, V)> = {
            let mut state = self.lock();
            let n = n.min(state.entries.len());
            (0..n).filter_map(|_| state.pop_lru()).collect()
        };
        let count = evicted.len();
        self.notify_all(evicted);
        count
    }

    /// Evict least-recently-used entries until the estimate is at or below `target_mb`.
    pub fn evict_until_memory(&self, target_mb: f64) -> EvictionSummary {
        let target = (target_mb.max(0.0) * BYTES_PER_MB) as usize;
        let (evicted, final_bytes) = {
            let mut state = self.lock();
            let mut evicted = Vec::new();
            while state.memory_bytes > target || (target == 0 && !state.entries.is_empty()) {
                match state.pop_lru() {
                    Some(pair) => evicted.push(pair),
                    None => break,
                }
            }
            (evicted, state.memory_bytes)
        };
        let summary = EvictionSummary {
            evicted: evicted.len(),
            final_memory_mb: final_bytes as f64 / BYTES_PER_MB,
        };
        self.notify_all(evicted);
        summary
    }

    pub fn clear(&self) {
        let evicted: Vec<(K, V)> = {
            let mut state = self.lock();
            if state.entries.is_empty() {
                return;
            }
            state.memory_bytes = 0;
            std::iter::from_fn(|| state.entries.pop_lru())
                .map(|(k, e)| (k, e.value))
                .collect()
        };
        self.notify_all(evicted);
    }

    /// Keys from least- to most-recently used.
    pub fn keys(&self) -> Vec<K> {
        self.lock().entries.iter().rev().map(|(k, _)| k.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn memory_bytes(&self) -> usize {
        self.lock().memory_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            size: state.entries.len(),
            memory_mb: state.memory_bytes as f64 / BYTES_PER_MB,
        }
    }

    fn estimate(&self, value: &V) -> usize {
        self.estimator
            .as_ref()
            .map_or(UNKNOWN_OBJECT_BYTES, |estimate| estimate(value))
    }

    fn is_expired(&self, entry: &Entry<V>) -> bool {
        self.ttl
            .is_some_and(|ttl| entry.inserted_at.elapsed() > ttl)
    }

    /// Throttled pressure probe: at most one read per check interval.
    fn pressure_check_due(&self, state: &mut State<K, V>) -> bool {
        let Some(monitor) = &self.pressure_monitor else {
            return false;
        };
        if state.entries.is_empty() {
            return false;
        }
        let now = Instant::now();
        if state
            .last_pressure_check
            .is_some_and(|last| now.duration_since(last) < self.pressure_check_interval)
        {
            return false;
        }
        state.last_pressure_check = Some(now);
        monitor.is_under_pressure()
    }

    fn notify(&self, evicted: Option<(K, V)>) {
        if let (Some(callback), Some((key, value))) = (&self.on_evict, evicted) {
            callback(&key, &value);
        }
    }

    fn notify_all(&self, evicted: Vec<(K, V)>) {
        if let Some(callback) = &self.on_evict {
            for (key, value) in &evicted {
                callback(key, value);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
