//! Named registry of governance primitives.
//!
//! One [`BackpressureManager`] is built at startup and handed to every
//! component that needs admission control. Instances are created lazily on
//! first access by name and live until [`BackpressureManager::reset`].

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

use super::pressure::{HeapProbe, MemoryPressureMonitor, MemoryStats, ProcessHeapProbe};
use super::queue::{BoundedQueue, QueueStats};
use super::rate_limit::{RateLimiterConfig, RateLimiterStats, TokenBucketRateLimiter};
use super::semaphore::{Semaphore, SemaphoreConfig, SemaphoreStats};
use crate::cache::{LruCache, LruCacheOptions};
use crate::config::BackpressureConfig;
use crate::error::{GovernanceError, GovernanceResult};

/// A registered queue, shared between producers and the draining task.
pub type SharedQueue<T> = Arc<Mutex<BoundedQueue<T>>>;

/// Type-erased view of a registered queue for aggregate checks.
trait QueueProbe: Send + Sync {
    fn is_full(&self) -> bool;
    fn stats(&self) -> QueueStats;
}

impl<T: Send> QueueProbe for Mutex<BoundedQueue<T>> {
    fn is_full(&self) -> bool {
        self.lock().unwrap_or_else(PoisonError::into_inner).is_full()
    }

    fn stats(&self) -> QueueStats {
        self.lock().unwrap_or_else(PoisonError::into_inner).stats()
    }
}

struct QueueEntry {
    probe: Arc<dyn QueueProbe>,
    typed: Arc<dyn Any + Send + Sync>,
}

/// Aggregate snapshot returned by [`BackpressureManager::stats`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackpressureStats {
    pub semaphores: BTreeMap<String, SemaphoreStats>,
    pub queues: BTreeMap<String, QueueStats>,
    pub rate_limiters: BTreeMap<String, RateLimiterStats>,
    pub memory_pressure: MemoryStats,
}

pub struct BackpressureManager {
    config: BackpressureConfig,
    probe: Arc<dyn HeapProbe>,
    semaphores: Mutex<HashMap<String, Semaphore>>,
    queues: Mutex<HashMap<String, QueueEntry>>,
    rate_limiters: Mutex<HashMap<String, TokenBucketRateLimiter>>,
    memory: Mutex<MemoryPressureMonitor>,
}

impl std::fmt::Debug for BackpressureManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for BackpressureManager {
    fn default() -> Self {
        Self::from_config(&BackpressureConfig::default())
    }
}

impl BackpressureManager {
    /// Build a manager that watches this process's memory.
    pub fn from_config(config: &BackpressureConfig) -> Self {
        let limit = config.heap_limit_mb.map(|mb| mb.saturating_mul(1024 * 1024));
        Self::with_probe(config, Arc::new(ProcessHeapProbe::new(limit)))
    }

    /// Build a manager whose memory monitor reads from `probe`.
    pub fn with_probe(config: &BackpressureConfig, probe: Arc<dyn HeapProbe>) -> Self {
        let memory = MemoryPressureMonitor::with_probe(config.memory_threshold, Arc::clone(&probe));
        Self {
            config: config.clone(),
            probe,
            semaphores: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            rate_limiters: Mutex::new(HashMap::new()),
            memory: Mutex::new(memory),
        }
    }

    /// Get or create the semaphore `name`. `max_concurrent` only applies on creation.
    pub fn semaphore(&self, name: &str, max_concurrent: Option<usize>) -> Semaphore {
        lock(&self.semaphores)
            .entry(name.to_string())
            .or_insert_with(|| {
                let max = max_concurrent.unwrap_or(self.config.default_max_concurrent);
                let mut config = SemaphoreConfig::new(max);
                config.timeout = self.config.acquire_timeout_ms.map(Duration::from_millis);
                tracing::debug!(semaphore = %name, max, "semaphore registered");
                Semaphore::new(name, config)
            })
            .clone()
    }

    /// Get or create the queue `name`. `max_size` only applies on creation.
    ///
    /// Fails if `name` was first registered with a different item type.
    pub fn queue<T>(&self, name: &str, max_size: Option<usize>) -> GovernanceResult<SharedQueue<T>>
    where
        T: Send + 'static,
    {
        let mut queues = lock(&self.queues);
        let entry = queues.entry(name.to_string()).or_insert_with(|| {
            let capacity = max_size.unwrap_or(self.config.default_queue_size);
            tracing::debug!(queue = %name, capacity, "queue registered");
            let queue: SharedQueue<T> = Arc::new(Mutex::new(BoundedQueue::new(name, capacity)));
            QueueEntry {
                probe: queue.clone(),
                typed: queue,
            }
        });
        Arc::clone(&entry.typed)
            .downcast::<Mutex<BoundedQueue<T>>>()
            .map_err(|_| GovernanceError::QueueTypeMismatch {
                name: name.to_string(),
            })
    }

    /// Get or create the rate limiter `name`. `config` only applies on creation.
    pub fn rate_limiter(&self, name: &str, config: Option<RateLimiterConfig>) -> TokenBucketRateLimiter {
        lock(&self.rate_limiters)
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = config.unwrap_or(RateLimiterConfig {
                    max_tokens: self.config.default_max_tokens,
                    refill_rate: self.config.default_refill_rate,
                });
                tracing::debug!(
                    limiter = %name,
                    max_tokens = config.max_tokens,
                    refill_rate = config.refill_rate,
                    "rate limiter registered"
                );
                TokenBucketRateLimiter::new(name, config)
            })
            .clone()
    }

    /// The shared memory monitor.
    pub fn memory(&self) -> MemoryPressureMonitor {
        lock(&self.memory).clone()
    }

    /// Build a cache that sheds entries when the shared monitor reports
    /// pressure. Options built with `without_pressure_check` stay opted out.
    pub fn cache<K, V>(&self, options: LruCacheOptions<K, V>) -> LruCache<K, V>
    where
        K: Hash + Eq + Clone,
        V: Clone + crate::cache::EstimateSize + 'static,
    {
        if options.pressure_monitor.is_none() {
            return LruCache::new(options);
        }
        LruCache::new(options.with_pressure_monitor(self.memory()))
    }

    /// `true` when memory is under pressure, any queue is full, or any
    /// semaphore is exhausted with callers waiting on it.
    pub fn has_backpressure(&self) -> bool {
        if self.memory().is_under_pressure() {
            return true;
        }

        let queues: Vec<Arc<dyn QueueProbe>> = lock(&self.queues)
            .values()
            .map(|entry| Arc::clone(&entry.probe))
            .collect();
        if queues.iter().any(|q| q.is_full()) {
            return true;
        }

        lock(&self.semaphores)
            .values()
            .any(|s| {
                let stats = s.stats();
                stats.current == stats.max && stats.waiting > 0
            })
    }

    pub fn stats(&self) -> BackpressureStats {
        let semaphores = lock(&self.semaphores)
            .iter()
            .map(|(name, s)| (name.clone(), s.stats()))
            .collect();
        let queue_probes: Vec<(String, Arc<dyn QueueProbe>)> = lock(&self.queues)
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(&entry.probe)))
            .collect();
        let queues = queue_probes
            .into_iter()
            .map(|(name, probe)| (name, probe.stats()))
            .collect();
        let rate_limiters = lock(&self.rate_limiters)
            .iter()
            .map(|(name, r)| (name.clone(), r.stats()))
            .collect();

        BackpressureStats {
            semaphores,
            queues,
            rate_limiters,
            memory_pressure: self.memory().stats(),
        }
    }

    /// Start the shared memory monitor at the configured interval.
    pub fn start_monitoring(&self) -> GovernanceResult<()> {
        self.memory()
            .start_monitoring(Duration::from_millis(self.config.monitor_interval_ms))
    }

    pub fn stop_monitoring(&self) {
        self.memory().stop_monitoring();
    }

    /// Drop every registered instance and replace the memory monitor.
    ///
    /// Handles obtained earlier keep working but are no longer tracked.
    pub fn reset(&self) {
        lock(&self.semaphores).clear();
        lock(&self.queues).clear();
        lock(&self.rate_limiters).clear();

        let fresh = MemoryPressureMonitor::with_probe(self.config.memory_threshold, Arc::clone(&self.probe));
        let old = std::mem::replace(&mut *lock(&self.memory), fresh);
        old.stop_monitoring();
        tracing::info!("backpressure registries reset");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::FixedHeapProbe;

    fn manager() -> (BackpressureManager, FixedHeapProbe) {
        let probe = FixedHeapProbe::from_mb(100, 1000);
        let config = BackpressureConfig::default();
        (BackpressureManager::with_probe(&config, Arc::new(probe.clone())), probe)
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let (m, _) = manager();
        let a = m.semaphore("db", Some(2));
        let b = m.semaphore("db", Some(50));
        assert_eq!(b.max(), 2);
        assert!(a.try_acquire());
        assert_eq!(b.available(), 1, "both handles share permits");

        let q1 = m.queue::<u32>("jobs", Some(3)).unwrap();
        let q2 = m.queue::<u32>("jobs", Some(99)).unwrap();
        assert!(Arc::ptr_eq(&q1, &q2));
        assert_eq!(q2.lock().unwrap().capacity(), 3);

        let r = m.rate_limiter("embed", None);
        assert_eq!(r.stats().max_tokens, 10.0);
        let r2 = m.rate_limiter(
            "embed",
            Some(RateLimiterConfig {
                max_tokens: 1.0,
                refill_rate: 1.0,
            }),
        );
        assert_eq!(r2.stats().max_tokens, 10.0);
    }

    #[test]
    fn defaults_come_from_config() {
        let (m, _) = manager();
        assert_eq!(m.semaphore("s", None).max(), 10);
        assert_eq!(m.queue::<()>("q", None).unwrap().lock().unwrap().capacity(), 1000);
    }

    #[test]
    fn queue_type_mismatch_is_an_error() {
        let (m, _) = manager();
        m.queue::<String>("mixed", None).unwrap();
        let err = m.queue::<u64>("mixed", None).unwrap_err();
        assert!(matches!(err, GovernanceError::QueueTypeMismatch { .. }));
    }

    #[test]
    fn stats_are_keyed_by_name() {
        let (m, _) = manager();
        m.semaphore("a", Some(1));
        m.queue::<u8>("b", Some(1)).unwrap().lock().unwrap().offer(1);
        m.rate_limiter("c", None);

        let stats = m.stats();
        assert_eq!(stats.semaphores["a"].max, 1);
        assert!(stats.queues["b"].full);
        assert!(stats.rate_limiters.contains_key("c"));
        assert!(!stats.memory_pressure.under_pressure);

        let json = serde_json::to_value(&stats).unwrap();
        assert!(json.get("rateLimiters").is_some());
        assert!(json.get("memoryPressure").is_some());
    }

    #[test]
    fn reset_discards_registries_and_monitor() {
        let (m, _) = manager();
        let before = m.semaphore("s", Some(1));
        let sub = m.memory().on_pressure(|_| Ok(()));
        assert_eq!(m.memory().subscriber_count(), 1);

        m.reset();
        assert!(m.stats().semaphores.is_empty());
        assert_eq!(m.memory().subscriber_count(), 0);
        let after = m.semaphore("s", Some(4));
        assert_eq!(after.max(), 4);
        assert_eq!(before.max(), 1);
        assert!(!sub.unsubscribe(), "old monitor is gone");
    }

    #[test]
    fn caches_follow_shared_pressure() {
        let (m, probe) = manager();
        let cache: LruCache<u32, u32> = m.cache(
            LruCacheOptions::new(100).with_pressure_check_interval(Duration::ZERO),
        );
        for i in 0..10 {
            cache.set(i, i);
        }
        probe.set_used_mb(900);
        cache.set(10, 10);
        assert_eq!(cache.len(), 10);
        assert!(!cache.has(&0));
    }

    #[test]
    fn opted_out_caches_stay_opted_out() {
        let (m, probe) = manager();
        probe.set_used_mb(900);
        let cache: LruCache<u32, u32> = m.cache(
            LruCacheOptions::new(100)
                .without_pressure_check()
                .with_pressure_check_interval(Duration::ZERO),
        );
        for i in 0..10 {
            cache.set(i, i);
        }
        assert_eq!(cache.len(), 10);
    }

    #[tokio::test]
    async fn waiting_on_exhausted_semaphore_is_backpressure() {
        let (m, _) = manager();
        let sem = m.semaphore("db", Some(1));
        assert!(sem.try_acquire());
        assert!(!m.has_backpressure());

        let waiter = {
            let sem = sem.clone();
            tokio::spawn(async move { sem.acquire().await })
        };
        while sem.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(m.has_backpressure());

        sem.release();
        waiter.await.unwrap().unwrap();
        assert!(!m.has_backpressure());
    }
}
