mod helpers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentmem::cache::{cache_key, LruCacheOptions};
use agentmem::governance::RateLimiterConfig;
use serde_json::json;

async fn wait_for_waiters(sem: &agentmem::Semaphore, n: usize) {
    while sem.waiting() < n {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn idle_manager_has_no_backpressure() {
    let (manager, _) = helpers::test_manager();
    manager.semaphore("db", Some(2));
    manager.queue::<String>("writes", Some(2)).unwrap();
    manager.rate_limiter("embeddings", None);
    assert!(!manager.has_backpressure());
}

#[tokio::test]
async fn full_queue_signals_backpressure() {
    let (manager, _) = helpers::test_manager();
    let queue = manager.queue::<&str>("writes", Some(2)).unwrap();
    {
        let mut q = queue.lock().unwrap();
        assert!(q.offer("first"));
        assert!(q.offer("second"));
        assert!(!q.offer("third"));
        let err = q.add("third").unwrap_err();
        assert!(err.to_string().contains("is full (2 items)"));
    }
    assert!(manager.has_backpressure());

    queue.lock().unwrap().poll();
    assert!(!manager.has_backpressure());
}

#[tokio::test]
async fn exhausted_semaphore_needs_a_waiter() {
    let (manager, _) = helpers::test_manager();
    let sem = manager.semaphore("db", Some(1));
    assert!(sem.try_acquire());
    assert_eq!(sem.available(), 0);
    assert!(!manager.has_backpressure(), "exhausted but nobody waiting");

    let waiter = {
        let sem = sem.clone();
        tokio::spawn(async move { sem.acquire().await })
    };
    wait_for_waiters(&sem, 1).await;
    assert!(manager.has_backpressure());

    sem.release();
    waiter.await.unwrap().unwrap();
    assert_eq!(sem.waiting(), 0);
    assert!(!manager.has_backpressure());
    sem.release();
}

#[tokio::test]
async fn memory_pressure_signals_backpressure() {
    let (manager, probe) = helpers::test_manager();
    probe.set_used_mb(850);
    assert!(!manager.has_backpressure(), "threshold is exclusive");
    probe.set_used_mb(900);
    assert!(manager.has_backpressure());
    assert!(manager.stats().memory_pressure.under_pressure);
}

#[tokio::test(start_paused = true)]
async fn registered_rate_limiter_refills_continuously() {
    let (manager, _) = helpers::test_manager();
    let limiter = manager.rate_limiter(
        "embeddings",
        Some(RateLimiterConfig {
            max_tokens: 10.0,
            refill_rate: 10.0,
        }),
    );
    assert!(limiter.try_consume(10.0));
    assert!(!limiter.try_consume(1.0));

    tokio::time::advance(Duration::from_millis(500)).await;
    assert_eq!(manager.rate_limiter("embeddings", None).available(), 5);
    assert!(limiter.try_consume(4.0));
    assert_eq!(limiter.available(), 1);

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(manager.stats().rate_limiters["embeddings"].tokens, 10);
}

#[tokio::test]
async fn shared_semaphore_bounds_concurrency() {
    let (manager, _) = helpers::test_manager();
    let manager = Arc::new(manager);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                let _permit = manager.semaphore("db", Some(3)).acquire_permit().await.unwrap();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    let stats = manager.stats().semaphores["db"];
    assert_eq!(stats.current, 0);
    assert_eq!(stats.waiting, 0);
}

#[tokio::test]
async fn pressure_aware_cache_fronts_lookups() {
    let (manager, probe) = helpers::test_manager();
    let cache = manager.cache::<String, Vec<String>>(
        LruCacheOptions::new(50).with_pressure_check_interval(Duration::ZERO),
    );

    let loads = AtomicUsize::new(0);
    let lookup = |tag: &str| {
        let key = cache_key("tags", &json!({"tag": tag, "limit": 10})).unwrap();
        cache.get_or_try_insert_with(key, || {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(vec![format!("{tag}-tool")])
        })
    };

    assert_eq!(lookup("rust").unwrap(), vec!["rust-tool".to_string()]);
    assert_eq!(lookup("rust").unwrap(), vec!["rust-tool".to_string()]);
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    for i in 0..19 {
        lookup(&format!("tag{i}")).unwrap();
    }
    assert_eq!(cache.len(), 20);

    probe.set_used_mb(950);
    lookup("fresh").unwrap();
    // Two entries shed (10% of 20) before the insert.
    assert_eq!(cache.len(), 19);
    assert!(!cache.has(&cache_key("tags", &json!({"limit": 10, "tag": "rust"})).unwrap()));
}

#[tokio::test]
async fn reset_isolates_registries() {
    let (manager, _) = helpers::test_manager();
    manager.queue::<u8>("q", Some(1)).unwrap().lock().unwrap().offer(1);
    assert!(manager.has_backpressure());

    manager.reset();
    assert!(!manager.has_backpressure());
    let stats = manager.stats();
    assert!(stats.queues.is_empty());
    assert!(stats.semaphores.is_empty());
    assert!(stats.rate_limiters.is_empty());
}

#[tokio::test(start_paused = true)]
async fn monitoring_notifies_subscribers() {
    let (manager, probe) = helpers::test_manager();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    manager.memory().on_pressure(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    manager.start_monitoring().unwrap();
    manager.start_monitoring().unwrap();
    assert!(manager.memory().is_monitoring());

    // Default interval is 5s.
    tokio::time::sleep(Duration::from_millis(5_100)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    probe.set_used_mb(990);
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    manager.stop_monitoring();
    manager.stop_monitoring();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
