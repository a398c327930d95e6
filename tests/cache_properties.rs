//! End-to-end behavior of the cache service, invalidation, memoization and
//! limiters against the in-process store.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cylinder_cache::cache::{CacheOptions, CacheService, Cacheable, Invalidator, keys};
use cylinder_cache::ratelimit::{
    FixedWindowLimiter, RateLimiter, SlidingWindowLimiter, TokenBucketLimiter,
};
use cylinder_cache::store::{ClientSettings, KvStore, ManualClock, MemoryStore, StoreClient};
use serde_json::json;

const START_MS: u64 = 1_700_000_000_000;

fn setup() -> (CacheService, MemoryStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(START_MS));
    let memory = MemoryStore::with_clock(clock.clone());
    let client = StoreClient::in_memory(memory.clone(), ClientSettings::default());
    (CacheService::new(Arc::new(client), "app"), memory, clock)
}

#[tokio::test]
async fn values_live_exactly_as_long_as_their_ttl() {
    let (cache, _, clock) = setup();
    let options = CacheOptions::new().with_ttl(Duration::from_secs(30));
    assert!(cache.set("session:abc", &json!({"user": 7}), &options).await);

    clock.advance(Duration::from_millis(29_999));
    assert_eq!(
        cache.get::<serde_json::Value>("session:abc", &options).await,
        Some(json!({"user": 7}))
    );

    clock.advance(Duration::from_millis(1));
    assert_eq!(
        cache.get::<serde_json::Value>("session:abc", &options).await,
        None
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_are_not_lost() {
    let (cache, _, _) = setup();
    let tasks: Vec<_> = (0..64)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.increment("hits", 1, &CacheOptions::new()).await })
        })
        .collect();

    let mut seen = Vec::new();
    for task in tasks {
        seen.push(task.await.expect("task").expect("increment"));
    }
    seen.sort_unstable();

    assert_eq!(seen, (1..=64).collect::<Vec<i64>>());
    assert_eq!(cache.get::<i64>("hits", &CacheOptions::new()).await, Some(64));
}

#[tokio::test]
async fn tag_invalidation_removes_members_and_index() {
    let (cache, memory, _) = setup();
    let invalidator = Invalidator::new(cache.clone());
    let options = CacheOptions::new();

    invalidator.set_with_tags("k1", &1, &["A"], &options).await;
    invalidator.set_with_tags("k2", &2, &["A", "B"], &options).await;

    assert_eq!(invalidator.invalidate_tag("A").await, 2);
    assert!(!cache.exists("k1", &options).await);
    assert!(!cache.exists("k2", &options).await);
    assert!(!memory.exists(&format!("app:{}", keys::tag("A"))).await.unwrap());

    // k2 is already gone; B still lists it and clearing it is a no-op.
    assert_eq!(invalidator.invalidate_tag("B").await, 0);
}

#[tokio::test]
async fn pattern_invalidation_is_scoped() {
    let (cache, _, _) = setup();
    let options = CacheOptions::new();
    let filters = json!({"category": "tools"});

    cache.set(&keys::resource("product", 42), &"p42", &options).await;
    cache.set(&keys::list("product", 1, 20, &filters), &vec![42], &options).await;
    cache.set(&keys::list("product", 2, 20, &filters), &vec![43], &options).await;
    cache.set(&keys::list("order", 1, 20, &filters), &vec![9], &options).await;

    assert_eq!(cache.delete_pattern("list:product:*").await, 2);
    assert!(cache.exists("product:42", &options).await);
    assert!(cache.exists(&keys::list("order", 1, 20, &filters), &options).await);
}

#[tokio::test]
async fn memoized_operation_runs_once_per_argument_set() {
    let (cache, _, _) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let lookup = Cacheable::<u32, String>::new(cache, "product_name")
        .ttl(Duration::from_secs(60))
        .wrap(move |id: u32| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(format!("product-{id}"))
            }
        });

    assert_eq!(lookup.call(1).await, Ok("product-1".to_string()));
    assert_eq!(lookup.call(1).await, Ok("product-1".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(lookup.call(2).await, Ok("product-2".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn fixed_window_admits_exactly_max_per_window() {
    let (cache, _, clock) = setup();
    clock.set(START_MS - START_MS % 1_000);
    let limiter = FixedWindowLimiter::new(cache, clock.clone(), "rl", Duration::from_secs(1), 5);

    for _ in 0..5 {
        assert!(limiter.check("ip").await.allowed);
    }
    let rejected = limiter.check("ip").await;
    assert!(!rejected.allowed);
    assert!(rejected.retry_after_secs() > 0);

    clock.advance(Duration::from_secs(1));
    assert!(limiter.check("ip").await.allowed);
}

#[tokio::test]
async fn sliding_window_admits_again_after_oldest_entry_expires() {
    let (cache, _, clock) = setup();
    let limiter =
        SlidingWindowLimiter::new(cache, clock.clone(), "rl", Duration::from_millis(1_000), 3);

    for _ in 0..3 {
        assert!(limiter.check("ip").await.allowed);
    }
    assert!(!limiter.check("ip").await.allowed);

    clock.advance(Duration::from_millis(1_100));
    assert!(limiter.check("ip").await.allowed);
}

#[tokio::test]
async fn token_bucket_conserves_tokens() {
    let (cache, _, clock) = setup();
    let bucket = TokenBucketLimiter::new(cache, clock.clone(), "rl", 5.0, 2.0);

    assert!(bucket.consume("ip", 5.0).await.allowed);
    assert!(!bucket.consume("ip", 1.0).await.allowed);

    clock.advance(Duration::from_millis(500));
    assert!(bucket.consume("ip", 1.0).await.allowed);
}
