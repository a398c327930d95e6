use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use cylinder_cache::cache::{CacheOptions, CacheService, Invalidator};
use cylinder_cache::infra::telemetry;
use cylinder_cache::ratelimit::{FixedWindowLimiter, RateLimiter, TokenBucketLimiter};
use cylinder_cache::store::{ClientSettings, ManualClock, MemoryStore, StoreClient};
use metrics_util::debugging::DebuggingRecorder;

#[tokio::test]
async fn cache_and_limiter_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let memory = MemoryStore::with_clock(clock.clone());
    let client = StoreClient::in_memory(memory.clone(), ClientSettings::default());
    let cache = CacheService::new(Arc::new(client), "metrics");
    let options = CacheOptions::new();

    // Hit, miss, invalidation.
    assert!(cache.get::<u32>("absent", &options).await.is_none());
    cache.set("present", &7u32, &options).await;
    assert_eq!(cache.get::<u32>("present", &options).await, Some(7));
    let invalidator = Invalidator::new(cache.clone());
    assert_eq!(invalidator.invalidate_patterns(&["present"]).await, 1);

    // Rejection.
    let fixed = FixedWindowLimiter::new(
        cache.clone(),
        clock.clone(),
        "rl:metrics",
        Duration::from_secs(60),
        1,
    );
    assert!(fixed.check("client").await.allowed);
    assert!(!fixed.check("client").await.allowed);

    // Store errors and fail-open.
    memory.set_available(false);
    let bucket = TokenBucketLimiter::new(cache.clone(), clock, "rl:bucket", 5.0, 1.0);
    assert!(bucket.check("client").await.allowed);
    assert!(cache.get::<u32>("present", &options).await.is_none());

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        telemetry::CACHE_HIT_TOTAL,
        telemetry::CACHE_MISS_TOTAL,
        telemetry::CACHE_ERROR_TOTAL,
        telemetry::CACHE_INVALIDATED_TOTAL,
        telemetry::RATELIMIT_REJECTED_TOTAL,
        telemetry::RATELIMIT_FAIL_OPEN_TOTAL,
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
