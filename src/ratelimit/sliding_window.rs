use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tracing::debug;
use uuid::Uuid;

use crate::cache::CacheService;
use crate::infra::telemetry::RATELIMIT_REJECTED_TOTAL;
use crate::store::{Clock, saturating_millis};

use super::{RateLimitDecision, RateLimiter, SOURCE, fail_open};

const NAME: &str = "sliding_window";

/// Timestamp log per identifier, pruned to the trailing window on every
/// access. Rejected requests are not logged.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    cache: CacheService,
    clock: Arc<dyn Clock>,
    prefix: String,
    window: Duration,
    max: u64,
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("prefix", &self.prefix)
            .field("window", &self.window)
            .field("max", &self.max)
            .finish()
    }
}

impl SlidingWindowLimiter {
    pub fn new(
        cache: CacheService,
        clock: Arc<dyn Clock>,
        prefix: impl Into<String>,
        window: Duration,
        max: u64,
    ) -> Self {
        Self {
            cache,
            clock,
            prefix: prefix.into(),
            window,
            max,
        }
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn check(&self, identifier: &str) -> RateLimitDecision {
        let now = self.clock.now_ms();
        let key = format!("{}:{identifier}", self.prefix);
        // The nonce keeps same-millisecond entries distinct.
        let member = format!("{now}-{}", Uuid::new_v4().simple());

        let Some(outcome) = self
            .cache
            .sliding_window_hit(&key, now, self.window, self.max, &member)
            .await
        else {
            return fail_open(NAME, identifier, self.max, self.window);
        };

        let window_ms = saturating_millis(self.window);
        let reset_after = outcome
            .oldest_ms
            .map(|oldest| Duration::from_millis(oldest.saturating_add(window_ms).saturating_sub(now)))
            .unwrap_or(self.window);

        if !outcome.allowed {
            counter!(RATELIMIT_REJECTED_TOTAL, "limiter" => NAME).increment(1);
            debug!(
                target: SOURCE,
                limiter = NAME,
                identifier,
                count = outcome.count,
                max = self.max,
                "rejected"
            );
            return RateLimitDecision::rejected(self.max, reset_after, reset_after);
        }

        RateLimitDecision::allowed(
            self.max,
            self.max.saturating_sub(outcome.count),
            reset_after,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::cache_with_clock;

    #[tokio::test]
    async fn window_slides_with_time() {
        let (cache, _, clock) = cache_with_clock("app");
        let limiter =
            SlidingWindowLimiter::new(cache, clock.clone(), "rl:sw", Duration::from_millis(1_000), 3);

        for remaining in [2, 1, 0] {
            let decision = limiter.check("client").await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, remaining);
            clock.advance(Duration::from_millis(10));
        }

        let rejected = limiter.check("client").await;
        assert!(!rejected.allowed);
        // Oldest entry leaves the window 1000ms after it was recorded.
        assert_eq!(rejected.retry_after, Some(Duration::from_millis(970)));

        // 1100ms after the first call, that entry has expired.
        clock.advance(Duration::from_millis(1_070));
        assert!(limiter.check("client").await.allowed);
    }

    #[tokio::test]
    async fn rejections_do_not_extend_the_block() {
        let (cache, _, clock) = cache_with_clock("app");
        let limiter =
            SlidingWindowLimiter::new(cache, clock.clone(), "rl:sw", Duration::from_millis(1_000), 1);

        assert!(limiter.check("c").await.allowed);
        for _ in 0..5 {
            clock.advance(Duration::from_millis(100));
            assert!(!limiter.check("c").await.allowed);
        }
        clock.advance(Duration::from_millis(500));
        assert!(limiter.check("c").await.allowed);
    }

    #[tokio::test]
    async fn fails_open_when_store_is_down() {
        let (cache, memory, clock) = cache_with_clock("app");
        let limiter = SlidingWindowLimiter::new(cache, clock, "rl:sw", Duration::from_secs(1), 1);
        memory.set_available(false);
        assert!(limiter.check("c").await.allowed);
        assert!(limiter.check("c").await.allowed);
    }
}
