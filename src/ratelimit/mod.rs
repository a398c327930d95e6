//! Request throttling on top of the cache's atomic primitives.
//!
//! Four algorithms share one [`RateLimiter`] seam:
//!
//! | Limiter | Storage | Rejected attempts |
//! |---|---|---|
//! | [`FixedWindowLimiter`] | counter per window id | still count |
//! | [`SlidingWindowLimiter`] | timestamp log | not recorded |
//! | [`TokenBucketLimiter`] | `{tokens, last_refill}` | not charged |
//! | [`DistributedRateLimiter`] | counter per window id | rolled back |
//!
//! Every limiter fails open: when the store cannot answer, the request is
//! admitted and the event is logged and counted.

mod distributed;
mod fixed_window;
mod middleware;
mod sliding_window;
mod token_bucket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tracing::warn;

use crate::cache::CacheService;
use crate::config::{RateLimitAlgorithm, RateLimitPolicy, RateLimitSettings};
use crate::infra::telemetry::RATELIMIT_FAIL_OPEN_TOTAL;
use crate::store::Clock;

pub use distributed::{DistributedRateLimiter, RateLimitState};
pub use fixed_window::FixedWindowLimiter;
pub use middleware::{KeyGenerator, RateLimitLayer, client_ip, rate_limit};
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

const SOURCE: &str = "cylinder_cache::ratelimit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Time until the budget fully resets.
    pub reset_after: Duration,
    /// Set on rejection: how long to wait before retrying.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    pub(crate) fn allowed(limit: u64, remaining: u64, reset_after: Duration) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_after,
            retry_after: None,
        }
    }

    pub(crate) fn rejected(limit: u64, reset_after: Duration, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_after,
            retry_after: Some(retry_after.max(Duration::from_millis(1))),
        }
    }

    /// Whole seconds for `Retry-After`, never zero.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.map(ceil_secs).unwrap_or(0).max(1)
    }

    pub fn reset_after_secs(&self) -> u64 {
        ceil_secs(self.reset_after)
    }
}

/// Whole seconds, rounded up and saturating at `u64::MAX`.
pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    let partial = u64::from(duration.subsec_nanos() > 0);
    duration.as_secs().saturating_add(partial)
}

/// Admits everything and records why.
pub(crate) fn fail_open(
    limiter: &'static str,
    identifier: &str,
    limit: u64,
    window: Duration,
) -> RateLimitDecision {
    counter!(RATELIMIT_FAIL_OPEN_TOTAL, "limiter" => limiter).increment(1);
    warn!(
        target: SOURCE,
        limiter,
        identifier,
        "store unavailable, admitting request"
    );
    RateLimitDecision::allowed(limit, limit, window)
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Records one request for `identifier` and decides whether to admit it.
    async fn check(&self, identifier: &str) -> RateLimitDecision;

    /// Gives back the budget spent by the last admitted request. Limiters
    /// that cannot refund ignore this.
    async fn refund(&self, _identifier: &str) {}
}

/// General API policy, using the configured algorithm.
pub fn api_limiter(
    cache: CacheService,
    clock: Arc<dyn Clock>,
    settings: &RateLimitSettings,
) -> Arc<dyn RateLimiter> {
    const PREFIX: &str = "rl:api";
    let RateLimitPolicy { window, max } = settings.api;
    match settings.algorithm {
        RateLimitAlgorithm::FixedWindow => {
            Arc::new(FixedWindowLimiter::new(cache, clock, PREFIX, window, max))
        }
        RateLimitAlgorithm::SlidingWindow => {
            Arc::new(SlidingWindowLimiter::new(cache, clock, PREFIX, window, max))
        }
        RateLimitAlgorithm::TokenBucket => Arc::new(TokenBucketLimiter::new(
            cache,
            clock,
            PREFIX,
            settings.token_bucket.capacity,
            settings.token_bucket.refill_per_sec,
        )),
        RateLimitAlgorithm::Distributed => {
            Arc::new(DistributedRateLimiter::new(cache, clock, PREFIX, max, window))
        }
    }
}

/// Authentication policy: always a stricter fixed window.
pub fn auth_limiter(
    cache: CacheService,
    clock: Arc<dyn Clock>,
    settings: &RateLimitSettings,
) -> FixedWindowLimiter {
    let RateLimitPolicy { window, max } = settings.auth;
    FixedWindowLimiter::new(cache, clock, "rl:auth", window, max)
}
