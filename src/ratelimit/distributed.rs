use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use tracing::debug;

use crate::cache::{CacheOptions, CacheService};
use crate::infra::telemetry::RATELIMIT_REJECTED_TOTAL;
use crate::store::{Clock, saturating_millis};

use super::{RateLimitDecision, RateLimiter, SOURCE, fail_open};

const NAME: &str = "distributed";

/// Points consumed so far in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitState {
    pub consumed: u64,
    pub remaining: u64,
    pub reset_after: Duration,
}

/// Points-based limiter shared by every instance.
///
/// Same storage as the fixed window, but a rejected `consume` gives its
/// points back, so hammering a closed window does not push the next one out.
#[derive(Clone)]
pub struct DistributedRateLimiter {
    cache: CacheService,
    clock: Arc<dyn Clock>,
    prefix: String,
    points: u64,
    duration: Duration,
}

impl std::fmt::Debug for DistributedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedRateLimiter")
            .field("prefix", &self.prefix)
            .field("points", &self.points)
            .field("duration", &self.duration)
            .finish()
    }
}

impl DistributedRateLimiter {
    pub fn new(
        cache: CacheService,
        clock: Arc<dyn Clock>,
        prefix: impl Into<String>,
        points: u64,
        duration: Duration,
    ) -> Self {
        Self {
            cache,
            clock,
            prefix: prefix.into(),
            points,
            duration: duration.max(Duration::from_millis(1)),
        }
    }

    fn slot(&self, identifier: &str) -> (String, Duration) {
        let now = self.clock.now_ms();
        let window_ms = saturating_millis(self.duration);
        let window_id = now / window_ms;
        let reset_after = Duration::from_millis((window_id + 1).saturating_mul(window_ms).saturating_sub(now));
        (
            format!("{}:{identifier}:{window_id}", self.prefix),
            reset_after,
        )
    }

    fn options(&self) -> CacheOptions {
        CacheOptions::new().with_ttl(self.duration)
    }

    pub async fn consume(&self, identifier: &str, points: u64) -> RateLimitDecision {
        let (key, reset_after) = self.slot(identifier);
        let delta = i64::try_from(points).unwrap_or(i64::MAX);

        let Some(consumed) = self.cache.increment(&key, delta, &self.options()).await else {
            return fail_open(NAME, identifier, self.points, self.duration);
        };
        let consumed = consumed.max(0) as u64;

        if consumed > self.points {
            self.cache.decrement(&key, delta, &self.options()).await;
            counter!(RATELIMIT_REJECTED_TOTAL, "limiter" => NAME).increment(1);
            debug!(
                target: SOURCE,
                limiter = NAME,
                identifier,
                consumed,
                points,
                "rejected and rolled back"
            );
            return RateLimitDecision::rejected(self.points, reset_after, reset_after);
        }

        RateLimitDecision::allowed(self.points, self.points - consumed, reset_after)
    }

    /// Returns points to the current window.
    pub async fn reward(&self, identifier: &str, points: u64) -> Option<u64> {
        let (key, _) = self.slot(identifier);
        let delta = i64::try_from(points).unwrap_or(i64::MAX);
        self.cache
            .decrement(&key, delta, &self.options())
            .await
            .map(|consumed| consumed.max(0) as u64)
    }

    /// Current usage, `None` when the store cannot answer.
    pub async fn get(&self, identifier: &str) -> Option<RateLimitState> {
        let (key, reset_after) = self.slot(identifier);
        if !self.cache.is_available() {
            return None;
        }
        let consumed = self
            .cache
            .get::<i64>(&key, &CacheOptions::new())
            .await
            .unwrap_or(0)
            .max(0) as u64;
        Some(RateLimitState {
            consumed,
            remaining: self.points.saturating_sub(consumed),
            reset_after,
        })
    }

    /// Clears the identifier's current window.
    pub async fn delete(&self, identifier: &str) -> bool {
        let (key, _) = self.slot(identifier);
        self.cache.delete(&key, &CacheOptions::new()).await
    }
}

#[async_trait]
impl RateLimiter for DistributedRateLimiter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn check(&self, identifier: &str) -> RateLimitDecision {
        self.consume(identifier, 1).await
    }

    async fn refund(&self, identifier: &str) {
        self.reward(identifier, 1).await;
    }
}
