use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tracing::debug;

use crate::cache::{CacheOptions, CacheService};
use crate::infra::telemetry::RATELIMIT_REJECTED_TOTAL;
use crate::store::{Clock, saturating_millis};

use super::{RateLimitDecision, RateLimiter, SOURCE, fail_open};

const NAME: &str = "fixed_window";

/// Counter per `(identifier, floor(now / window))`.
///
/// The increment happens before the decision and is kept even when the
/// request is rejected, so hammering a closed window keeps it closed.
#[derive(Clone)]
pub struct FixedWindowLimiter {
    cache: CacheService,
    clock: Arc<dyn Clock>,
    prefix: String,
    window: Duration,
    max: u64,
}

impl std::fmt::Debug for FixedWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindowLimiter")
            .field("prefix", &self.prefix)
            .field("window", &self.window)
            .field("max", &self.max)
            .finish()
    }
}

impl FixedWindowLimiter {
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
            window: window.max(Duration::from_millis(1)),
            max,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    fn window_ms(&self) -> u64 {
        saturating_millis(self.window)
    }

    /// Current window id and the time left in it.
    fn current_window(&self) -> (u64, Duration) {
        let now = self.clock.now_ms();
        let window_ms = self.window_ms();
        let id = now / window_ms;
        let reset_at = (id + 1).saturating_mul(window_ms);
        (id, Duration::from_millis(reset_at.saturating_sub(now)))
    }

    fn key(&self, identifier: &str, window_id: u64) -> String {
        format!("{}:{identifier}:{window_id}", self.prefix)
    }

    fn options(&self) -> CacheOptions {
        CacheOptions::new().with_ttl(self.window)
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn check(&self, identifier: &str) -> RateLimitDecision {
        let (window_id, reset_after) = self.current_window();
        let key = self.key(identifier, window_id);

        let Some(count) = self.cache.increment(&key, 1, &self.options()).await else {
            return fail_open(NAME, identifier, self.max, self.window);
        };
        let count = count.max(0) as u64;

        if count > self.max {
            counter!(RATELIMIT_REJECTED_TOTAL, "limiter" => NAME).increment(1);
            debug!(target: SOURCE, limiter = NAME, identifier, count, max = self.max, "rejected");
            return RateLimitDecision::rejected(self.max, reset_after, reset_after);
        }

        RateLimitDecision::allowed(self.max, self.max - count, reset_after)
    }

    async fn refund(&self, identifier: &str) {
        let (window_id, _) = self.current_window();
        let key = self.key(identifier, window_id);
        self.cache.decrement(&key, 1, &self.options()).await;
    }
}
