use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tracing::debug;

use crate::cache::CacheService;
use crate::infra::telemetry::RATELIMIT_REJECTED_TOTAL;
use crate::store::{Clock, TokenBucketRequest};

use super::{RateLimitDecision, RateLimiter, SOURCE, fail_open};

const NAME: &str = "token_bucket";

/// Idle lifetime of a bucket's persisted state.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(60 * 60);

/// Continuous refill at `refill_per_sec`, bursts up to `capacity`.
///
/// Refill is applied lazily on each call. A rejected call still persists the
/// refilled level so accrued tokens are never lost.
#[derive(Clone)]
pub struct TokenBucketLimiter {
    cache: CacheService,
    clock: Arc<dyn Clock>,
    prefix: String,
    capacity: f64,
    refill_per_sec: f64,
    state_ttl: Duration,
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("prefix", &self.prefix)
            .field("capacity", &self.capacity)
            .field("refill_per_sec", &self.refill_per_sec)
            .finish()
    }
}

impl TokenBucketLimiter {
    pub fn new(
        cache: CacheService,
        clock: Arc<dyn Clock>,
        prefix: impl Into<String>,
        capacity: f64,
        refill_per_sec: f64,
    ) -> Self {
        Self {
            cache,
            clock,
            prefix: prefix.into(),
            capacity: capacity.max(0.0),
            refill_per_sec: refill_per_sec.max(0.0),
            state_ttl: DEFAULT_STATE_TTL,
        }
    }

    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = ttl;
        self
    }

    /// Time until `missing` tokens accrue. Saturates at [`Duration::MAX`]
    /// when the bucket cannot refill that far.
    fn secs_to_refill(&self, missing: f64) -> Duration {
        if missing.is_nan() || missing <= 0.0 {
            return Duration::ZERO;
        }
        if self.refill_per_sec <= 0.0 {
            return self.state_ttl;
        }
        Duration::try_from_secs_f64(missing / self.refill_per_sec).unwrap_or(Duration::MAX)
    }

    /// Withdraws `tokens` from the identifier's bucket.
    ///
    /// Negative or non-finite amounts are rejected without touching the store.
    pub async fn consume(&self, identifier: &str, tokens: f64) -> RateLimitDecision {
        let limit = self.capacity as u64;
        if !tokens.is_finite() || tokens < 0.0 {
            debug!(target: SOURCE, limiter = NAME, identifier, requested = tokens, "invalid amount");
            return RateLimitDecision::rejected(limit, Duration::ZERO, Duration::MAX);
        }
        let request = TokenBucketRequest {
            capacity: self.capacity,
            refill_per_sec: self.refill_per_sec,
            requested: tokens,
            now_ms: self.clock.now_ms(),
            ttl: self.state_ttl,
        };
        let key = format!("{}:{identifier}", self.prefix);

        let Some(outcome) = self.cache.token_bucket_take(&key, request).await else {
            return fail_open(NAME, identifier, limit, self.secs_to_refill(self.capacity));
        };

        let reset_after = self.secs_to_refill(self.capacity - outcome.tokens);
        if !outcome.allowed {
            counter!(RATELIMIT_REJECTED_TOTAL, "limiter" => NAME).increment(1);
            debug!(
                target: SOURCE,
                limiter = NAME,
                identifier,
                tokens = outcome.tokens,
                requested = tokens,
                "rejected"
            );
            let retry_after = self.secs_to_refill(tokens - outcome.tokens);
            return RateLimitDecision::rejected(limit, reset_after, retry_after);
        }

        RateLimitDecision::allowed(limit, outcome.tokens.floor() as u64, reset_after)
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn check(&self, identifier: &str) -> RateLimitDecision {
        self.consume(identifier, 1.0).await
    }
}
