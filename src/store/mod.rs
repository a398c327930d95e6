//! Backing store access.
//!
//! The cache layer never talks to Redis directly. Everything goes through
//! [`KvStore`], which lists exactly the primitives the cache, the invalidation
//! indices and the rate limiters need. Multi-step operations that must not race
//! (`incr_by` with TTL attachment, `sliding_window_hit`, `token_bucket_take`,
//! `mset`) are atomic at the store level in every implementation.
//!
//! [`StoreClient`] owns the connection lifecycle: bounded retry on connect,
//! degraded mode on connection loss and a reconnect supervisor.

mod client;
mod clock;
mod glob;
mod lock;
mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use client::{ClientSettings, ConnectionStatus, Connector, StoreClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use glob::glob_match;
pub use memory::MemoryStore;
pub use redis_store::{RedisConnector, RedisStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),
    #[error("store operation `{op}` timed out after {timeout_ms}ms")]
    Timeout { op: &'static str, timeout_ms: u64 },
    #[error("store unavailable (degraded mode)")]
    Unavailable,
    #[error("store command failed: {0}")]
    Command(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::Command(message.into())
    }

    /// Whether the failure means the store itself is unreachable.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Unavailable)
    }
}

/// Milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

impl KeyTtl {
    /// Maps a Redis `PTTL` reply.
    pub fn from_pttl(reply: i64) -> Self {
        match reply {
            -2 => Self::Missing,
            -1 => Self::Persistent,
            ms if ms >= 0 => Self::Expires(Duration::from_millis(ms as u64)),
            _ => Self::Missing,
        }
    }
}

/// Result of one sliding-window log access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowOutcome {
    pub allowed: bool,
    /// Entries in the window after this access.
    pub count: u64,
    /// Timestamp of the oldest entry still inside the window.
    pub oldest_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketRequest {
    pub capacity: f64,
    pub refill_per_sec: f64,
    pub requested: f64,
    pub now_ms: u64,
    /// Idle lifetime of the persisted state.
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketOutcome {
    pub allowed: bool,
    /// Tokens left after the refill and, when allowed, the withdrawal.
    pub tokens: f64,
}

/// Refills and withdraws from a bucket. Shared by every store so the
/// arithmetic is identical to the Lua script in [`RedisStore`].
pub(crate) fn apply_token_bucket(
    state: Option<(f64, u64)>,
    request: &TokenBucketRequest,
) -> (TokenBucketOutcome, (f64, u64)) {
    let (tokens, last_refill) = state.unwrap_or((request.capacity, request.now_ms));
    let elapsed_secs = request.now_ms.saturating_sub(last_refill) as f64 / 1000.0;
    let refilled = (tokens + elapsed_secs * request.refill_per_sec).clamp(0.0, request.capacity);

    let (allowed, remaining) = if refilled >= request.requested {
        (true, refilled - request.requested)
    } else {
        (false, refilled)
    };

    (
        TokenBucketOutcome {
            allowed,
            tokens: remaining,
        },
        (remaining, request.now_ms),
    )
}

/// Primitive operations of the shared key-value service.
///
/// Keys passed here are already fully namespaced by the caller; an
/// implementation may add its own store-level namespace but must hide it
/// (keys returned by [`KvStore::scan`] are usable as-is with [`KvStore::del`]).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes a value; `None` or a zero TTL means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Deletes keys and returns how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Expands a glob into matching keys.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError>;

    /// Atomically adds `delta`. When `ttl` is set and the result equals
    /// `delta` (the key was just created), the TTL is attached in the same step.
    async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StoreError>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    /// Writes every entry in one atomic batch.
    async fn mset(
        &self,
        entries: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Adds members to a set and refreshes the set's TTL.
    async fn set_add(
        &self,
        key: &str,
        members: &[String],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Prunes entries at or before `now_ms - window`, counts the rest and,
    /// when fewer than `max`, appends `(now_ms, member)` and refreshes the TTL.
    async fn sliding_window_hit(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
        max: u64,
        member: &str,
    ) -> Result<SlidingWindowOutcome, StoreError>;

    /// Lazily refills the bucket, withdraws `requested` if possible and
    /// persists the resulting state either way.
    async fn token_bucket_take(
        &self,
        key: &str,
        request: TokenBucketRequest,
    ) -> Result<TokenBucketOutcome, StoreError>;

    /// Removes every key visible to this store.
    async fn flush(&self) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
