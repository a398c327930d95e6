//! Namespaced cache operations on top of [`StoreClient`].
//!
//! Every public method swallows store failures: the error is logged and
//! counted, and the caller receives the documented safe default (`None`,
//! `false`, `0`). The crate-internal `try_*` variants keep the error for
//! callers that need to report per-item failures.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::infra::telemetry::{CACHE_ERROR_TOTAL, CACHE_HIT_TOTAL, CACHE_MISS_TOTAL};
use crate::store::{
    ConnectionStatus, KeyTtl, KvStore, SlidingWindowOutcome, StoreClient, StoreError,
    TokenBucketOutcome, TokenBucketRequest,
};

const SOURCE: &str = "cylinder_cache::cache";
const DELETE_CHUNK: usize = 500;

/// Per-call options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// `None` falls back to the service default; `Some(ZERO)` means no expiry.
    pub ttl: Option<Duration>,
    pub prefix: Option<String>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn no_expiry(self) -> Self {
        self.with_ttl(Duration::ZERO)
    }
}

#[derive(Clone)]
pub struct CacheService {
    client: Arc<StoreClient>,
    app_prefix: String,
    default_ttl: Option<Duration>,
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("app_prefix", &self.app_prefix)
            .field("default_ttl", &self.default_ttl)
            .field("client", &self.client)
            .finish()
    }
}

impl CacheService {
    pub fn new(client: Arc<StoreClient>, app_prefix: impl Into<String>) -> Self {
        Self {
            client,
            app_prefix: app_prefix.into(),
            default_ttl: None,
        }
    }

    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl.filter(|ttl| !ttl.is_zero());
        self
    }

    pub fn client(&self) -> &Arc<StoreClient> {
        &self.client
    }

    pub fn app_prefix(&self) -> &str {
        &self.app_prefix
    }

    pub fn status(&self) -> ConnectionStatus {
        self.client.status()
    }

    pub fn is_available(&self) -> bool {
        self.client.is_available()
    }

    /// `[app_prefix]:[prefix]:[key]`, skipping empty components.
    pub fn effective_key(&self, key: &str, prefix: Option<&str>) -> String {
        [self.app_prefix.as_str(), prefix.unwrap_or_default(), key]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(":")
    }

    fn key_for(&self, key: &str, options: &CacheOptions) -> String {
        self.effective_key(key, options.prefix.as_deref())
    }

    fn write_ttl(&self, options: &CacheOptions) -> Option<Duration> {
        match options.ttl {
            Some(ttl) if ttl.is_zero() => None,
            Some(ttl) => Some(ttl),
            None => self.default_ttl,
        }
    }

    async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(Arc<dyn KvStore>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.client.execute(op, f).await
    }

    fn report(&self, op: &'static str, key: &str, err: &StoreError) {
        counter!(CACHE_ERROR_TOTAL, "op" => op).increment(1);
        if matches!(err, StoreError::Unavailable) {
            debug!(target: SOURCE, op, key, "skipped, store degraded");
        } else {
            warn!(target: SOURCE, op, key, error = %err, "cache operation failed");
        }
    }

    // ========================================================================
    // Single-key operations
    // ========================================================================

    /// Reads and decodes a value. Misses, decode failures and store errors
    /// all yield `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, options: &CacheOptions) -> Option<T> {
        let full = self.key_for(key, options);
        let lookup = full.clone();
        match self
            .run("get", |store| async move { store.get(&lookup).await })
            .await
        {
            Ok(Some(raw)) => match decode(raw) {
                Ok(value) => {
                    counter!(CACHE_HIT_TOTAL).increment(1);
                    debug!(target: SOURCE, key = %full, outcome = "hit");
                    Some(value)
                }
                Err(err) => {
                    self.report("decode", &full, &err);
                    counter!(CACHE_MISS_TOTAL).increment(1);
                    None
                }
            },
            Ok(None) => {
                counter!(CACHE_MISS_TOTAL).increment(1);
                debug!(target: SOURCE, key = %full, outcome = "miss");
                None
            }
            Err(err) => {
                self.report("get", &full, &err);
                counter!(CACHE_MISS_TOTAL).increment(1);
                None
            }
        }
    }

    /// Serializes and writes a value; returns whether the write landed.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: &CacheOptions,
    ) -> bool {
        let full = self.key_for(key, options);
        match self.try_set_raw(&full, value, self.write_ttl(options)).await {
            Ok(()) => true,
            Err(err) => {
                self.report("set", &full, &err);
                false
            }
        }
    }

    pub(crate) async fn try_set_raw<T: Serialize + ?Sized>(
        &self,
        full_key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(value)?;
        let key = full_key.to_string();
        self.run("set", |store| async move {
            store.set(&key, &payload, ttl).await
        })
        .await
    }

    /// Removes one key; `true` only when it existed.
    pub async fn delete(&self, key: &str, options: &CacheOptions) -> bool {
        let full = self.key_for(key, options);
        match self.try_delete_keys(vec![full.clone()]).await {
            Ok(removed) => removed > 0,
            Err(err) => {
                self.report("delete", &full, &err);
                false
            }
        }
    }

    /// Deletes several keys; returns how many existed.
    pub async fn delete_many(&self, keys: &[String], options: &CacheOptions) -> u64 {
        let full: Vec<String> = keys.iter().map(|key| self.key_for(key, options)).collect();
        match self.try_delete_keys(full).await {
            Ok(removed) => removed,
            Err(err) => {
                self.report("delete_many", &keys.join(","), &err);
                0
            }
        }
    }

    /// Deletes fully-qualified keys in chunks.
    pub(crate) async fn try_delete_keys(&self, keys: Vec<String>) -> Result<u64, StoreError> {
        let mut removed = 0;
        for chunk in keys.chunks(DELETE_CHUNK) {
            let chunk = chunk.to_vec();
            removed += self
                .run("delete", |store| async move { store.del(&chunk).await })
                .await?;
        }
        Ok(removed)
    }

    /// Deletes every key matching `pattern` below the app prefix.
    pub async fn delete_pattern(&self, pattern: &str) -> u64 {
        match self.try_delete_pattern(pattern).await {
            Ok(removed) => removed,
            Err(err) => {
                self.report("delete_pattern", pattern, &err);
                0
            }
        }
    }

    pub(crate) async fn try_delete_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        let glob = self.effective_key(pattern, None);
        let keys = self
            .run("scan", |store| async move { store.scan(&glob).await })
            .await?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.try_delete_keys(keys).await
    }

    pub async fn exists(&self, key: &str, options: &CacheOptions) -> bool {
        let full = self.key_for(key, options);
        let lookup = full.clone();
        self.run("exists", |store| async move { store.exists(&lookup).await })
            .await
            .unwrap_or_else(|err| {
                self.report("exists", &full, &err);
                false
            })
    }

    pub async fn expire(&self, key: &str, ttl: Duration, options: &CacheOptions) -> bool {
        let full = self.key_for(key, options);
        let target = full.clone();
        self.run("expire", |store| async move {
            store.expire(&target, ttl).await
        })
        .await
        .unwrap_or_else(|err| {
            self.report("expire", &full, &err);
            false
        })
    }

    pub async fn ttl(&self, key: &str, options: &CacheOptions) -> KeyTtl {
        let full = self.key_for(key, options);
        let target = full.clone();
        self.run("ttl", |store| async move { store.ttl(&target).await })
            .await
            .unwrap_or_else(|err| {
                self.report("ttl", &full, &err);
                KeyTtl::Missing
            })
    }

    // ========================================================================
    // Counters
    // ========================================================================

    /// Atomically adds `amount`. A TTL in `options` is attached only when
    /// this call created the key.
    pub async fn increment(&self, key: &str, amount: i64, options: &CacheOptions) -> Option<i64> {
        self.add(key, amount, options, "increment").await
    }

    pub async fn decrement(&self, key: &str, amount: i64, options: &CacheOptions) -> Option<i64> {
        self.add(key, amount.saturating_neg(), options, "decrement")
            .await
    }

    async fn add(
        &self,
        key: &str,
        delta: i64,
        options: &CacheOptions,
        op: &'static str,
    ) -> Option<i64> {
        let full = self.key_for(key, options);
        let target = full.clone();
        let ttl = options.ttl.filter(|ttl| !ttl.is_zero());
        match self
            .run(op, |store| async move {
                store.incr_by(&target, delta, ttl).await
            })
            .await
        {
            Ok(value) => Some(value),
            Err(err) => {
                self.report(op, &full, &err);
                None
            }
        }
    }

    // ========================================================================
    // Batches
    // ========================================================================

    /// Reads many keys, preserving order.
    pub async fn mget<T: DeserializeOwned>(
        &self,
        keys: &[String],
        options: &CacheOptions,
    ) -> Vec<Option<T>> {
        if keys.is_empty() {
            return Vec::new();
        }
        let full: Vec<String> = keys.iter().map(|key| self.key_for(key, options)).collect();
        let lookup = full.clone();
        match self
            .run("mget", |store| async move { store.mget(&lookup).await })
            .await
        {
            Ok(values) => values
                .into_iter()
                .zip(full.iter())
                .map(|(raw, key)| match raw {
                    Some(raw) => match decode(raw) {
                        Ok(value) => {
                            counter!(CACHE_HIT_TOTAL).increment(1);
                            Some(value)
                        }
                        Err(err) => {
                            self.report("decode", key, &err);
                            None
                        }
                    },
                    None => {
                        counter!(CACHE_MISS_TOTAL).increment(1);
                        None
                    }
                })
                .collect(),
            Err(err) => {
                self.report("mget", &full.join(","), &err);
                keys.iter().map(|_| None).collect()
            }
        }
    }

    /// Writes every entry in one atomic batch.
    pub async fn mset<T: Serialize>(&self, entries: &[(String, T)], options: &CacheOptions) -> bool {
        if entries.is_empty() {
            return true;
        }
        let encoded: Result<Vec<(String, String)>, serde_json::Error> = entries
            .iter()
            .map(|(key, value)| Ok((self.key_for(key, options), serde_json::to_string(value)?)))
            .collect();
        let encoded = match encoded {
            Ok(encoded) => encoded,
            Err(err) => {
                self.report("mset", "batch", &StoreError::from(err));
                return false;
            }
        };

        let ttl = self.write_ttl(options);
        match self
            .run("mset", |store| async move { store.mset(&encoded, ttl).await })
            .await
        {
            Ok(()) => true,
            Err(err) => {
                self.report("mset", "batch", &err);
                false
            }
        }
    }

    /// Removes everything under the app prefix, or the whole store when no
    /// prefix is configured.
    pub async fn flush(&self) -> bool {
        let result = if self.app_prefix.is_empty() {
            self.run("flush", |store| async move { store.flush().await })
                .await
        } else {
            self.try_delete_pattern("*").await.map(|_| ())
        };
        match result {
            Ok(()) => {
                warn!(target: SOURCE, app_prefix = %self.app_prefix, "cache flushed");
                true
            }
            Err(err) => {
                self.report("flush", "*", &err);
                false
            }
        }
    }

    /// Cache-aside in one call. Loader errors are returned as-is and never cached.
    pub async fn get_or_set<T, E, F, Fut>(
        &self,
        key: &str,
        options: &CacheOptions,
        loader: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get(key, options).await {
            return Ok(cached);
        }
        let value = loader().await?;
        self.set(key, &value, options).await;
        Ok(value)
    }

    // ========================================================================
    // Primitives for invalidation indices and rate limiters
    // ========================================================================

    pub(crate) async fn try_index_add(
        &self,
        index_key: &str,
        members: &[String],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let full = self.effective_key(index_key, None);
        let members = members.to_vec();
        self.run("index_add", |store| async move {
            store.set_add(&full, &members, Some(ttl)).await
        })
        .await
    }

    pub(crate) async fn try_index_members(&self, index_key: &str) -> Result<Vec<String>, StoreError> {
        let full = self.effective_key(index_key, None);
        self.run("index_members", |store| async move {
            store.set_members(&full).await
        })
        .await
    }

    pub(crate) async fn sliding_window_hit(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
        max: u64,
        member: &str,
    ) -> Option<SlidingWindowOutcome> {
        let full = self.effective_key(key, None);
        let target = full.clone();
        let member = member.to_string();
        self.run("sliding_window_hit", |store| async move {
            store
                .sliding_window_hit(&target, now_ms, window, max, &member)
                .await
        })
        .await
        .map_err(|err| self.report("sliding_window_hit", &full, &err))
        .ok()
    }

    pub(crate) async fn token_bucket_take(
        &self,
        key: &str,
        request: TokenBucketRequest,
    ) -> Option<TokenBucketOutcome> {
        let full = self.effective_key(key, None);
        let target = full.clone();
        self.run("token_bucket_take", |store| async move {
            store.token_bucket_take(&target, request).await
        })
        .await
        .map_err(|err| self.report("token_bucket_take", &full, &err))
        .ok()
    }
}

/// JSON first; a value that is not valid JSON is treated as a plain string.
fn decode<T: DeserializeOwned>(raw: String) -> Result<T, StoreError> {
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(value),
        Err(_) => Ok(serde_json::from_value(Value::String(raw))?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::cache_with_clock;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Product {
        id: u64,
        name: String,
    }

    #[test]
    fn effective_key_skips_empty_parts() {
        let (cache, _, _) = cache_with_clock("app");
        assert_eq!(cache.effective_key("k", None), "app:k");
        assert_eq!(cache.effective_key("k", Some("p")), "app:p:k");

        let (bare, _, _) = cache_with_clock("");
        assert_eq!(bare.effective_key("k", None), "k");
        assert_eq!(bare.effective_key("k", Some("")), "k");
    }

    #[tokio::test]
    async fn values_round_trip_under_prefix() {
        let (cache, memory, _) = cache_with_clock("app");
        let product = Product {
            id: 42,
            name: "Cylinder 12kg".into(),
        };
        let options = CacheOptions::new().with_prefix("catalog");

        assert!(cache.set("product:42", &product, &options).await);
        assert!(memory.exists("app:catalog:product:42").await.unwrap());
        assert_eq!(
            cache.get::<Product>("product:42", &options).await,
            Some(product)
        );
        assert_eq!(cache.get::<Product>("product:42", &CacheOptions::new()).await, None);
    }

    #[tokio::test]
    async fn raw_strings_decode_as_fallback() {
        let (cache, memory, _) = cache_with_clock("app");
        memory.set("app:greeting", "hello there", None).await.unwrap();
        assert_eq!(
            cache.get::<String>("greeting", &CacheOptions::new()).await,
            Some("hello there".to_string())
        );
        assert_eq!(cache.get::<u64>("greeting", &CacheOptions::new()).await, None);
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let (cache, _, clock) = cache_with_clock("app");
        let options = CacheOptions::new().with_ttl(Duration::from_secs(2));
        cache.set("k", &1u32, &options).await;

        clock.advance(Duration::from_millis(1_999));
        assert_eq!(cache.get::<u32>("k", &options).await, Some(1));
        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get::<u32>("k", &options).await, None);
    }

    #[tokio::test]
    async fn default_ttl_applies_unless_zero_given() {
        let (cache, _, _) = cache_with_clock("app");
        let cache = cache.with_default_ttl(Some(Duration::from_secs(60)));

        cache.set("a", &1, &CacheOptions::new()).await;
        cache.set("b", &1, &CacheOptions::new().no_expiry()).await;

        assert_eq!(
            cache.ttl("a", &CacheOptions::new()).await,
            KeyTtl::Expires(Duration::from_secs(60))
        );
        assert_eq!(cache.ttl("b", &CacheOptions::new()).await, KeyTtl::Persistent);
        assert_eq!(cache.ttl("c", &CacheOptions::new()).await, KeyTtl::Missing);
    }

    #[tokio::test]
    async fn increment_and_decrement() {
        let (cache, _, _) = cache_with_clock("app");
        let options = CacheOptions::new();
        assert_eq!(cache.increment("hits", 5, &options).await, Some(5));
        assert_eq!(cache.decrement("hits", 2, &options).await, Some(3));
    }

    #[tokio::test]
    async fn delete_reports_whether_the_key_existed() {
        let (cache, _, _) = cache_with_clock("app");
        let options = CacheOptions::new();
        cache.set("present", &1u8, &options).await;

        assert!(cache.delete("present", &options).await);
        assert!(!cache.delete("present", &options).await);
        assert!(!cache.delete("never-set", &options).await);
    }

    #[tokio::test]
    async fn pattern_delete_is_scoped() {
        let (cache, memory, _) = cache_with_clock("app");
        let options = CacheOptions::new();
        for key in ["list:product:1:20", "list:product:2:20", "product:42"] {
            cache.set(key, &true, &options).await;
        }
        memory.set("other:list:product:9", "1", None).await.unwrap();

        assert_eq!(cache.delete_pattern("list:product:*").await, 2);
        assert!(cache.exists("product:42", &options).await);
        assert!(memory.exists("other:list:product:9").await.unwrap());
    }

    #[tokio::test]
    async fn mget_preserves_order_and_misses() {
        let (cache, _, _) = cache_with_clock("app");
        let options = CacheOptions::new();
        assert!(
            cache
                .mset(&[("a".to_string(), 1u8), ("c".to_string(), 3u8)], &options)
                .await
        );
        let values: Vec<Option<u8>> = cache
            .mget(&["a".into(), "b".into(), "c".into()], &options)
            .await;
        assert_eq!(values, vec![Some(1), None, Some(3)]);
    }

    #[tokio::test]
    async fn flush_only_touches_app_prefix() {
        let (cache, memory, _) = cache_with_clock("app");
        cache.set("a", &1, &CacheOptions::new()).await;
        memory.set("foreign", "1", None).await.unwrap();

        assert!(cache.flush().await);
        assert!(!cache.exists("a", &CacheOptions::new()).await);
        assert!(memory.exists("foreign").await.unwrap());
    }

    #[tokio::test]
    async fn get_or_set_loads_once() {
        let (cache, _, _) = cache_with_clock("app");
        let options = CacheOptions::new();
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let load = || async {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok::<u32, ()>(42)
        };

        assert_eq!(cache.get_or_set("answer", &options, load).await, Ok(42));
        assert_eq!(cache.get_or_set("answer", &options, load).await, Ok(42));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        let failed: Result<u32, &str> = cache
            .get_or_set("broken", &options, || async { Err("db down") })
            .await;
        assert_eq!(failed, Err("db down"));
        assert!(!cache.exists("broken", &options).await);
    }
}
