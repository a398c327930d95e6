//! Bulk invalidation: glob patterns, tag indices, dependency indices and
//! one-hop "related" fan-out.
//!
//! Every method reports the number of cache entries it removed. A failure on
//! one pattern or index is logged and skipped; the rest of the batch still
//! runs.

use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use tracing::{debug, warn};

use crate::infra::telemetry::CACHE_INVALIDATED_TOTAL;
use crate::store::StoreError;

use super::keys::{self, KeyId};
use super::service::{CacheOptions, CacheService};

const SOURCE: &str = "cylinder_cache::invalidation";

pub const DEFAULT_INDEX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct Invalidator {
    cache: CacheService,
    index_ttl: Duration,
}

impl Invalidator {
    pub fn new(cache: CacheService) -> Self {
        Self {
            cache,
            index_ttl: DEFAULT_INDEX_TTL,
        }
    }

    pub fn with_index_ttl(mut self, ttl: Duration) -> Self {
        self.index_ttl = ttl;
        self
    }

    pub fn cache(&self) -> &CacheService {
        &self.cache
    }

    fn record(&self, removed: u64) -> u64 {
        if removed > 0 {
            counter!(CACHE_INVALIDATED_TOTAL).increment(removed);
        }
        removed
    }

    // ========================================================================
    // Patterns
    // ========================================================================

    /// Deletes every key matching any of `patterns`.
    pub async fn invalidate_patterns<S: AsRef<str>>(&self, patterns: &[S]) -> u64 {
        let mut removed = 0;
        for pattern in patterns {
            let pattern = pattern.as_ref();
            match self.cache.try_delete_pattern(pattern).await {
                Ok(count) => {
                    debug!(target: SOURCE, pattern, removed = count, "pattern invalidated");
                    removed += count;
                }
                Err(err) => warn!(
                    target: SOURCE,
                    pattern,
                    error = %err,
                    "pattern invalidation failed, continuing"
                ),
            }
        }
        self.record(removed)
    }

    /// Deletes exact keys (relative to the app prefix), skipping failures.
    async fn invalidate_keys(&self, keys: &[String]) -> u64 {
        let mut removed = 0;
        for key in keys {
            let full = self.cache.effective_key(key, None);
            match self.cache.try_delete_keys(vec![full]).await {
                Ok(count) => removed += count,
                Err(err) => warn!(
                    target: SOURCE,
                    key = %key,
                    error = %err,
                    "key invalidation failed, continuing"
                ),
            }
        }
        self.record(removed)
    }

    /// Every entry, list, search and count of a resource.
    pub async fn invalidate_resource(&self, name: &str) -> u64 {
        self.invalidate_patterns(&[
            keys::resource_pattern(name),
            keys::list_pattern(name),
            keys::search_pattern(name),
            keys::count_pattern(name),
        ])
        .await
    }

    /// One entity, its sub-keys, and the collections that may contain it.
    pub async fn invalidate_resource_by_id(&self, name: &str, id: impl KeyId) -> u64 {
        let entity = keys::resource(name, id);
        let removed = self.invalidate_keys(std::slice::from_ref(&entity)).await;
        removed
            + self
                .invalidate_patterns(&[
                    format!("{entity}:*"),
                    keys::list_pattern(name),
                    keys::search_pattern(name),
                    keys::count_pattern(name),
                ])
                .await
    }

    pub async fn invalidate_user(&self, id: impl KeyId) -> u64 {
        let user = keys::user(&id);
        let removed = self.invalidate_keys(&[user]).await;
        removed + self.invalidate_patterns(&[keys::user_pattern(&id)]).await
    }

    /// The entity itself plus the lists and searches of each related
    /// resource. One hop only.
    pub async fn invalidate_related<S: AsRef<str>>(
        &self,
        entity: &str,
        id: impl KeyId,
        related: &[S],
    ) -> u64 {
        let mut removed = self.invalidate_keys(&[keys::resource(entity, id)]).await;
        let patterns: Vec<String> = related
            .iter()
            .flat_map(|name| {
                let name = name.as_ref();
                [keys::list_pattern(name), keys::search_pattern(name)]
            })
            .collect();
        removed += self.invalidate_patterns(&patterns).await;
        removed
    }

    pub async fn invalidate_lists(&self, resource: &str) -> u64 {
        self.invalidate_patterns(&[keys::list_pattern(resource)])
            .await
    }

    pub async fn invalidate_searches(&self, resource: &str) -> u64 {
        self.invalidate_patterns(&[keys::search_pattern(resource)])
            .await
    }

    // ========================================================================
    // Tag and dependency indices
    // ========================================================================

    /// Stores a value and records its key under each tag.
    pub async fn set_with_tags<T, S>(
        &self,
        key: &str,
        value: &T,
        tags: &[S],
        options: &CacheOptions,
    ) -> bool
    where
        T: Serialize + ?Sized,
        S: AsRef<str>,
    {
        let indices: Vec<String> = tags.iter().map(|tag| keys::tag(tag.as_ref())).collect();
        self.set_indexed(key, value, &indices, options).await
    }

    /// Stores a value and records it as a dependent of each upstream key.
    pub async fn set_with_dependencies<T, S>(
        &self,
        key: &str,
        value: &T,
        dependencies: &[S],
        options: &CacheOptions,
    ) -> bool
    where
        T: Serialize + ?Sized,
        S: AsRef<str>,
    {
        let indices: Vec<String> = dependencies
            .iter()
            .map(|dependency| keys::dependency(dependency.as_ref()))
            .collect();
        self.set_indexed(key, value, &indices, options).await
    }

    async fn set_indexed<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        indices: &[String],
        options: &CacheOptions,
    ) -> bool {
        if !self.cache.set(key, value, options).await {
            return false;
        }
        let member = [self.cache.effective_key(key, options.prefix.as_deref())];
        for index in indices {
            if let Err(err) = self.cache.try_index_add(index, &member, self.index_ttl).await {
                warn!(
                    target: SOURCE,
                    index = %index,
                    key = %member[0],
                    error = %err,
                    "failed to record index membership"
                );
            }
        }
        true
    }

    pub async fn invalidate_tag(&self, tag: &str) -> u64 {
        self.invalidate_index(&keys::tag(tag)).await
    }

    pub async fn invalidate_tags<S: AsRef<str>>(&self, tags: &[S]) -> u64 {
        let mut removed = 0;
        for tag in tags {
            removed += self.invalidate_tag(tag.as_ref()).await;
        }
        removed
    }

    /// Removes everything recorded as depending on `dependency`. Does not
    /// cascade to dependents of dependents.
    pub async fn invalidate_dependents(&self, dependency: &str) -> u64 {
        self.invalidate_index(&keys::dependency(dependency)).await
    }

    async fn invalidate_index(&self, index: &str) -> u64 {
        match self.try_invalidate_index(index).await {
            Ok(removed) => {
                debug!(target: SOURCE, index, removed, "index invalidated");
                self.record(removed)
            }
            Err(err) => {
                warn!(target: SOURCE, index, error = %err, "index invalidation failed");
                0
            }
        }
    }

    async fn try_invalidate_index(&self, index: &str) -> Result<u64, StoreError> {
        let members = self.cache.try_index_members(index).await?;
        let removed = if members.is_empty() {
            0
        } else {
            self.cache.try_delete_keys(members).await?
        };
        self.cache
            .try_delete_keys(vec![self.cache.effective_key(index, None)])
            .await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::cache_with_clock;
    use crate::store::KvStore;
    use serde_json::json;

    fn options() -> CacheOptions {
        CacheOptions::new()
    }

    #[tokio::test]
    async fn tag_invalidation_removes_members_and_index() {
        let (cache, memory, _) = cache_with_clock("app");
        let invalidator = Invalidator::new(cache.clone());

        assert!(invalidator.set_with_tags("k1", &1, &["A"], &options()).await);
        assert!(invalidator.set_with_tags("k2", &2, &["A", "B"], &options()).await);
        assert!(memory.exists("app:tag:A").await.unwrap());

        assert_eq!(invalidator.invalidate_tag("A").await, 2);
        assert!(!cache.exists("k1", &options()).await);
        assert!(!cache.exists("k2", &options()).await);
        assert!(!memory.exists("app:tag:A").await.unwrap());

        // k2 is already gone; the second tag is a no-op on it.
        assert_eq!(invalidator.invalidate_tag("B").await, 0);
        assert!(!memory.exists("app:tag:B").await.unwrap());
    }

    #[tokio::test]
    async fn index_entries_expire() {
        let (cache, memory, clock) = cache_with_clock("app");
        let invalidator = Invalidator::new(cache).with_index_ttl(Duration::from_secs(10));
        invalidator.set_with_tags("k", &1, &["t"], &options()).await;

        clock.advance(Duration::from_secs(10));
        assert!(!memory.exists("app:tag:t").await.unwrap());
    }

    #[tokio::test]
    async fn dependents_are_removed_one_level_deep() {
        let (cache, _, _) = cache_with_clock("app");
        let invalidator = Invalidator::new(cache.clone());

        invalidator
            .set_with_dependencies("summary:outlet:1", &"s", &["outlet:1"], &options())
            .await;
        invalidator
            .set_with_dependencies("report:weekly", &"r", &["summary:outlet:1"], &options())
            .await;

        assert_eq!(invalidator.invalidate_dependents("outlet:1").await, 1);
        assert!(!cache.exists("summary:outlet:1", &options()).await);
        assert!(cache.exists("report:weekly", &options()).await);
    }

    #[tokio::test]
    async fn prefixed_entries_are_indexed_by_full_key() {
        let (cache, _, _) = cache_with_clock("app");
        let invalidator = Invalidator::new(cache.clone());
        let scoped = CacheOptions::new().with_prefix("api");

        invalidator.set_with_tags("k", &1, &["t"], &scoped).await;
        assert_eq!(invalidator.invalidate_tag("t").await, 1);
        assert!(!cache.exists("k", &scoped).await);
    }

    #[tokio::test]
    async fn resource_invalidation_spares_other_resources() {
        let (cache, _, _) = cache_with_clock("app");
        let invalidator = Invalidator::new(cache.clone());
        let filters = json!({"status": "active"});

        for key in [
            keys::resource("product", 42),
            keys::list("product", 1, 20, &filters),
            keys::search("product", "gas", &filters),
            keys::count("product", &filters),
            keys::resource("outlet", 1),
        ] {
            cache.set(&key, &true, &options()).await;
        }

        assert_eq!(invalidator.invalidate_resource("product").await, 4);
        assert!(cache.exists(&keys::resource("outlet", 1), &options()).await);
    }

    #[tokio::test]
    async fn resource_by_id_keeps_siblings() {
        let (cache, _, _) = cache_with_clock("app");
        let invalidator = Invalidator::new(cache.clone());
        for key in ["product:42", "product:42:stock", "product:43", "list:product:1:20:all"] {
            cache.set(key, &true, &options()).await;
        }

        assert_eq!(invalidator.invalidate_resource_by_id("product", 42).await, 3);
        assert!(cache.exists("product:43", &options()).await);
    }

    #[tokio::test]
    async fn related_invalidation_is_one_hop() {
        let (cache, _, _) = cache_with_clock("app");
        let invalidator = Invalidator::new(cache.clone());
        for key in [
            "lease:9",
            "list:lease:1:20:all",
            "list:cylinder:1:20:all",
            "search:cylinder:abc:all",
            "list:outlet:1:20:all",
        ] {
            cache.set(key, &true, &options()).await;
        }

        let removed = invalidator
            .invalidate_related("lease", 9, &["cylinder"])
            .await;
        assert_eq!(removed, 3);
        assert!(cache.exists("list:lease:1:20:all", &options()).await);
        assert!(cache.exists("list:outlet:1:20:all", &options()).await);
    }

    #[tokio::test]
    async fn user_invalidation_covers_scoped_keys() {
        let (cache, _, _) = cache_with_clock("app");
        let invalidator = Invalidator::new(cache.clone());
        for key in [keys::user(5), keys::user_scoped(5, "leases"), keys::user(6)] {
            cache.set(&key, &true, &options()).await;
        }

        assert_eq!(invalidator.invalidate_user(5).await, 2);
        assert!(cache.exists(&keys::user(6), &options()).await);
    }

    #[tokio::test]
    async fn degraded_store_reports_zero() {
        let (cache, memory, _) = cache_with_clock("app");
        let invalidator = Invalidator::new(cache);
        memory.set_available(false);

        assert_eq!(invalidator.invalidate_resource("product").await, 0);
        assert_eq!(invalidator.invalidate_tag("A").await, 0);
        assert!(!invalidator.set_with_tags("k", &1, &["A"], &options()).await);
    }
}
