//! Cache-aside wrappers for arbitrary async operations.
//!
//! A policy ([`Cacheable`], [`CacheEvict`], [`CachePut`]) is built once and
//! then wraps an operation `Fn(A) -> Future<Output = Result<T, E>>`. The
//! returned value exposes `call(args)` with the same signature as the
//! wrapped operation. The cache is a side channel: a failing store never
//! changes the wrapped operation's result, and errors are never cached.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::keys::{KeyPart, hash_parts};
use super::service::{CacheOptions, CacheService};

const SOURCE: &str = "cylinder_cache::memo";

type Predicate<X> = Arc<dyn Fn(&X) -> bool + Send + Sync>;
type KeyFn<A> = Arc<dyn Fn(&A) -> String + Send + Sync>;

/// Where a wrapper's cache key comes from.
pub enum KeySource<A> {
    /// Same key for every call.
    Static(String),
    /// Computed from the arguments.
    Derived(KeyFn<A>),
    /// `<name>:<digest of the serialized arguments>`.
    Arguments,
}

impl<A> Clone for KeySource<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Static(key) => Self::Static(key.clone()),
            Self::Derived(f) => Self::Derived(Arc::clone(f)),
            Self::Arguments => Self::Arguments,
        }
    }
}

impl<A: Serialize> KeySource<A> {
    fn resolve(&self, name: &str, args: &A) -> String {
        match self {
            Self::Static(key) => key.clone(),
            Self::Derived(f) => f(args),
            Self::Arguments => format!("{name}:{}", hash_parts(&[KeyPart::json(args)])),
        }
    }
}

/// Fields shared by all three policies.
struct Policy<A> {
    cache: CacheService,
    name: String,
    options: CacheOptions,
    key: KeySource<A>,
    condition: Option<Predicate<A>>,
}

impl<A: Serialize> Policy<A> {
    fn new(cache: CacheService, name: impl Into<String>) -> Self {
        Self {
            cache,
            name: name.into(),
            options: CacheOptions::default(),
            key: KeySource::Arguments,
            condition: None,
        }
    }

    fn applies(&self, args: &A) -> bool {
        self.condition.as_ref().is_none_or(|condition| condition(args))
    }

    fn key(&self, args: &A) -> String {
        self.key.resolve(&self.name, args)
    }
}

macro_rules! policy_builders {
    () => {
        pub fn ttl(mut self, ttl: Duration) -> Self {
            self.policy.options.ttl = Some(ttl);
            self
        }

        pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
            self.policy.options.prefix = Some(prefix.into());
            self
        }

        pub fn key(mut self, key: impl Into<String>) -> Self {
            self.policy.key = KeySource::Static(key.into());
            self
        }

        pub fn key_fn(mut self, f: impl Fn(&A) -> String + Send + Sync + 'static) -> Self {
            self.policy.key = KeySource::Derived(Arc::new(f));
            self
        }

        /// Skips the cache entirely when the predicate is false.
        pub fn condition(mut self, f: impl Fn(&A) -> bool + Send + Sync + 'static) -> Self {
            self.policy.condition = Some(Arc::new(f));
            self
        }
    };
}

// ============================================================================
// Cacheable
// ============================================================================

/// Returns the cached result when present; otherwise runs the operation
/// and stores its result.
pub struct Cacheable<A, T> {
    policy: Policy<A>,
    unless: Option<Predicate<T>>,
}

impl<A: Serialize + 'static, T> Cacheable<A, T> {
    pub fn new(cache: CacheService, name: impl Into<String>) -> Self {
        Self {
            policy: Policy::new(cache, name),
            unless: None,
        }
    }

    policy_builders!();

    /// Results for which the predicate holds are returned but not stored.
    pub fn unless(mut self, f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.unless = Some(Arc::new(f));
        self
    }

    pub fn wrap<F>(self, op: F) -> Memoized<A, T, F> {
        Memoized { policy: self, op }
    }
}

pub struct Memoized<A, T, F> {
    policy: Cacheable<A, T>,
    op: F,
}

impl<A, T, E, F, Fut> Memoized<A, T, F>
where
    A: Serialize,
    T: Serialize + DeserializeOwned,
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    pub async fn call(&self, args: A) -> Result<T, E> {
        let policy = &self.policy.policy;
        if !policy.applies(&args) {
            return (self.op)(args).await;
        }

        let key = policy.key(&args);
        if let Some(hit) = policy.cache.get::<T>(&key, &policy.options).await {
            debug!(target: SOURCE, name = %policy.name, key = %key, outcome = "hit");
            return Ok(hit);
        }

        let value = (self.op)(args).await?;
        let skip = self.policy.unless.as_ref().is_some_and(|unless| unless(&value));
        if !skip {
            policy.cache.set(&key, &value, &policy.options).await;
        }
        debug!(target: SOURCE, name = %policy.name, key = %key, outcome = "miss", stored = !skip);
        Ok(value)
    }
}

// ============================================================================
// CacheEvict
// ============================================================================

/// Runs the operation and then removes one entry, or every entry under the
/// wrapper's prefix.
pub struct CacheEvict<A> {
    policy: Policy<A>,
    all_entries: bool,
    before_invocation: bool,
}

impl<A: Serialize + 'static> CacheEvict<A> {
    pub fn new(cache: CacheService, name: impl Into<String>) -> Self {
        Self {
            policy: Policy::new(cache, name),
            all_entries: false,
            before_invocation: false,
        }
    }

    policy_builders!();

    pub fn all_entries(mut self, all: bool) -> Self {
        self.all_entries = all;
        self
    }

    /// Evicts before the operation runs, regardless of its outcome.
    pub fn before_invocation(mut self, before: bool) -> Self {
        self.before_invocation = before;
        self
    }

    pub fn wrap<F>(self, op: F) -> Evicting<A, F> {
        Evicting { policy: self, op }
    }

    async fn evict(&self, key: Option<&str>) {
        let policy = &self.policy;
        if self.all_entries {
            let scope = policy.options.prefix.as_deref().unwrap_or(&policy.name);
            let removed = policy.cache.delete_pattern(&format!("{scope}:*")).await;
            debug!(target: SOURCE, name = %policy.name, scope, removed, "evicted all entries");
        } else if let Some(key) = key {
            policy.cache.delete(key, &policy.options).await;
            debug!(target: SOURCE, name = %policy.name, key, "evicted entry");
        }
    }
}

pub struct Evicting<A, F> {
    policy: CacheEvict<A>,
    op: F,
}

impl<A, T, E, F, Fut> Evicting<A, F>
where
    A: Serialize + 'static,
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    pub async fn call(&self, args: A) -> Result<T, E> {
        let evict = self.policy.policy.applies(&args);
        let key = (evict && !self.policy.all_entries).then(|| self.policy.policy.key(&args));

        if evict && self.policy.before_invocation {
            self.policy.evict(key.as_deref()).await;
            return (self.op)(args).await;
        }

        let value = (self.op)(args).await?;
        if evict {
            self.policy.evict(key.as_deref()).await;
        }
        Ok(value)
    }
}

// ============================================================================
// CachePut
// ============================================================================

/// Always runs the operation and refreshes the cache with its result.
pub struct CachePut<A, T> {
    policy: Policy<A>,
    unless: Option<Predicate<T>>,
}

impl<A: Serialize + 'static, T> CachePut<A, T> {
    pub fn new(cache: CacheService, name: impl Into<String>) -> Self {
        Self {
            policy: Policy::new(cache, name),
            unless: None,
        }
    }

    policy_builders!();

    pub fn unless(mut self, f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.unless = Some(Arc::new(f));
        self
    }

    pub fn wrap<F>(self, op: F) -> Refreshing<A, T, F> {
        Refreshing { policy: self, op }
    }
}

pub struct Refreshing<A, T, F> {
    policy: CachePut<A, T>,
    op: F,
}

impl<A, T, E, F, Fut> Refreshing<A, T, F>
where
    A: Serialize,
    T: Serialize,
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    pub async fn call(&self, args: A) -> Result<T, E> {
        let policy = &self.policy.policy;
        let key = policy.applies(&args).then(|| policy.key(&args));

        let value = (self.op)(args).await?;
        if let Some(key) = key {
            let skip = self.policy.unless.as_ref().is_some_and(|unless| unless(&value));
            if !skip {
                policy.cache.set(&key, &value, &policy.options).await;
            }
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::cache_with_clock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[tokio::test]
    async fn cacheable_runs_body_once_per_argument_set() {
        let (cache, _, _) = cache_with_clock("app");
        let runs = counter();
        let seen = runs.clone();
        let price = Cacheable::<u64, u64>::new(cache, "price")
            .ttl(Duration::from_secs(60))
            .wrap(move |id: u64| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(id * 100)
                }
            });

        assert_eq!(price.call(1).await, Ok(100));
        assert_eq!(price.call(1).await, Ok(100));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        assert_eq!(price.call(2).await, Ok(200));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cacheable_falls_through_when_store_is_down() {
        let (cache, memory, _) = cache_with_clock("app");
        memory.set_available(false);
        let runs = counter();
        let seen = runs.clone();
        let op = Cacheable::<u8, u8>::new(cache, "op").wrap(move |n: u8| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ()>(n)
            }
        });

        assert_eq!(op.call(3).await, Ok(3));
        assert_eq!(op.call(3).await, Ok(3));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn condition_and_unless_control_storage() {
        let (cache, _, _) = cache_with_clock("app");
        let runs = counter();
        let seen = runs.clone();
        let op = Cacheable::<i32, Option<i32>>::new(cache, "lookup")
            .condition(|n| *n >= 0)
            .unless(|result| result.is_none())
            .wrap(move |n: i32| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>((n != 7).then_some(n))
                }
            });

        // Negative arguments bypass the cache.
        op.call(-1).await.unwrap();
        op.call(-1).await.unwrap();
        // `None` results are never stored.
        op.call(7).await.unwrap();
        op.call(7).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn errors_are_returned_and_not_cached() {
        let (cache, _, _) = cache_with_clock("app");
        let runs = counter();
        let seen = runs.clone();
        let op = Cacheable::<u8, u8>::new(cache, "flaky").wrap(move |_: u8| {
            let seen = seen.clone();
            async move {
                let attempt = seen.fetch_add(1, Ordering::SeqCst);
                if attempt == 0 { Err("boom") } else { Ok(1) }
            }
        });

        assert_eq!(op.call(0).await, Err("boom"));
        assert_eq!(op.call(0).await, Ok(1));
        assert_eq!(op.call(0).await, Ok(1));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn evict_removes_derived_key_after_success() {
        let (cache, _, _) = cache_with_clock("app");
        let options = CacheOptions::new();
        cache.set("product:1", &"cached", &options).await;
        cache.set("product:2", &"cached", &options).await;

        let update = CacheEvict::<u64>::new(cache.clone(), "product")
            .key_fn(|id| format!("product:{id}"))
            .wrap(|id: u64| async move { if id == 2 { Err("rejected") } else { Ok(id) } });

        assert_eq!(update.call(1).await, Ok(1));
        assert!(!cache.exists("product:1", &options).await);

        assert_eq!(update.call(2).await, Err("rejected"));
        assert!(cache.exists("product:2", &options).await);
    }

    #[tokio::test]
    async fn evict_all_entries_clears_prefix() {
        let (cache, _, _) = cache_with_clock("app");
        let scoped = CacheOptions::new().with_prefix("catalog");
        cache.set("a", &1, &scoped).await;
        cache.set("b", &2, &scoped).await;
        cache.set("keep", &3, &CacheOptions::new()).await;

        let reset = CacheEvict::<()>::new(cache.clone(), "catalog")
            .prefix("catalog")
            .all_entries(true)
            .wrap(|_: ()| async { Ok::<_, ()>(()) });
        reset.call(()).await.unwrap();

        assert!(!cache.exists("a", &scoped).await);
        assert!(!cache.exists("b", &scoped).await);
        assert!(cache.exists("keep", &CacheOptions::new()).await);
    }

    #[tokio::test]
    async fn evict_before_invocation_runs_even_on_failure() {
        let (cache, _, _) = cache_with_clock("app");
        cache.set("k", &1, &CacheOptions::new()).await;

        let op = CacheEvict::<()>::new(cache.clone(), "k")
            .key("k")
            .before_invocation(true)
            .wrap(|_: ()| async { Err::<(), _>("failed") });

        assert_eq!(op.call(()).await, Err("failed"));
        assert!(!cache.exists("k", &CacheOptions::new()).await);
    }

    #[tokio::test]
    async fn put_refreshes_and_warms_cacheable() {
        let (cache, _, _) = cache_with_clock("app");
        let save = CachePut::<(u64, String), String>::new(cache.clone(), "outlet")
            .key_fn(|(id, _)| format!("outlet:{id}"))
            .wrap(|(_, name): (u64, String)| async move { Ok::<_, ()>(name) });

        save.call((5, "Harbor".into())).await.unwrap();
        save.call((5, "Harbor Road".into())).await.unwrap();

        let read = Cacheable::<u64, String>::new(cache, "outlet")
            .key_fn(|id| format!("outlet:{id}"))
            .wrap(|_: u64| async { Err::<String, _>("must be served from cache") });
        assert_eq!(read.call(5).await, Ok("Harbor Road".to_string()));
    }
}
