//! In-process implementation of [`KvStore`].
//!
//! Used as the single-instance backend and as the test double. One mutex
//! guards the whole keyspace, which makes every primitive trivially atomic.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::client::Connector;
use super::clock::{Clock, SystemClock};
use super::glob::glob_match;
use super::lock::lock;
use super::{
    KeyTtl, KvStore, SlidingWindowOutcome, StoreError, TokenBucketOutcome, TokenBucketRequest,
    apply_token_bucket, saturating_millis,
};

const WRONG_TYPE: &str = "WRONGTYPE operation against a key holding the wrong kind of value";

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(BTreeSet<String>),
    /// Sorted by timestamp.
    Log(Vec<(u64, String)>),
    Bucket { tokens: f64, last_refill: u64 },
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<u64>,
}

impl Entry {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at.is_none_or(|at| at > now_ms)
    }
}

struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

/// Shared in-memory keyspace. Clones see the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                clock,
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulates the service going down (or coming back).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.now();
        lock(&self.inner.entries, "len")
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn now(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::connection("memory store marked unavailable"))
        }
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<u64> {
        ttl.filter(|ttl| !ttl.is_zero())
            .map(|ttl| self.now().saturating_add(saturating_millis(ttl)))
    }

    /// Runs `f` over the keyspace with expired entries already purged.
    fn with_entries<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut HashMap<String, Entry>, u64) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.check()?;
        let now = self.now();
        let mut entries = lock(&self.inner.entries, op);
        entries.retain(|_, entry| entry.is_live(now));
        f(&mut entries, now)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_entries("get", |entries, _| match entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(StoreError::command(WRONG_TYPE)),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = self.expiry(ttl);
        self.with_entries("set", |entries, _| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Text(value.to_string()),
                    expires_at,
                },
            );
            Ok(())
        })
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.with_entries("del", |entries, _| {
            Ok(keys
                .iter()
                .filter(|key| entries.remove(key.as_str()).is_some())
                .count() as u64)
        })
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.with_entries("scan", |entries, _| {
            let mut keys: Vec<String> = entries
                .keys()
                .filter(|key| glob_match(pattern, key))
                .cloned()
                .collect();
            keys.sort();
            Ok(keys)
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.with_entries("exists", |entries, _| Ok(entries.contains_key(key)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let expires_at = self.now().saturating_add(saturating_millis(ttl));
        self.with_entries("expire", |entries, _| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(expires_at);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        self.with_entries("ttl", |entries, now| {
            Ok(match entries.get(key) {
                None => KeyTtl::Missing,
                Some(Entry {
                    expires_at: None, ..
                }) => KeyTtl::Persistent,
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => KeyTtl::Expires(Duration::from_millis(at.saturating_sub(now))),
            })
        })
    }

    async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StoreError> {
        let expires_at = self.expiry(ttl);
        self.with_entries("incr_by", |entries, _| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Text("0".to_string()),
                expires_at: None,
            });
            let current = match &entry.value {
                Value::Text(text) => text
                    .parse::<i64>()
                    .map_err(|_| StoreError::command("value is not an integer"))?,
                _ => return Err(StoreError::command(WRONG_TYPE)),
            };
            let next = current
                .checked_add(delta)
                .ok_or_else(|| StoreError::command("increment would overflow"))?;
            entry.value = Value::Text(next.to_string());
            if next == delta && expires_at.is_some() {
                entry.expires_at = expires_at;
            }
            Ok(next)
        })
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        self.with_entries("mget", |entries, _| {
            Ok(keys
                .iter()
                .map(|key| match entries.get(key.as_str()) {
                    Some(Entry {
                        value: Value::Text(text),
                        ..
                    }) => Some(text.clone()),
                    _ => None,
                })
                .collect())
        })
    }

    async fn mset(
        &self,
        batch: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let expires_at = self.expiry(ttl);
        self.with_entries("mset", |entries, _| {
            for (key, value) in batch {
                entries.insert(
                    key.clone(),
                    Entry {
                        value: Value::Text(value.clone()),
                        expires_at,
                    },
                );
            }
            Ok(())
        })
    }

    async fn set_add(
        &self,
        key: &str,
        members: &[String],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let expires_at = self.expiry(ttl);
        self.with_entries("set_add", |entries, _| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Set(BTreeSet::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Set(set) => set.extend(members.iter().cloned()),
                _ => return Err(StoreError::command(WRONG_TYPE)),
            }
            if expires_at.is_some() {
                entry.expires_at = expires_at;
            }
            Ok(())
        })
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_entries("set_members", |entries, _| match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(StoreError::command(WRONG_TYPE)),
        })
    }

    async fn sliding_window_hit(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
        max: u64,
        member: &str,
    ) -> Result<SlidingWindowOutcome, StoreError> {
        let window_ms = saturating_millis(window);
        let expires_at = self.now().saturating_add(window_ms);
        self.with_entries("sliding_window_hit", |entries, _| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Log(Vec::new()),
                expires_at: None,
            });
            let log = match &mut entry.value {
                Value::Log(log) => log,
                _ => return Err(StoreError::command(WRONG_TYPE)),
            };

            let cutoff = now_ms.saturating_sub(window_ms);
            log.retain(|(at, _)| *at > cutoff);

            let allowed = (log.len() as u64) < max;
            if allowed {
                let position = log.partition_point(|(at, _)| *at <= now_ms);
                log.insert(position, (now_ms, member.to_string()));
                entry.expires_at = Some(expires_at);
            }

            Ok(SlidingWindowOutcome {
                allowed,
                count: log.len() as u64,
                oldest_ms: log.first().map(|(at, _)| *at),
            })
        })
    }

    async fn token_bucket_take(
        &self,
        key: &str,
        request: TokenBucketRequest,
    ) -> Result<TokenBucketOutcome, StoreError> {
        let expires_at = self.expiry(Some(request.ttl));
        self.with_entries("token_bucket_take", |entries, _| {
            let state = match entries.get(key) {
                None => None,
                Some(Entry {
                    value:
                        Value::Bucket {
                            tokens,
                            last_refill,
                        },
                    ..
                }) => Some((*tokens, *last_refill)),
                Some(_) => return Err(StoreError::command(WRONG_TYPE)),
            };

            let (outcome, (tokens, last_refill)) = apply_token_bucket(state, &request);
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Bucket {
                        tokens,
                        last_refill,
                    },
                    expires_at,
                },
            );
            Ok(outcome)
        })
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.with_entries("flush", |entries, _| {
            entries.clear();
            Ok(())
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

#[async_trait]
impl Connector for MemoryStore {
    async fn connect(&self) -> Result<Arc<dyn KvStore>, StoreError> {
        self.check()?;
        Ok(Arc::new(self.clone()))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
