//! Connection lifecycle for the shared store.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::lock::{lock, read, write};
use super::{KvStore, MemoryStore, StoreError};

/// Produces a ready-to-use store handle.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn KvStore>, StoreError>;

    /// Human-readable target, safe to log.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(2),
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(3),
        }
    }
}

impl ClientSettings {
    /// Delay before retry `attempt` (zero-based): doubles each time, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Degraded,
    Disconnected,
}

/// Shared handle to the backing store.
///
/// While degraded every operation fails fast with [`StoreError::Unavailable`];
/// callers treat that like any other store failure (miss / fail open).
pub struct StoreClient {
    connector: Arc<dyn Connector>,
    settings: ClientSettings,
    backend: RwLock<Option<Arc<dyn KvStore>>>,
    degraded: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("target", &self.connector.describe())
            .field("status", &self.status())
            .finish()
    }
}

impl StoreClient {
    pub fn new(connector: Arc<dyn Connector>, settings: ClientSettings) -> Self {
        Self {
            connector,
            settings,
            backend: RwLock::new(None),
            degraded: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        }
    }

    /// A client already attached to `store`. Used by tests and the
    /// in-process mode where there is nothing to dial.
    pub fn attached(
        connector: Arc<dyn Connector>,
        store: Arc<dyn KvStore>,
        settings: ClientSettings,
    ) -> Self {
        let client = Self::new(connector, settings);
        *write(&client.backend, "attach") = Some(store);
        client
    }

    /// Client over an in-process store; reconnects re-attach the same keyspace.
    pub fn in_memory(store: MemoryStore, settings: ClientSettings) -> Self {
        Self::attached(Arc::new(store.clone()), Arc::new(store), settings)
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Connects with bounded retries and exponential backoff.
    pub async fn connect(&self) -> Result<(), StoreError> {
        let target_store = self.connector.describe();
        let mut attempt = 0u32;

        loop {
            let outcome =
                match tokio::time::timeout(self.settings.connect_timeout, self.connector.connect())
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Timeout {
                        op: "connect",
                        timeout_ms: self.settings.connect_timeout.as_millis() as u64,
                    }),
                };

            match outcome {
                Ok(store) => {
                    *write(&self.backend, "connect") = Some(store);
                    self.degraded.store(false, Ordering::SeqCst);
                    info!(
                        target: "cylinder_cache::store",
                        target_store = %target_store,
                        attempt,
                        "store connected"
                    );
                    return Ok(());
                }
                Err(err) if attempt < self.settings.max_retries => {
                    let delay = self.settings.backoff_delay(attempt);
                    warn!(
                        target: "cylinder_cache::store",
                        target_store = %target_store,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "store connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        target: "cylinder_cache::store",
                        target_store = %target_store,
                        attempts = attempt + 1,
                        error = %err,
                        "giving up on store connection"
                    );
                    self.degraded.store(true, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
    }

    /// One reconnection attempt; clears degraded mode on success.
    pub async fn reconnect(&self) -> Result<(), StoreError> {
        let store =
            match tokio::time::timeout(self.settings.connect_timeout, self.connector.connect())
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(StoreError::Timeout {
                        op: "reconnect",
                        timeout_ms: self.settings.connect_timeout.as_millis() as u64,
                    });
                }
            };
        *write(&self.backend, "reconnect") = Some(store);
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!(
                target: "cylinder_cache::store",
                target_store = %self.connector.describe(),
                "store recovered, leaving degraded mode"
            );
        }
        Ok(())
    }

    /// Starts a background task that retries the connection every
    /// `interval` while the client is degraded.
    pub fn spawn_reconnect_loop(self: &Arc<Self>, interval: Duration) {
        let client = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(client) = client.upgrade() else {
                    break;
                };
                if client.status() == ConnectionStatus::Connected {
                    continue;
                }
                if let Err(err) = client.reconnect().await {
                    debug!(
                        target: "cylinder_cache::store",
                        error = %err,
                        "store still unreachable"
                    );
                }
            }
        });

        if let Some(previous) = lock(&self.supervisor, "spawn_reconnect_loop").replace(handle) {
            previous.abort();
        }
    }

    /// Stops the supervisor and drops the backend handle.
    pub fn shutdown(&self) {
        if let Some(handle) = lock(&self.supervisor, "shutdown").take() {
            handle.abort();
        }
        write(&self.backend, "shutdown").take();
        info!(target: "cylinder_cache::store", "store client shut down");
    }

    pub fn status(&self) -> ConnectionStatus {
        if self.degraded.load(Ordering::SeqCst) {
            ConnectionStatus::Degraded
        } else if read(&self.backend, "status").is_some() {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }

    pub fn is_available(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Pings the store directly.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.execute("ping", |store| async move { store.ping().await })
            .await
    }

    /// Runs `f` against the current backend under the operation timeout.
    ///
    /// Connection failures flip the client into degraded mode; command
    /// errors and timeouts do not.
    pub async fn execute<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(Arc<dyn KvStore>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        if self.degraded.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        let store = read(&self.backend, op)
            .clone()
            .ok_or(StoreError::Unavailable)?;

        let result = match tokio::time::timeout(self.settings.operation_timeout, f(store)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                op,
                timeout_ms: self.settings.operation_timeout.as_millis() as u64,
            }),
        };

        if let Err(err) = &result {
            if err.is_connection() && !self.degraded.swap(true, Ordering::SeqCst) {
                warn!(
                    target: "cylinder_cache::store",
                    op,
                    error = %err,
                    "store connection lost, entering degraded mode"
                );
            }
        }
        result
    }
}

impl Drop for StoreClient {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.supervisor, "drop").take() {
            handle.abort();
        }
    }
}
