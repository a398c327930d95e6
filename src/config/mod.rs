//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{net::SocketAddr, num::NonZeroU32, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::store::ClientSettings;

pub use cli::{
    CliArgs, Command, InvalidateArgs, ServeArgs, ServeOverrides, StoreArgs, StoreOverride,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "cylinder";
const ENV_PREFIX: &str = "CYLINDER";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3100;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_STORE_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_STORE_POOL_SIZE: u32 = 16;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;
const DEFAULT_MAX_BACKOFF_MS: u64 = 3_000;
const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 10;
const DEFAULT_APP_PREFIX: &str = "cylinder";
const DEFAULT_CACHE_TTL_SECS: u64 = 3_600;
const DEFAULT_INDEX_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_HTTP_TTL_SECS: u64 = 300;
const DEFAULT_API_WINDOW_SECS: u64 = 15 * 60;
const DEFAULT_API_MAX_REQUESTS: u64 = 100;
const DEFAULT_AUTH_WINDOW_SECS: u64 = 15 * 60;
const DEFAULT_AUTH_MAX_REQUESTS: u64 = 5;
const DEFAULT_BUCKET_CAPACITY: f64 = 100.0;
const DEFAULT_BUCKET_REFILL_PER_SEC: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub cache: CacheSettings,
    pub rate_limit: RateLimitSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    /// In-process store; state is not shared between instances.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown backend `{other}`, expected redis|memory")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub url: String,
    pub namespace: String,
    pub pool_size: NonZeroU32,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub reconnect_interval: Duration,
}

impl StoreSettings {
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            connect_timeout: self.connect_timeout,
            operation_timeout: self.operation_timeout,
            max_retries: self.max_retries,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub app_prefix: String,
    /// `None` stores entries without expiry unless a call sets a TTL.
    pub default_ttl: Option<Duration>,
    pub index_ttl: Duration,
    pub http_ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAlgorithm {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
    Distributed,
}

impl FromStr for RateLimitAlgorithm {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fixed_window" => Ok(Self::FixedWindow),
            "sliding_window" => Ok(Self::SlidingWindow),
            "token_bucket" => Ok(Self::TokenBucket),
            "distributed" => Ok(Self::Distributed),
            other => Err(format!(
                "unknown algorithm `{other}`, expected fixed_window|sliding_window|token_bucket|distributed"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub max: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketPolicy {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    /// Algorithm behind the general API policy.
    pub algorithm: RateLimitAlgorithm,
    pub api: RateLimitPolicy,
    pub auth: RateLimitPolicy,
    pub token_bucket: TokenBucketPolicy,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Flush(args)) | Some(Command::Ping(args)) => {
            raw.apply_store_override(&args.store)
        }
        Some(Command::Invalidate(args)) => raw.apply_store_override(&args.store),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    store: RawStoreSettings,
    cache: RawCacheSettings,
    rate_limit: RawRateLimitSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_store_override(&overrides.store);

        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(size) = overrides.store_pool_size {
            self.store.pool_size = Some(size);
        }
        if let Some(ttl) = overrides.cache_default_ttl_seconds {
            self.cache.default_ttl_seconds = Some(ttl);
        }
        if let Some(ttl) = overrides.cache_http_ttl_seconds {
            self.cache.http_ttl_seconds = Some(ttl);
        }
        if let Some(algorithm) = overrides.rate_limit_algorithm.as_ref() {
            self.rate_limit.algorithm = Some(algorithm.clone());
        }
        if let Some(window) = overrides.api_rate_limit_window_seconds {
            self.rate_limit.api.window_seconds = Some(window);
        }
        if let Some(max) = overrides.api_rate_limit_max_requests {
            self.rate_limit.api.max_requests = Some(max);
        }
        if let Some(window) = overrides.auth_rate_limit_window_seconds {
            self.rate_limit.auth.window_seconds = Some(window);
        }
        if let Some(max) = overrides.auth_rate_limit_max_requests {
            self.rate_limit.auth.max_requests = Some(max);
        }
    }

    fn apply_store_override(&mut self, overrides: &StoreOverride) {
        if let Some(url) = overrides.store_url.as_ref() {
            self.store.url = Some(url.clone());
        }
        if let Some(backend) = overrides.store_backend.as_ref() {
            self.store.backend = Some(backend.clone());
        }
        if let Some(namespace) = overrides.store_namespace.as_ref() {
            self.store.namespace = Some(namespace.clone());
        }
        if let Some(prefix) = overrides.cache_app_prefix.as_ref() {
            self.cache.app_prefix = Some(prefix.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            store,
            cache,
            rate_limit,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            store: build_store_settings(store)?,
            cache: build_cache_settings(cache)?,
            rate_limit: build_rate_limit_settings(rate_limit)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let backend = match store.backend {
        Some(value) => StoreBackend::from_str(&value)
            .map_err(|reason| LoadError::invalid("store.backend", reason))?,
        None => StoreBackend::Redis,
    };

    let url = store
        .url
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_STORE_URL.to_string());
    if backend == StoreBackend::Redis && url.is_empty() {
        return Err(LoadError::invalid(
            "store.url",
            "must not be empty for the redis backend",
        ));
    }

    let namespace = store.namespace.unwrap_or_default().trim().to_string();
    let pool_size = non_zero_u32(
        store.pool_size.unwrap_or(DEFAULT_STORE_POOL_SIZE).into(),
        "store.pool_size",
    )?;

    let connect_timeout = positive_millis(
        store.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
        "store.connect_timeout_ms",
    )?;
    let operation_timeout = positive_millis(
        store
            .operation_timeout_ms
            .unwrap_or(DEFAULT_OPERATION_TIMEOUT_MS),
        "store.operation_timeout_ms",
    )?;
    let initial_backoff = positive_millis(
        store.initial_backoff_ms.unwrap_or(DEFAULT_INITIAL_BACKOFF_MS),
        "store.initial_backoff_ms",
    )?;
    let max_backoff = positive_millis(
        store.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS),
        "store.max_backoff_ms",
    )?;
    if max_backoff < initial_backoff {
        return Err(LoadError::invalid(
            "store.max_backoff_ms",
            "must not be smaller than store.initial_backoff_ms",
        ));
    }

    let reconnect_secs = store
        .reconnect_interval_seconds
        .unwrap_or(DEFAULT_RECONNECT_INTERVAL_SECS);
    if reconnect_secs == 0 {
        return Err(LoadError::invalid(
            "store.reconnect_interval_seconds",
            "must be greater than zero",
        ));
    }

    Ok(StoreSettings {
        backend,
        url,
        namespace,
        pool_size,
        connect_timeout,
        operation_timeout,
        max_retries: store.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        initial_backoff,
        max_backoff,
        reconnect_interval: Duration::from_secs(reconnect_secs),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let app_prefix = cache
        .app_prefix
        .unwrap_or_else(|| DEFAULT_APP_PREFIX.to_string())
        .trim()
        .trim_end_matches(':')
        .to_string();
    if app_prefix.contains(['*', '?', '[']) {
        return Err(LoadError::invalid(
            "cache.app_prefix",
            "must not contain glob characters",
        ));
    }

    let default_ttl = match cache.default_ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS) {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    let index_secs = cache.index_ttl_seconds.unwrap_or(DEFAULT_INDEX_TTL_SECS);
    if index_secs == 0 {
        return Err(LoadError::invalid(
            "cache.index_ttl_seconds",
            "must be greater than zero",
        ));
    }

    let http_secs = cache.http_ttl_seconds.unwrap_or(DEFAULT_HTTP_TTL_SECS);
    if http_secs == 0 {
        return Err(LoadError::invalid(
            "cache.http_ttl_seconds",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        app_prefix,
        default_ttl,
        index_ttl: Duration::from_secs(index_secs),
        http_ttl: Duration::from_secs(http_secs),
    })
}

fn build_rate_limit_settings(
    rate_limit: RawRateLimitSettings,
) -> Result<RateLimitSettings, LoadError> {
    let algorithm = match rate_limit.algorithm {
        Some(value) => RateLimitAlgorithm::from_str(&value)
            .map_err(|reason| LoadError::invalid("rate_limit.algorithm", reason))?,
        None => RateLimitAlgorithm::FixedWindow,
    };

    let api = build_policy(
        rate_limit.api,
        DEFAULT_API_WINDOW_SECS,
        DEFAULT_API_MAX_REQUESTS,
        ("rate_limit.api.window_seconds", "rate_limit.api.max_requests"),
    )?;
    let auth = build_policy(
        rate_limit.auth,
        DEFAULT_AUTH_WINDOW_SECS,
        DEFAULT_AUTH_MAX_REQUESTS,
        ("rate_limit.auth.window_seconds", "rate_limit.auth.max_requests"),
    )?;

    let capacity = rate_limit
        .token_bucket
        .capacity
        .unwrap_or(DEFAULT_BUCKET_CAPACITY);
    if !capacity.is_finite() || capacity < 1.0 {
        return Err(LoadError::invalid(
            "rate_limit.token_bucket.capacity",
            "must be at least 1",
        ));
    }
    let refill_per_sec = rate_limit
        .token_bucket
        .refill_per_sec
        .unwrap_or(DEFAULT_BUCKET_REFILL_PER_SEC);
    if !refill_per_sec.is_finite() || refill_per_sec <= 0.0 {
        return Err(LoadError::invalid(
            "rate_limit.token_bucket.refill_per_sec",
            "must be greater than zero",
        ));
    }

    Ok(RateLimitSettings {
        algorithm,
        api,
        auth,
        token_bucket: TokenBucketPolicy {
            capacity,
            refill_per_sec,
        },
    })
}

fn build_policy(
    raw: RawPolicySettings,
    default_window: u64,
    default_max: u64,
    (window_key, max_key): (&'static str, &'static str),
) -> Result<RateLimitPolicy, LoadError> {
    let window = raw.window_seconds.unwrap_or(default_window);
    non_zero_u32(window, window_key)?;
    let max = raw.max_requests.unwrap_or(default_max);
    if max == 0 {
        return Err(LoadError::invalid(max_key, "must be greater than zero"));
    }
    Ok(RateLimitPolicy {
        window: Duration::from_secs(window),
        max,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    backend: Option<String>,
    url: Option<String>,
    namespace: Option<String>,
    pool_size: Option<u32>,
    connect_timeout_ms: Option<u64>,
    operation_timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    reconnect_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    app_prefix: Option<String>,
    default_ttl_seconds: Option<u64>,
    index_ttl_seconds: Option<u64>,
    http_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRateLimitSettings {
    algorithm: Option<String>,
    api: RawPolicySettings,
    auth: RawPolicySettings,
    token_bucket: RawTokenBucketSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPolicySettings {
    window_seconds: Option<u64>,
    max_requests: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTokenBucketSettings {
    capacity: Option<f64>,
    refill_per_sec: Option<f64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    candidate
        .parse()
        .map_err(|err| format!("failed to parse `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    let value = u32::try_from(value)
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range"))?;
    NonZeroU32::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_millis(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

#[cfg(test)]
mod tests;
