use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the cylinder-cache binary.
#[derive(Debug, Parser)]
#[command(
    name = "cylinder-cache",
    version,
    about = "Distributed cache and rate limiting service"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CYLINDER_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP admin surface and entry API.
    Serve(Box<ServeArgs>),
    /// Delete every key under the configured app prefix.
    Flush(StoreArgs),
    /// Delete keys matching a glob below the app prefix.
    Invalidate(InvalidateArgs),
    /// Check that the backing store answers.
    Ping(StoreArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct StoreOverride {
    /// Override the store connection URL.
    #[arg(long = "store-url", value_name = "URL")]
    pub store_url: Option<String>,

    /// Override the store backend (redis|memory).
    #[arg(long = "store-backend", value_name = "BACKEND")]
    pub store_backend: Option<String>,

    /// Override the store key namespace.
    #[arg(long = "store-namespace", value_name = "NAMESPACE")]
    pub store_namespace: Option<String>,

    /// Override the application key prefix.
    #[arg(long = "cache-app-prefix", value_name = "PREFIX")]
    pub cache_app_prefix: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StoreArgs {
    #[command(flatten)]
    pub store: StoreOverride,
}

#[derive(Debug, Args, Clone)]
pub struct InvalidateArgs {
    #[command(flatten)]
    pub store: StoreOverride,

    /// Treat the argument as a tag name instead of a glob.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub tag: bool,

    /// Glob such as `list:product:*`, relative to the app prefix.
    #[arg(value_name = "PATTERN")]
    pub pattern: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub store: StoreOverride,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the store pool size.
    #[arg(long = "store-pool-size", value_name = "COUNT")]
    pub store_pool_size: Option<u32>,

    /// Override the default entry TTL; 0 stores without expiry.
    #[arg(long = "cache-default-ttl-seconds", value_name = "SECONDS")]
    pub cache_default_ttl_seconds: Option<u64>,

    /// Override the response cache TTL.
    #[arg(long = "cache-http-ttl-seconds", value_name = "SECONDS")]
    pub cache_http_ttl_seconds: Option<u64>,

    /// Override the API limiter algorithm.
    #[arg(long = "rate-limit-algorithm", value_name = "ALGORITHM")]
    pub rate_limit_algorithm: Option<String>,

    /// Override the API rate limit window size.
    #[arg(long = "api-rate-limit-window-seconds", value_name = "SECONDS")]
    pub api_rate_limit_window_seconds: Option<u64>,

    /// Override the API rate limit request ceiling.
    #[arg(long = "api-rate-limit-max-requests", value_name = "COUNT")]
    pub api_rate_limit_max_requests: Option<u64>,

    /// Override the admin rate limit window size.
    #[arg(long = "auth-rate-limit-window-seconds", value_name = "SECONDS")]
    pub auth_rate_limit_window_seconds: Option<u64>,

    /// Override the admin rate limit request ceiling.
    #[arg(long = "auth-rate-limit-max-requests", value_name = "COUNT")]
    pub auth_rate_limit_max_requests: Option<u64>,
}
