use std::{future::IntoFuture, net::SocketAddr, process, sync::Arc, time::Duration};

use cylinder_cache::{
    cache::{CacheService, Invalidator},
    config::{self, Command, InvalidateArgs, StoreBackend},
    error::AppError,
    http::{self, AppState, ResponseCacheLayer, RouterLayers},
    infra::{error::InfraError, telemetry},
    ratelimit::{self, RateLimitLayer},
    store::{Clock, Connector, MemoryStore, RedisConnector, StoreClient, SystemClock},
};
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const SOURCE: &str = "cylinder_cache::main";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        Command::Serve(_) => run_serve(settings).await,
        Command::Flush(_) => run_flush(settings).await,
        Command::Invalidate(args) => run_invalidate(settings, args).await,
        Command::Ping(_) => run_ping(settings).await,
    }
}

fn build_client(settings: &config::Settings) -> StoreClient {
    let client_settings = settings.store.client_settings();
    match settings.store.backend {
        StoreBackend::Memory => StoreClient::in_memory(MemoryStore::new(), client_settings),
        StoreBackend::Redis => {
            let connector: Arc<dyn Connector> = Arc::new(RedisConnector {
                url: settings.store.url.clone(),
                namespace: settings.store.namespace.clone(),
                pool_size: settings.store.pool_size.get() as usize,
                timeout: settings.store.connect_timeout,
            });
            StoreClient::new(connector, client_settings)
        }
    }
}

fn build_cache(settings: &config::Settings, client: Arc<StoreClient>) -> CacheService {
    CacheService::new(client, settings.cache.app_prefix.clone())
        .with_default_ttl(settings.cache.default_ttl)
}

/// Connects for a one-shot command; unlike `serve`, an unreachable store is fatal.
async fn connect_strict(settings: &config::Settings) -> Result<Arc<StoreClient>, AppError> {
    let client = Arc::new(build_client(settings));
    client.connect().await?;
    if !client.is_available() {
        return Err(AppError::from(InfraError::configuration(
            "backing store is unreachable",
        )));
    }
    Ok(client)
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let client = Arc::new(build_client(&settings));
    if let Err(err) = client.connect().await {
        warn!(target: SOURCE, error = %err, "starting in degraded mode");
    }
    client.spawn_reconnect_loop(settings.store.reconnect_interval);

    let cache = build_cache(&settings, client.clone());
    let invalidator = Invalidator::new(cache.clone()).with_index_ttl(settings.cache.index_ttl);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let api_limiter = ratelimit::api_limiter(cache.clone(), clock.clone(), &settings.rate_limit);
    let auth_limiter = ratelimit::auth_limiter(cache.clone(), clock, &settings.rate_limit);

    let layers = RouterLayers {
        api_limit: RateLimitLayer::new(api_limiter),
        admin_limit: RateLimitLayer::new(Arc::new(auth_limiter))
            .message("Too many administrative requests, please try again later.")
            .skip_successful_requests(true),
        response_cache: ResponseCacheLayer::new(cache.clone())
            .ttl(settings.cache.http_ttl)
            .exclude_paths(["/admin", "/health"]),
    };
    let router = http::build_router(AppState::new(cache, invalidator), layers);

    let listener = tokio::net::TcpListener::bind(settings.server.addr).await?;
    info!(
        target: SOURCE,
        addr = %settings.server.addr,
        algorithm = ?settings.rate_limit.algorithm,
        "listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let result = tokio::select! {
        result = server.into_future() => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))
        }
        _ = drain_deadline(shutdown_rx, settings.server.graceful_shutdown) => {
            warn!(target: SOURCE, "graceful shutdown timed out, dropping open connections");
            Ok(())
        }
    };

    client.shutdown();
    result
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!(target: SOURCE, "shutdown signal received");
}

/// Resolves `grace` after shutdown has been requested.
async fn drain_deadline(mut shutdown: watch::Receiver<bool>, grace: Duration) {
    if shutdown.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(grace).await;
}

async fn run_flush(settings: config::Settings) -> Result<(), AppError> {
    let client = connect_strict(&settings).await?;
    let cache = build_cache(&settings, client.clone());
    let flushed = cache.flush().await;
    client.shutdown();
    if !flushed {
        return Err(AppError::unexpected("flush did not complete"));
    }
    info!(target: SOURCE, app_prefix = %settings.cache.app_prefix, "flushed");
    Ok(())
}

async fn run_invalidate(settings: config::Settings, args: InvalidateArgs) -> Result<(), AppError> {
    let pattern = args.pattern.trim();
    if pattern.is_empty() {
        return Err(AppError::validation("pattern must not be empty"));
    }

    let client = connect_strict(&settings).await?;
    let invalidator = Invalidator::new(build_cache(&settings, client.clone()))
        .with_index_ttl(settings.cache.index_ttl);
    let removed = if args.tag {
        invalidator.invalidate_tag(pattern).await
    } else {
        invalidator.invalidate_patterns(&[pattern]).await
    };
    client.shutdown();

    info!(target: SOURCE, pattern, tag = args.tag, removed, "invalidated");
    println!("{removed}");
    Ok(())
}

async fn run_ping(settings: config::Settings) -> Result<(), AppError> {
    let client = connect_strict(&settings).await?;
    let started = std::time::Instant::now();
    client.ping().await?;
    let elapsed_ms = started.elapsed().as_millis();
    client.shutdown();

    info!(target: SOURCE, elapsed_ms, "store reachable");
    println!("PONG ({elapsed_ms} ms)");
    Ok(())
}
