use std::io::Write;

use clap::Parser;
use serial_test::serial;

use super::*;

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
    assert_eq!(settings.store.backend, StoreBackend::Redis);
    assert_eq!(settings.cache.app_prefix, DEFAULT_APP_PREFIX);
    assert_eq!(
        settings.cache.default_ttl,
        Some(Duration::from_secs(DEFAULT_CACHE_TTL_SECS))
    );
    assert_eq!(settings.rate_limit.algorithm, RateLimitAlgorithm::FixedWindow);
    assert!(settings.rate_limit.auth.max < settings.rate_limit.api.max);
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());
    raw.store.backend = Some("redis".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        store: StoreOverride {
            store_backend: Some("memory".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.store.backend, StoreBackend::Memory);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn zero_default_ttl_means_no_expiry() {
    let mut raw = RawSettings::default();
    raw.cache.default_ttl_seconds = Some(0);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.default_ttl, None);
}

#[test]
fn invalid_values_name_their_key() {
    let mut raw = RawSettings::default();
    raw.store.backend = Some("memcached".to_string());
    match Settings::from_raw(raw) {
        Err(LoadError::Invalid { key, .. }) => assert_eq!(key, "store.backend"),
        other => panic!("expected invalid backend, got {other:?}"),
    }

    let mut raw = RawSettings::default();
    raw.store.initial_backoff_ms = Some(500);
    raw.store.max_backoff_ms = Some(100);
    match Settings::from_raw(raw) {
        Err(LoadError::Invalid { key, .. }) => assert_eq!(key, "store.max_backoff_ms"),
        other => panic!("expected invalid backoff, got {other:?}"),
    }

    let mut raw = RawSettings::default();
    raw.rate_limit.auth.max_requests = Some(0);
    match Settings::from_raw(raw) {
        Err(LoadError::Invalid { key, .. }) => assert_eq!(key, "rate_limit.auth.max_requests"),
        other => panic!("expected invalid max, got {other:?}"),
    }

    let mut raw = RawSettings::default();
    raw.cache.app_prefix = Some("app*".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn algorithm_names_accept_dashes() {
    assert_eq!(
        RateLimitAlgorithm::from_str("Sliding-Window"),
        Ok(RateLimitAlgorithm::SlidingWindow)
    );
    assert!(RateLimitAlgorithm::from_str("leaky_bucket").is_err());
}

#[test]
fn client_settings_follow_store_settings() {
    let mut raw = RawSettings::default();
    raw.store.max_retries = Some(2);
    raw.store.operation_timeout_ms = Some(250);
    let settings = Settings::from_raw(raw).expect("valid settings");

    let client = settings.store.client_settings();
    assert_eq!(client.max_retries, 2);
    assert_eq!(client.operation_timeout, Duration::from_millis(250));
}

#[test]
#[serial]
fn config_file_is_layered_under_cli() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp file");
    writeln!(
        file,
        "[cache]\napp_prefix = \"from-file\"\n\n[rate_limit.api]\nmax_requests = 42\n\n[server]\nport = 3900"
    )
    .expect("write config");

    let path = file.path().to_string_lossy().to_string();
    let cli = CliArgs::parse_from([
        "cylinder-cache",
        "--config-file",
        path.as_str(),
        "serve",
        "--server-port",
        "3999",
    ]);
    let settings = load(&cli).expect("settings load");

    assert_eq!(settings.cache.app_prefix, "from-file");
    assert_eq!(settings.rate_limit.api.max, 42);
    assert_eq!(settings.server.addr.port(), 3999);
}

#[test]
#[serial]
fn environment_sits_between_file_and_cli() {
    // SAFETY: env-mutating tests in this module are serialized.
    unsafe {
        std::env::set_var("CYLINDER__CACHE__APP_PREFIX", "from-env");
        std::env::set_var("CYLINDER__STORE__BACKEND", "redis");
    }

    let cli = CliArgs::parse_from(["cylinder-cache", "ping", "--store-backend", "memory"]);
    let result = load(&cli);

    unsafe {
        std::env::remove_var("CYLINDER__CACHE__APP_PREFIX");
        std::env::remove_var("CYLINDER__STORE__BACKEND");
    }

    let settings = result.expect("settings load");
    assert_eq!(settings.cache.app_prefix, "from-env");
    assert_eq!(settings.store.backend, StoreBackend::Memory);
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["cylinder-cache"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_invalidate_arguments() {
    let args = CliArgs::parse_from([
        "cylinder-cache",
        "invalidate",
        "--store-url",
        "redis://cache:6379",
        "list:product:*",
    ]);

    match args.command.expect("invalidate command") {
        Command::Invalidate(invalidate) => {
            assert_eq!(invalidate.pattern, "list:product:*");
            assert!(!invalidate.tag);
            assert_eq!(
                invalidate.store.store_url.as_deref(),
                Some("redis://cache:6379")
            );
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_ping_arguments() {
    let args = CliArgs::parse_from(["cylinder-cache", "ping", "--store-backend", "memory"]);
    match args.command.expect("ping command") {
        Command::Ping(ping) => assert_eq!(ping.store.store_backend.as_deref(), Some("memory")),
        _ => panic!("wrong command parsed"),
    }
}
