use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

pub const CACHE_HIT_TOTAL: &str = "cylinder_cache_hit_total";
pub const CACHE_MISS_TOTAL: &str = "cylinder_cache_miss_total";
pub const CACHE_ERROR_TOTAL: &str = "cylinder_cache_error_total";
pub const CACHE_INVALIDATED_TOTAL: &str = "cylinder_cache_invalidated_total";
pub const RATELIMIT_REJECTED_TOTAL: &str = "cylinder_ratelimit_rejected_total";
pub const RATELIMIT_FAIL_OPEN_TOTAL: &str = "cylinder_ratelimit_fail_open_total";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            CACHE_HIT_TOTAL,
            Unit::Count,
            "Total number of cache reads that found a decodable value."
        );
        describe_counter!(
            CACHE_MISS_TOTAL,
            Unit::Count,
            "Total number of cache reads that returned nothing."
        );
        describe_counter!(
            CACHE_ERROR_TOTAL,
            Unit::Count,
            "Total number of failed cache operations, labelled by op."
        );
        describe_counter!(
            CACHE_INVALIDATED_TOTAL,
            Unit::Count,
            "Total number of cache entries removed by invalidation."
        );
        describe_counter!(
            RATELIMIT_REJECTED_TOTAL,
            Unit::Count,
            "Total number of requests rejected, labelled by limiter."
        );
        describe_counter!(
            RATELIMIT_FAIL_OPEN_TOTAL,
            Unit::Count,
            "Total number of requests admitted because the store was unreachable."
        );
    });
}
