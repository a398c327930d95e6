mod admin;
mod cache_layer;
mod entries;
pub mod error;
mod invalidate_layer;
mod middleware;

pub use cache_layer::{
    BufferError, DEFAULT_MAX_BODY_BYTES, ResponseCacheLayer, StoredResponse, buffer_response,
    cache_responses, default_key, should_store_response,
};
pub use error::{ApiError, ErrorReport};
pub use invalidate_layer::{InvalidateLayer, invalidate_on_write};
pub use middleware::{RequestContext, log_responses, set_request_context};

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use crate::cache::{CacheService, Invalidator};
use crate::ratelimit::{RateLimitLayer, rate_limit};

#[derive(Clone, Debug)]
pub struct AppState {
    pub cache: CacheService,
    pub invalidator: Invalidator,
}

impl AppState {
    pub fn new(cache: CacheService, invalidator: Invalidator) -> Self {
        Self { cache, invalidator }
    }
}

/// Middleware configuration for [`build_router`].
#[derive(Clone, Debug)]
pub struct RouterLayers {
    pub api_limit: RateLimitLayer,
    pub admin_limit: RateLimitLayer,
    pub response_cache: ResponseCacheLayer,
}

/// `/health`, the admin cache endpoints and the entry API.
///
/// Entry reads go through the response cache; successful entry writes clear
/// the cached reads of the same path.
pub fn build_router(state: AppState, layers: RouterLayers) -> Router {
    let response_cache = layers.response_cache.clone();
    let invalidate = InvalidateLayer::new(state.invalidator.clone())
        .derive(move |request| vec![response_cache.invalidation_pattern(request.uri().path())]);

    let entries = Router::new()
        .route(
            "/api/entries/{key}",
            get(entries::read_entry)
                .put(entries::write_entry)
                .delete(entries::delete_entry),
        )
        .layer(axum_middleware::from_fn_with_state(
            invalidate,
            invalidate_on_write,
        ))
        .layer(axum_middleware::from_fn_with_state(
            layers.response_cache,
            cache_responses,
        ))
        .layer(axum_middleware::from_fn_with_state(
            layers.api_limit,
            rate_limit,
        ));

    let admin = Router::new()
        .route("/admin/cache/flush", post(admin::flush_cache))
        .route("/admin/cache/invalidate", post(admin::invalidate_cache))
        .layer(axum_middleware::from_fn_with_state(
            layers.admin_limit,
            rate_limit,
        ));

    Router::new()
        .route("/health", get(admin::health))
        .merge(entries)
        .merge(admin)
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
