use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::Value;

use crate::cache::CacheOptions;

use super::AppState;
use super::error::ApiError;

#[derive(Debug, Default, Deserialize)]
pub(super) struct WriteParams {
    /// Seconds; `0` stores without expiry, absent uses the service default.
    ttl: Option<u64>,
}

pub(super) async fn read_entry(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .cache
        .get::<Value>(&key, &CacheOptions::new())
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("No entry for `{key}`")))
}

pub(super) async fn write_entry(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<WriteParams>,
    Json(value): Json<Value>,
) -> Response {
    let options = match params.ttl {
        Some(secs) => CacheOptions::new().with_ttl(Duration::from_secs(secs)),
        None => CacheOptions::new(),
    };
    if state.cache.set(&key, &value, &options).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        ApiError::store_unavailable().into_response()
    }
}

pub(super) async fn delete_entry(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Response {
    if state.cache.delete(&key, &CacheOptions::new()).await {
        StatusCode::NO_CONTENT.into_response()
    } else if state.cache.is_available() {
        ApiError::not_found(format!("No entry for `{key}`")).into_response()
    } else {
        ApiError::store_unavailable().into_response()
    }
}
