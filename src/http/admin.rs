use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::store::ConnectionStatus;

use super::AppState;
use super::error::{ApiError, ErrorReport};

const SOURCE: &str = "cylinder_cache::http::admin";

#[derive(Debug, Serialize)]
pub(super) struct HealthBody {
    status: ConnectionStatus,
    app_prefix: String,
}

pub(super) async fn health(State(state): State<AppState>) -> Response {
    let status = state.cache.status();
    let body = HealthBody {
        status,
        app_prefix: state.cache.app_prefix().to_string(),
    };
    if status == ConnectionStatus::Connected {
        return (StatusCode::OK, Json(body)).into_response();
    }

    let mut response = (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    ErrorReport::from_message(
        "http::admin::health",
        StatusCode::SERVICE_UNAVAILABLE,
        format!("store status: {status:?}"),
    )
    .attach(&mut response);
    response
}

pub(super) async fn flush_cache(State(state): State<AppState>) -> Response {
    if state.cache.flush().await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        ApiError::store_unavailable().into_response()
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct InvalidateRequest {
    pattern: Option<String>,
    tag: Option<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct InvalidateResponse {
    removed: u64,
}

pub(super) async fn invalidate_cache(
    State(state): State<AppState>,
    Json(request): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>, ApiError> {
    let removed = match (request.pattern, request.tag) {
        (Some(pattern), None) if !pattern.trim().is_empty() => {
            state.invalidator.invalidate_patterns(&[pattern.trim()]).await
        }
        (None, Some(tag)) if !tag.trim().is_empty() => {
            state.invalidator.invalidate_tag(tag.trim()).await
        }
        _ => {
            return Err(ApiError::bad_request(
                "Provide exactly one of `pattern` or `tag`",
                None,
            ));
        }
    };
    info!(target: SOURCE, removed, "admin invalidation");
    Ok(Json(InvalidateResponse { removed }))
}
