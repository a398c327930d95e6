use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, header};
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use crate::http::error::ApiError;

use super::{RateLimitDecision, RateLimiter, SOURCE};

pub type KeyGenerator = Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>;
type RequestPredicate = Arc<dyn Fn(&Request<Body>) -> bool + Send + Sync>;
type RejectionHandler = Arc<dyn Fn(&RateLimitDecision) -> Response + Send + Sync>;
type LimitHook = Arc<dyn Fn(&Request<Body>) + Send + Sync>;

static LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// Configuration for [`rate_limit`], passed as middleware state.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<dyn RateLimiter>,
    message: String,
    key_generator: KeyGenerator,
    skip: Option<RequestPredicate>,
    skip_successful_requests: bool,
    skip_failed_requests: bool,
    handler: Option<RejectionHandler>,
    on_limit_reached: Option<LimitHook>,
}

impl std::fmt::Debug for RateLimitLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitLayer")
            .field("limiter", &self.limiter.name())
            .field("message", &self.message)
            .field("skip_successful_requests", &self.skip_successful_requests)
            .field("skip_failed_requests", &self.skip_failed_requests)
            .finish_non_exhaustive()
    }
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            limiter,
            message: DEFAULT_MESSAGE.to_string(),
            key_generator: Arc::new(client_ip),
            skip: None,
            skip_successful_requests: false,
            skip_failed_requests: false,
            handler: None,
            on_limit_reached: None,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn key_generator(
        mut self,
        f: impl Fn(&Request<Body>) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key_generator = Arc::new(f);
        self
    }

    /// Requests for which the predicate holds are not limited at all.
    pub fn skip(mut self, f: impl Fn(&Request<Body>) -> bool + Send + Sync + 'static) -> Self {
        self.skip = Some(Arc::new(f));
        self
    }

    /// Refunds requests that end with a status below 400.
    pub fn skip_successful_requests(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    /// Refunds requests that end with a status of 400 or above.
    pub fn skip_failed_requests(mut self, skip: bool) -> Self {
        self.skip_failed_requests = skip;
        self
    }

    /// Replaces the default 429 body.
    pub fn handler(
        mut self,
        f: impl Fn(&RateLimitDecision) -> Response + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Arc::new(f));
        self
    }

    pub fn on_limit_reached(mut self, f: impl Fn(&Request<Body>) + Send + Sync + 'static) -> Self {
        self.on_limit_reached = Some(Arc::new(f));
        self
    }
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the peer address.
pub fn client_ip(request: &Request<Body>) -> String {
    let headers = request.headers();
    forwarded_for(headers)
        .or_else(|| header_str(headers, "x-real-ip").map(str::to_string))
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-forwarded-for")?
        .split(',')
        .map(str::trim)
        .find(|hop| !hop.is_empty())
        .map(str::to_string)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn apply_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(LIMIT.clone(), HeaderValue::from(decision.limit));
    headers.insert(REMAINING.clone(), HeaderValue::from(decision.remaining));
    headers.insert(RESET.clone(), HeaderValue::from(decision.reset_after_secs()));
}

pub async fn rate_limit(
    State(layer): State<RateLimitLayer>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if layer.skip.as_ref().is_some_and(|skip| skip(&request)) {
        return next.run(request).await;
    }

    let identifier = (layer.key_generator)(&request);
    let decision = layer.limiter.check(&identifier).await;

    if !decision.allowed {
        debug!(
            target: SOURCE,
            limiter = layer.limiter.name(),
            identifier = %identifier,
            path = %request.uri().path(),
            "request rate limited"
        );
        if let Some(hook) = &layer.on_limit_reached {
            hook(&request);
        }
        let mut response = match &layer.handler {
            Some(handler) => handler(&decision),
            None => ApiError::rate_limited(decision.retry_after_secs(), &layer.message),
        };
        let headers = response.headers_mut();
        headers.insert(
            header::RETRY_AFTER,
            HeaderValue::from(decision.retry_after_secs()),
        );
        apply_headers(headers, &decision);
        return response;
    }

    let mut response = next.run(request).await;
    let status = response.status();
    let refund = (layer.skip_successful_requests && status.as_u16() < 400)
        || (layer.skip_failed_requests && status.as_u16() >= 400);
    if refund {
        layer.limiter.refund(&identifier).await;
    }

    apply_headers(response.headers_mut(), &decision);
    response
}
