//! Response caching middleware.
//!
//! GET responses are looked up by a request-derived key and, on a miss,
//! buffered and persisted when they are cacheable. HEAD requests share the
//! GET entry on lookup but never populate it.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{CacheOptions, CacheService, KeyPart, keys};

use super::error::ErrorReport;

const SOURCE: &str = "cylinder_cache::http::cache";

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_PREFIX: &str = "http";
/// Bodies larger than this are passed through without being stored.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

static X_CACHE: HeaderName = HeaderName::from_static("x-cache");
static X_CACHE_KEY: HeaderName = HeaderName::from_static("x-cache-key");

/// Headers replayed from a stored response. Everything else is dropped.
const STORED_HEADERS: [HeaderName; 4] = [
    header::CONTENT_TYPE,
    header::CONTENT_LANGUAGE,
    header::ETAG,
    header::LAST_MODIFIED,
];

type RequestKeyFn = Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>;
type RequestPredicate = Arc<dyn Fn(&Request<Body>) -> bool + Send + Sync>;

/// Configuration for [`cache_responses`], passed as middleware state.
#[derive(Clone)]
pub struct ResponseCacheLayer {
    cache: CacheService,
    ttl: Duration,
    prefix: String,
    key_generator: RequestKeyFn,
    condition: Option<RequestPredicate>,
    exclude_paths: Vec<String>,
    include_paths: Vec<String>,
    vary_by: Vec<HeaderName>,
    cache_private: bool,
    cache_control: Option<String>,
    max_body_bytes: usize,
}

impl std::fmt::Debug for ResponseCacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCacheLayer")
            .field("ttl", &self.ttl)
            .field("prefix", &self.prefix)
            .field("exclude_paths", &self.exclude_paths)
            .field("include_paths", &self.include_paths)
            .field("vary_by", &self.vary_by)
            .field("cache_private", &self.cache_private)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish_non_exhaustive()
    }
}

impl ResponseCacheLayer {
    pub fn new(cache: CacheService) -> Self {
        Self {
            cache,
            ttl: DEFAULT_TTL,
            prefix: DEFAULT_PREFIX.to_string(),
            key_generator: Arc::new(default_key),
            condition: None,
            exclude_paths: Vec::new(),
            include_paths: Vec::new(),
            vary_by: Vec::new(),
            cache_private: false,
            cache_control: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl.max(Duration::from_secs(1));
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn key_generator(
        mut self,
        f: impl Fn(&Request<Body>) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key_generator = Arc::new(f);
        self
    }

    /// Only requests for which the predicate holds are cached.
    pub fn condition(mut self, f: impl Fn(&Request<Body>) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Arc::new(f));
        self
    }

    /// Path prefixes that are never cached.
    pub fn exclude_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// When non-empty, only these path prefixes are cached.
    pub fn include_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn vary_by<I>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = HeaderName>,
    {
        self.vary_by = headers.into_iter().collect();
        self
    }

    /// Ignore client `Cache-Control: no-cache` and mark responses private.
    pub fn cache_private(mut self, private: bool) -> Self {
        self.cache_private = private;
        self
    }

    pub fn cache_control(mut self, value: impl Into<String>) -> Self {
        self.cache_control = Some(value.into());
        self
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Glob, relative to the app prefix, covering every stored variant of
    /// `path` under the default key generator.
    pub fn invalidation_pattern(&self, path: &str) -> String {
        let pattern = keys::endpoint_pattern(Method::GET.as_str(), path);
        if self.prefix.is_empty() {
            pattern
        } else {
            format!("{}:{pattern}", self.prefix)
        }
    }

    fn bypass(&self, request: &Request<Body>) -> bool {
        if request.method() != Method::GET && request.method() != Method::HEAD {
            return true;
        }
        let path = request.uri().path();
        if self.exclude_paths.iter().any(|p| path.starts_with(p.as_str())) {
            return true;
        }
        if !self.include_paths.is_empty()
            && !self.include_paths.iter().any(|p| path.starts_with(p.as_str()))
        {
            return true;
        }
        if self.condition.as_ref().is_some_and(|condition| !condition(request)) {
            return true;
        }
        !self.cache_private && client_refuses_cache(request.headers())
    }

    fn key(&self, request: &Request<Body>) -> String {
        let base = (self.key_generator)(request);
        if self.vary_by.is_empty() {
            return base;
        }
        let parts: Vec<KeyPart> = self
            .vary_by
            .iter()
            .flat_map(|name| {
                let value = request
                    .headers()
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default();
                [KeyPart::from(name.as_str()), KeyPart::from(value)]
            })
            .collect();
        format!("{base}:{}", keys::hash_parts(&parts))
    }

    fn options(&self) -> CacheOptions {
        CacheOptions::new()
            .with_ttl(self.ttl)
            .with_prefix(self.prefix.clone())
    }

    fn cache_control_value(&self) -> String {
        self.cache_control.clone().unwrap_or_else(|| {
            let scope = if self.cache_private { "private" } else { "public" };
            format!("{scope}, max-age={}", self.ttl.as_secs())
        })
    }

    fn decorate(&self, headers: &mut HeaderMap, outcome: &'static str, key: &str, expires_at: u64) {
        headers.insert(X_CACHE.clone(), HeaderValue::from_static(outcome));
        if let Ok(value) = HeaderValue::from_str(key) {
            headers.insert(X_CACHE_KEY.clone(), value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.cache_control_value()) {
            headers.insert(header::CACHE_CONTROL, value);
        }
        let expires = UNIX_EPOCH + Duration::from_secs(expires_at);
        if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(expires)) {
            headers.insert(header::EXPIRES, value);
        }
    }
}

/// `endpoint:GET:<path>:<query digest>`; HEAD shares the GET key.
pub fn default_key(request: &Request<Body>) -> String {
    keys::endpoint(Method::GET.as_str(), request.uri().path(), request.uri().query())
}

fn client_refuses_cache(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|directive| directive.trim().to_ascii_lowercase())
        .any(|directive| directive == "no-cache" || directive == "no-store")
}

/// A response as persisted in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Base64 of the raw body bytes.
    pub body: String,
    /// Unix seconds, replayed as `Expires`.
    pub expires_at: u64,
}

impl StoredResponse {
    fn capture(status: StatusCode, headers: &HeaderMap, body: &Bytes, expires_at: u64) -> Self {
        let headers = STORED_HEADERS
            .iter()
            .filter_map(|name| {
                let value = headers.get(name)?.to_str().ok()?;
                Some((name.as_str().to_string(), value.to_string()))
            })
            .collect();
        Self {
            status: status.as_u16(),
            headers,
            body: STANDARD.encode(body),
            expires_at,
        }
    }

    fn into_response(self) -> Option<Response> {
        let body = STANDARD.decode(self.body.as_bytes()).ok()?;
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = StatusCode::from_u16(self.status).ok()?;
        let headers = response.headers_mut();
        for (name, value) in self.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) else {
                continue;
            };
            headers.append(name, value);
        }
        Some(response)
    }
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("failed to buffer response body: {0}")]
    Body(String),
    #[error("response body exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

pub fn should_store_response(response: &Response) -> bool {
    if !response.status().is_success() {
        return false;
    }

    if response.headers().contains_key(header::SET_COOKIE) {
        return false;
    }

    if response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
    {
        return false;
    }

    true
}

/// Collects up to `limit` bytes of the body so it can be stored, handing
/// back an equivalent response.
///
/// An oversized body comes back intact as a stream with
/// [`BufferError::TooLarge`]. A body that fails mid-read becomes a 500.
pub async fn buffer_response(
    response: Response,
    limit: usize,
) -> Result<(Response, Bytes), (Response, BufferError)> {
    let (parts, mut body) = response.into_parts();
    if body.size_hint().lower() > limit as u64 {
        return Err((
            Response::from_parts(parts, body),
            BufferError::TooLarge { limit },
        ));
    }

    let mut buffered = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(error) => {
                let error = BufferError::Body(error.to_string());
                let mut failed = Response::new(Body::empty());
                *failed.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                ErrorReport::from_message(
                    "http::cache::buffer_response",
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error.to_string(),
                )
                .attach(&mut failed);
                return Err((failed, error));
            }
        };
        // Trailers are not replayed from the cache.
        let Ok(data) = frame.into_data() else {
            continue;
        };
        buffered.extend_from_slice(&data);

        if buffered.len() > limit {
            let head = buffered.freeze();
            let replay = stream::once(async move { Ok::<_, axum::Error>(head) })
                .chain(body.into_data_stream());
            return Err((
                Response::from_parts(parts, Body::from_stream(replay)),
                BufferError::TooLarge { limit },
            ));
        }
    }

    let bytes = buffered.freeze();
    Ok((Response::from_parts(parts, Body::from(bytes.clone())), bytes))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

pub async fn cache_responses(
    State(layer): State<ResponseCacheLayer>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if layer.bypass(&request) {
        return next.run(request).await;
    }

    let key = layer.key(&request);
    let full_key = layer.cache.effective_key(&key, Some(&layer.prefix));
    let options = layer.options();

    if let Some(stored) = layer.cache.get::<StoredResponse>(&key, &options).await {
        let expires_at = stored.expires_at;
        match stored.into_response() {
            Some(mut response) => {
                debug!(target: SOURCE, key = %full_key, "served from cache");
                layer.decorate(response.headers_mut(), "HIT", &full_key, expires_at);
                return response;
            }
            None => {
                warn!(target: SOURCE, key = %full_key, "discarding unreadable cached response");
                layer.cache.delete(&key, &options).await;
            }
        }
    }

    let is_get = request.method() == Method::GET;
    let response = next.run(request).await;

    let mut response = if is_get && should_store_response(&response) {
        match buffer_response(response, layer.max_body_bytes).await {
            Ok((mut rebuilt, bytes)) => {
                let expires_at = unix_now() + layer.ttl.as_secs();
                let stored =
                    StoredResponse::capture(rebuilt.status(), rebuilt.headers(), &bytes, expires_at);
                if layer.cache.set(&key, &stored, &options).await {
                    layer.decorate(rebuilt.headers_mut(), "MISS", &full_key, expires_at);
                }
                rebuilt
            }
            Err((rebuilt, error @ BufferError::TooLarge { .. })) => {
                debug!(target: SOURCE, key = %full_key, error = %error, "response not cached");
                rebuilt
            }
            Err((rebuilt, error)) => {
                warn!(target: SOURCE, key = %full_key, error = %error, "response not cached");
                rebuilt
            }
        }
    } else {
        response
    };

    response
        .headers_mut()
        .insert(X_CACHE.clone(), HeaderValue::from_static("MISS"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::cache_with_clock;

    fn get(uri: &str) -> axum::http::request::Builder {
        Request::builder().method(Method::GET).uri(uri)
    }

    #[test]
    fn bypasses_mutations_and_excluded_paths() {
        let (cache, _, _) = cache_with_clock("app");
        let layer = ResponseCacheLayer::new(cache)
            .exclude_paths(["/admin"])
            .include_paths(["/api", "/admin"]);

        let post = Request::builder()
            .method(Method::POST)
            .uri("/api/items")
            .body(Body::empty())
            .unwrap();
        assert!(layer.bypass(&post));
        assert!(layer.bypass(&get("/admin/stats").body(Body::empty()).unwrap()));
        assert!(layer.bypass(&get("/health").body(Body::empty()).unwrap()));
        assert!(!layer.bypass(&get("/api/items").body(Body::empty()).unwrap()));
    }

    #[test]
    fn client_no_cache_bypasses_unless_private() {
        let (cache, _, _) = cache_with_clock("app");
        let request = get("/api/items")
            .header(header::CACHE_CONTROL, "max-age=0, No-Cache")
            .body(Body::empty())
            .unwrap();

        let layer = ResponseCacheLayer::new(cache);
        assert!(layer.bypass(&request));
        assert!(!layer.clone().cache_private(true).bypass(&request));
    }

    #[test]
    fn vary_by_headers_split_the_key() {
        let (cache, _, _) = cache_with_clock("app");
        let layer = ResponseCacheLayer::new(cache).vary_by([header::ACCEPT_LANGUAGE]);

        let en = get("/api/items?b=2&a=1")
            .header(header::ACCEPT_LANGUAGE, "en")
            .body(Body::empty())
            .unwrap();
        let de = get("/api/items?a=1&b=2")
            .header(header::ACCEPT_LANGUAGE, "de")
            .body(Body::empty())
            .unwrap();
        let en_again = get("/api/items?a=1&b=2")
            .header(header::ACCEPT_LANGUAGE, "en")
            .body(Body::empty())
            .unwrap();

        assert_ne!(layer.key(&en), layer.key(&de));
        assert_eq!(layer.key(&en), layer.key(&en_again));
        assert!(layer.key(&en).starts_with("endpoint:GET:/api/items:"));
    }

    #[test]
    fn stored_response_keeps_only_whitelisted_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::ETAG, HeaderValue::from_static("\"v1\""));
        headers.insert(header::SERVER, HeaderValue::from_static("internal"));

        let stored = StoredResponse::capture(StatusCode::OK, &headers, &Bytes::from_static(b"{}"), 10);
        assert_eq!(stored.headers.len(), 2);

        let response = stored.into_response().unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert!(!response.headers().contains_key(header::SERVER));
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn buffering_within_limit_returns_the_same_body() {
        let response = Response::new(Body::from("hello"));
        let (rebuilt, bytes) = buffer_response(response, 16).await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"hello"));
        assert_eq!(body_text(rebuilt).await, "hello");
    }

    #[tokio::test]
    async fn oversized_bodies_pass_through_intact() {
        let known_length = Response::new(Body::from("0123456789"));
        let (rebuilt, error) = buffer_response(known_length, 4).await.unwrap_err();
        assert!(matches!(error, BufferError::TooLarge { limit: 4 }));
        assert_eq!(body_text(rebuilt).await, "0123456789");

        let chunks = ["012", "345", "6789"].map(|chunk| Ok::<_, std::io::Error>(Bytes::from(chunk)));
        let streamed = Response::new(Body::from_stream(stream::iter(chunks)));
        let (rebuilt, error) = buffer_response(streamed, 4).await.unwrap_err();
        assert!(matches!(error, BufferError::TooLarge { limit: 4 }));
        assert_eq!(body_text(rebuilt).await, "0123456789");
    }

    #[tokio::test]
    async fn broken_bodies_become_server_errors() {
        let chunks = [
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("connection reset")),
        ];
        let broken = Response::new(Body::from_stream(stream::iter(chunks)));
        let (rebuilt, error) = buffer_response(broken, 1024).await.unwrap_err();
        assert!(matches!(error, BufferError::Body(_)));
        assert_eq!(rebuilt.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(rebuilt.extensions().get::<ErrorReport>().is_some());
    }

    #[test]
    fn responses_with_cookies_are_not_stored() {
        let mut response = Response::new(Body::empty());
        assert!(should_store_response(&response));
        response
            .headers_mut()
            .insert(header::SET_COOKIE, HeaderValue::from_static("sid=1"));
        assert!(!should_store_response(&response));

        let mut failed = Response::new(Body::empty());
        *failed.status_mut() = StatusCode::NOT_FOUND;
        assert!(!should_store_response(&failed));
    }
}
