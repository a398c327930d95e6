use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use crate::cache::Invalidator;

const SOURCE: &str = "cylinder_cache::http::invalidate";

type PatternFn = Arc<dyn Fn(&Request<Body>) -> Vec<String> + Send + Sync>;

/// Configuration for [`invalidate_on_write`].
///
/// Patterns are resolved from the request before the handler runs, then
/// deleted on a detached task once the handler answers 2xx. The client may
/// see the response before the deletion completes.
#[derive(Clone)]
pub struct InvalidateLayer {
    invalidator: Invalidator,
    patterns: Vec<String>,
    derive: Option<PatternFn>,
}

impl std::fmt::Debug for InvalidateLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidateLayer")
            .field("patterns", &self.patterns)
            .field("derived", &self.derive.is_some())
            .finish()
    }
}

impl InvalidateLayer {
    pub fn new(invalidator: Invalidator) -> Self {
        Self {
            invalidator,
            patterns: Vec::new(),
            derive: None,
        }
    }

    pub fn patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Patterns computed from the request, added to the static ones.
    pub fn derive(
        mut self,
        f: impl Fn(&Request<Body>) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.derive = Some(Arc::new(f));
        self
    }

    fn resolve(&self, request: &Request<Body>) -> Vec<String> {
        let mut patterns = self.patterns.clone();
        if let Some(derive) = &self.derive {
            patterns.extend(derive(request));
        }
        let mut seen = HashSet::new();
        patterns.retain(|pattern| seen.insert(pattern.clone()));
        patterns
    }
}

fn is_write(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

pub async fn invalidate_on_write(
    State(layer): State<InvalidateLayer>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !is_write(request.method()) {
        return next.run(request).await;
    }

    let patterns = layer.resolve(&request);
    let path = request.uri().path().to_string();
    let response = next.run(request).await;

    if response.status().is_success() && !patterns.is_empty() {
        let invalidator = layer.invalidator.clone();
        tokio::spawn(async move {
            let removed = invalidator.invalidate_patterns(&patterns).await;
            debug!(
                target: SOURCE,
                path = %path,
                patterns = ?patterns,
                removed,
                "write invalidated cached entries"
            );
        });
    }

    response
}
