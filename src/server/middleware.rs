use super::AppState;
use crate::error::AppError;
use crate::modality::chat::Dialect;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-process counters that are not request logs.
#[derive(Debug, Default)]
pub struct Counters {
    auth_failures: AtomicU64,
}

impl Counters {
    pub fn auth_failure(&self) -> u64 {
        self.auth_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::Relaxed)
    }
}

/// Peer address of the caller, when the listener records it.
#[derive(Debug, Clone, Default)]
pub struct ClientAddr(pub Option<String>);

/// Dialect a path's clients expect errors in.
pub fn dialect_for_path(path: &str) -> Dialect {
    let path = path.strip_prefix("/api").unwrap_or(path);
    if path.starts_with("/anthropic") || path.starts_with("/claudecode") {
        Dialect::Claude
    } else if path.starts_with("/gemini") {
        Dialect::Gemini
    } else if path.starts_with("/cursor") {
        Dialect::Cursor
    } else {
        Dialect::Openai
    }
}

/// Keys presented by the caller, in order: `Authorization: Bearer`,
/// `x-api-key`, `x-goog-api-key` and the `key` query parameter.
pub fn presented_api_keys(headers: &HeaderMap, query: Option<&str>) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .unwrap_or(auth)
            .trim();
        if !token.is_empty() {
            keys.push(token.to_string());
        }
    }

    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(v) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !v.trim().is_empty() {
                keys.push(v.trim().to_string());
            }
        }
    }

    if let Some(query) = query {
        keys.extend(query.split('&').filter_map(|pair| {
            let value = pair.strip_prefix("key=")?;
            urlencoding::decode(value).ok().map(|v| v.into_owned())
        }));
    }
    keys
}

/// Check the local api key and record the caller address. An empty
/// configured key disables the check.
pub async fn authenticate(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    req.extensions_mut().insert(ClientAddr(remote));

    let expected = state.config.read().await.local_api_key.clone();
    if expected.is_empty() {
        return next.run(req).await;
    }

    let presented = presented_api_keys(req.headers(), req.uri().query());
    if presented.iter().any(|key| *key == expected) {
        return next.run(req).await;
    }

    let failures = state.counters.auth_failure();
    log::warn!(
        "Rejected unauthenticated request to {} ({} auth failures)",
        req.uri().path(),
        failures
    );
    let dialect = dialect_for_path(req.uri().path());
    AppError::Unauthorized(if !presented.is_empty() {
        "key mismatch".into()
    } else {
        "missing key".into()
    })
    .for_dialect(dialect)
    .into_response()
}
