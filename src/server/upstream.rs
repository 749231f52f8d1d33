use crate::error::AppError;
use crate::modality::chat::Dialect;
use axum::http::HeaderMap;
use std::time::Duration;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Client headers passed through to the upstream unchanged.
const FORWARDED_HEADERS: &[&str] = &["user-agent", "anthropic-beta"];

pub fn build_client(connect_timeout: Duration) -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| AppError::Internal(format!("failed to build http client: {}", e)))
}

/// True when the last path segment is an API version such as `v1`,
/// `v1beta` or `v2alpha`.
fn ends_with_version(base: &str) -> bool {
    let last = base.rsplit('/').next().unwrap_or("");
    let mut chars = last.chars();
    chars.next() == Some('v') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

fn versioned_base(api_url: &str, default_version: &str) -> String {
    let base = api_url.trim_end_matches('/');
    if ends_with_version(base) {
        base.to_string()
    } else {
        format!("{}/{}", base, default_version)
    }
}

/// Completion endpoint for a route of `dialect`.
pub fn build_upstream_url(api_url: &str, dialect: Dialect, model: &str, stream: bool) -> String {
    match dialect {
        Dialect::Openai | Dialect::Cursor => {
            format!("{}/chat/completions", versioned_base(api_url, "v1"))
        }
        Dialect::Claude => format!("{}/messages", versioned_base(api_url, "v1")),
        Dialect::Gemini => {
            let model = model.strip_prefix("models/").unwrap_or(model);
            let base = versioned_base(api_url, "v1beta");
            if stream {
                format!(
                    "{}/models/{}:streamGenerateContent?alt=sse",
                    base,
                    urlencoding::encode(model)
                )
            } else {
                format!("{}/models/{}:generateContent", base, urlencoding::encode(model))
            }
        }
    }
}

/// OpenAI-family endpoint other than chat, e.g. `embeddings`.
pub fn build_openai_url(api_url: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        versioned_base(api_url, "v1"),
        endpoint.trim_start_matches('/')
    )
}

pub fn apply_auth(
    builder: reqwest::RequestBuilder,
    dialect: Dialect,
    api_key: &str,
) -> reqwest::RequestBuilder {
    if api_key.is_empty() {
        return builder;
    }
    match dialect {
        Dialect::Openai | Dialect::Cursor => {
            builder.header("Authorization", format!("Bearer {}", api_key))
        }
        Dialect::Claude => builder
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION),
        Dialect::Gemini => builder.header("x-goog-api-key", api_key),
    }
}

pub fn forward_headers(
    mut builder: reqwest::RequestBuilder,
    headers: &HeaderMap,
) -> reqwest::RequestBuilder {
    for name in FORWARDED_HEADERS {
        if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) {
            builder = builder.header(*name, value);
        }
    }
    builder
}

/// Turn a non-2xx upstream response into an error carrying its body.
pub async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, AppError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(AppError::Upstream {
        status: status.as_u16(),
        body,
    })
}
