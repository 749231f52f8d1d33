//! OpenAI endpoints forwarded without translation: legacy completions,
//! embeddings, images and audio.

use super::middleware::ClientAddr;
use super::proxy::{CallLog, CallRecord};
use super::upstream;
use super::AppState;
use crate::error::AppError;
use crate::modality::chat::ir::IrUsage;
use crate::modality::chat::stream::estimate_tokens;
use crate::modality::chat::Dialect;
use crate::routing::RouteDecision;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use serde_json::Value;
use std::time::Duration;
use tokio_stream::StreamExt;

pub async fn completions(
    State(state): State<AppState>,
    Extension(client): Extension<ClientAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    forward(&state, client, headers, body, "completions").await
}

pub async fn embeddings(
    State(state): State<AppState>,
    Extension(client): Extension<ClientAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    forward(&state, client, headers, body, "embeddings").await
}

pub async fn images(
    State(state): State<AppState>,
    Extension(client): Extension<ClientAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    forward(&state, client, headers, body, "images/generations").await
}

pub async fn transcriptions(
    State(state): State<AppState>,
    Extension(client): Extension<ClientAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    forward(&state, client, headers, body, "audio/transcriptions").await
}

pub async fn speech(
    State(state): State<AppState>,
    Extension(client): Extension<ClientAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    forward(&state, client, headers, body, "audio/speech").await
}

/// Request body as it will be sent upstream.
enum Outbound {
    Json(Value),
    Multipart { content_type: String },
}

struct Parsed {
    model: String,
    stream: bool,
    outbound: Outbound,
}

fn parse(headers: &HeaderMap, body: &[u8]) -> Result<Parsed, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");

    if content_type.starts_with("multipart/form-data") {
        let boundary = multipart_boundary(content_type)
            .ok_or_else(|| AppError::BadRequest("multipart body without boundary".into()))?;
        let model = multipart_model(body, &boundary)
            .ok_or_else(|| AppError::BadRequest("model is required".into()))?;
        return Ok(Parsed {
            model,
            stream: false,
            outbound: Outbound::Multipart {
                content_type: content_type.to_string(),
            },
        });
    }

    let value: Value = serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("invalid JSON body: {}", e)))?;
    let model = value
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("model is required".into()))?
        .to_string();
    let stream = value.get("stream").and_then(Value::as_bool).unwrap_or(false);
    Ok(Parsed {
        model,
        stream,
        outbound: Outbound::Json(value),
    })
}

pub fn multipart_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let value = param.trim().strip_prefix("boundary=")?;
        Some(value.trim_matches('"').to_string())
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Value of the `model` form field in a multipart body.
pub fn multipart_model(body: &[u8], boundary: &str) -> Option<String> {
    let delimiter = format!("--{}", boundary);
    let mut rest = body;
    while let Some(start) = find(rest, delimiter.as_bytes()) {
        rest = &rest[start + delimiter.len()..];
        let end = find(rest, delimiter.as_bytes()).unwrap_or(rest.len());
        let part = &rest[..end];

        if let Some(split) = find(part, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&part[..split]);
            let is_model = head.lines().any(|line| {
                line.to_ascii_lowercase().starts_with("content-disposition")
                    && line.contains("name=\"model\"")
            });
            if is_model {
                let value = String::from_utf8_lossy(&part[split + 4..]);
                let value = value.trim_end_matches("\r\n").trim();
                return (!value.is_empty()).then(|| value.to_string());
            }
        }
    }
    None
}

fn usage_of(body: &[u8]) -> Option<IrUsage> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let usage = value.get("usage")?;
    let prompt = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let completion = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(IrUsage::new(prompt as u32, completion as u32))
}

async fn forward(
    state: &AppState,
    client: ClientAddr,
    headers: HeaderMap,
    body: Bytes,
    endpoint: &str,
) -> Response {
    let cfg = state.config.read().await.clone();
    let mut call_log = CallLog::new(
        state.logs.clone(),
        CallRecord::new(Dialect::Openai.as_str(), &client, &cfg, &body),
    );

    let parsed = match parse(&headers, &body) {
        Ok(parsed) => parsed,
        Err(e) => return fail(&mut call_log, e),
    };
    call_log.record.requested(&parsed.model, parsed.stream);

    let decision = match state.router.route_for(&parsed.model).await {
        Ok(decision) => decision,
        Err(e) => return fail(&mut call_log, e),
    };
    call_log
        .record
        .routed(decision.route.id, &decision.effective_model);
    if !matches!(decision.route.dialect, Dialect::Openai | Dialect::Cursor) {
        return fail(
            &mut call_log,
            AppError::Validation(format!(
                "/v1/{} needs an openai or cursor route, {} is {}",
                endpoint, decision.route.name, decision.route.dialect
            )),
        );
    }

    let prompt_estimate = estimate_tokens(body.len());
    match send(state, &cfg, &decision, &headers, body, parsed, endpoint).await {
        Ok(resp) => relay(state, call_log, &decision, resp, prompt_estimate).await,
        Err(e) => {
            state.health().record(decision.route.id, false);
            fail(&mut call_log, e)
        }
    }
}

async fn send(
    state: &AppState,
    cfg: &crate::config::AppConfig,
    decision: &RouteDecision,
    headers: &HeaderMap,
    body: Bytes,
    parsed: Parsed,
    endpoint: &str,
) -> Result<reqwest::Response, AppError> {
    let url = upstream::build_openai_url(&decision.route.api_url, endpoint);
    log::debug!(
        "Forwarding /v1/{} ({} bytes) via route {} to {}",
        endpoint,
        body.len(),
        decision.route.id,
        url
    );

    let mut builder = state.http.post(&url);
    builder = match parsed.outbound {
        Outbound::Json(mut value) => {
            value["model"] = Value::String(decision.effective_model.clone());
            builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(serde_json::to_vec(&value)?)
        }
        Outbound::Multipart { content_type } => {
            // the form is forwarded byte for byte, model field included
            builder.header(header::CONTENT_TYPE, content_type).body(body)
        }
    };
    builder = upstream::apply_auth(builder, Dialect::Openai, &decision.route.api_key);
    builder = upstream::forward_headers(builder, headers);
    if !parsed.stream {
        builder = builder.timeout(Duration::from_secs(cfg.request_timeout_secs));
    }
    upstream::check_status(builder.send().await?).await
}

/// Relay an upstream success, streaming it through when it is SSE.
async fn relay(
    state: &AppState,
    mut call_log: CallLog,
    decision: &RouteDecision,
    resp: reqwest::Response,
    prompt_estimate: u32,
) -> Response {
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::OK);
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| HeaderValue::from_bytes(v.as_bytes()).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    state.health().record(decision.route.id, true);

    let is_sse = content_type
        .to_str()
        .is_ok_and(|ct| ct.starts_with("text/event-stream"));
    if is_sse {
        let mut upstream = Box::pin(resp.bytes_stream());
        let body = async_stream::stream! {
            let mut received = 0usize;
            while let Some(chunk) = upstream.next().await {
                match chunk {
                    Ok(chunk) => {
                        received += chunk.len();
                        yield Ok::<Bytes, std::io::Error>(chunk);
                    }
                    Err(e) => {
                        call_log.write(
                            status.as_u16(),
                            IrUsage::new(prompt_estimate, estimate_tokens(received)),
                            Some(&format!("upstream read failed: {}", e)),
                        );
                        return;
                    }
                }
            }
            call_log.write(
                status.as_u16(),
                IrUsage::new(prompt_estimate, estimate_tokens(received)),
                None,
            );
        };
        return Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CACHE_CONTROL, "no-cache")
            .header("X-Accel-Buffering", "no")
            .body(Body::from_stream(body))
            .unwrap_or_else(|e| AppError::Internal(e.to_string()).into_response());
    }

    match resp.bytes().await {
        Ok(bytes) => {
            let usage = usage_of(&bytes)
                .unwrap_or_else(|| IrUsage::new(prompt_estimate, estimate_tokens(bytes.len())));
            if content_type
                .to_str()
                .is_ok_and(|ct| ct.contains("json") || ct.starts_with("text/"))
            {
                call_log.record.response_body(&bytes);
            }
            call_log.write(status.as_u16(), usage, None);
            (status, [(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Err(e) => fail(&mut call_log, e.into()),
    }
}

fn fail(call_log: &mut CallLog, error: AppError) -> Response {
    log::warn!("Passthrough request failed: {}", error);
    call_log.write(
        error.status().as_u16(),
        IrUsage::default(),
        Some(&error.to_string()),
    );
    error.for_dialect(Dialect::Openai).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORM: &[u8] = b"--XyZ\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.wav\"\r\nContent-Type: audio/wav\r\n\r\nRIFF\x00\x01model\r\n--XyZ\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\nwhisper-1\r\n--XyZ--\r\n";

    #[test]
    fn finds_model_field_in_multipart_form() {
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=\"XyZ\"").as_deref(),
            Some("XyZ")
        );
        assert_eq!(multipart_model(FORM, "XyZ").as_deref(), Some("whisper-1"));
        assert_eq!(multipart_model(b"--XyZ--\r\n", "XyZ"), None);
    }

    #[test]
    fn json_body_needs_model() {
        let headers = HeaderMap::new();
        let parsed = parse(&headers, br#"{"model":"text-embedding-3-small","input":"hi"}"#).unwrap();
        assert_eq!(parsed.model, "text-embedding-3-small");
        assert!(!parsed.stream);
        assert!(matches!(
            parse(&headers, br#"{"input":"hi"}"#),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn usage_from_upstream_body() {
        let usage = usage_of(br#"{"data":[],"usage":{"prompt_tokens":8,"total_tokens":8}}"#).unwrap();
        assert_eq!(usage.prompt_tokens, 8);
        assert_eq!(usage.completion_tokens, 0);
        assert!(usage_of(b"not json").is_none());
    }
}
