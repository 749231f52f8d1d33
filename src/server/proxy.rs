use super::middleware::ClientAddr;
use super::upstream;
use super::AppState;
use crate::config::AppConfig;
use crate::db::logs::LogWriter;
use crate::db::models::{RequestLog, Route};
use crate::db::now_millis;
use crate::error::AppError;
use crate::modality::chat::ir::{IrChatRequest, IrUsage};
use crate::modality::chat::stream::{
    estimate_tokens, SseFrame, SseParser, StreamOutcome, StreamTranslator,
};
use crate::modality::chat::{get_decoder, get_encoder, Dialect};
use crate::redact;
use crate::routing::{next_fallback, HealthTracker, RouteDecision};
use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::StreamExt;

/// One proxied chat call as the front end hands it over.
pub struct ProxyCall {
    pub source: Dialect,
    /// Upstream dialect that overrides the matched route's own.
    pub forced_target: Option<Dialect>,
    /// Model named by the URL rather than the body.
    pub path_model: Option<String>,
    /// Stream mode named by the URL rather than the body.
    pub path_stream: Option<bool>,
    pub client: ClientAddr,
    pub headers: HeaderMap,
}

impl ProxyCall {
    pub fn new(source: Dialect, client: ClientAddr, headers: HeaderMap) -> Self {
        Self {
            source,
            forced_target: None,
            path_model: None,
            path_stream: None,
            client,
            headers,
        }
    }

    pub fn force_target(mut self, target: Dialect) -> Self {
        self.forced_target = Some(target);
        self
    }

    pub fn path_model(mut self, model: impl Into<String>, stream: bool) -> Self {
        self.path_model = Some(model.into());
        self.path_stream = Some(stream);
        self
    }
}

/// The request log row under construction for one call.
#[derive(Clone)]
pub(crate) struct CallRecord {
    log: RequestLog,
    started: Instant,
    traces: bool,
    snippet_limit: usize,
}

impl CallRecord {
    pub(crate) fn new(
        source: &str,
        client: &ClientAddr,
        cfg: &AppConfig,
        body: &[u8],
    ) -> Self {
        let traces = cfg.traces_enabled;
        Self {
            log: RequestLog {
                created_at: now_millis(),
                remote_ip: client.0.clone(),
                source_dialect: source.to_string(),
                request_body_snippet: traces.then(|| redact::snippet(body, cfg.snippet_limit)),
                ..Default::default()
            },
            started: Instant::now(),
            traces,
            snippet_limit: cfg.snippet_limit,
        }
    }

    pub(crate) fn requested(&mut self, model: &str, stream: bool) {
        self.log.requested_model = model.to_string();
        self.log.is_stream = stream;
    }

    pub(crate) fn routed(&mut self, route_id: i64, provider_model: &str) {
        self.log.resolved_route_id = Some(route_id);
        self.log.provider_model = Some(provider_model.to_string());
    }

    pub(crate) fn response_body(&mut self, body: &[u8]) {
        if self.traces {
            self.log.response_body_snippet = Some(redact::snippet(body, self.snippet_limit));
        }
    }

    pub(crate) fn finish(&self, status: u16, usage: IrUsage, error: Option<&str>) -> RequestLog {
        let mut log = self.log.clone();
        log.proxy_time_ms = self.started.elapsed().as_millis() as i64;
        log.request_tokens = usage.prompt_tokens as i64;
        log.response_tokens = usage.completion_tokens as i64;
        log.total_tokens = usage.total() as i64;
        log.http_status = status as i64;
        log.success = error.is_none();
        log.error_message =
            error.map(|e| redact::cap(&redact::redact(e), self.snippet_limit).to_string());
        log
    }
}

/// Writes the call's row exactly once. Dropped unwritten means the client
/// went away while the call was in flight.
pub(crate) struct CallLog {
    logs: LogWriter,
    pub(crate) record: CallRecord,
    written: bool,
}

impl CallLog {
    pub(crate) fn new(logs: LogWriter, record: CallRecord) -> Self {
        Self {
            logs,
            record,
            written: false,
        }
    }

    pub(crate) fn write(&mut self, status: u16, usage: IrUsage, error: Option<&str>) {
        self.written = true;
        self.logs.append(self.record.finish(status, usage, error));
    }

    /// Extra row for a failed attempt that was retried elsewhere.
    fn write_attempt(&self, status: u16, error: &str) {
        self.logs
            .append(self.record.finish(status, IrUsage::default(), Some(error)));
    }

    /// A committed stream logs for itself from here on.
    fn hand_off(&mut self) -> CallRecord {
        self.written = true;
        self.record.clone()
    }
}

impl Drop for CallLog {
    fn drop(&mut self) {
        if !self.written {
            log::info!("Client disconnected before the upstream answered");
            let status = AppError::Cancelled.status().as_u16();
            self.logs
                .append(self.record.finish(status, IrUsage::default(), Some("cancelled")));
        }
    }
}

/// Run one chat call end to end: parse, route, dispatch with fallback,
/// translate back. Exactly one request log row is written per call.
pub async fn execute(state: &AppState, call: ProxyCall, body: Bytes) -> Response {
    let cfg = state.config.read().await.clone();
    let mut call_log = CallLog::new(
        state.logs.clone(),
        CallRecord::new(call.source.as_str(), &call.client, &cfg, &body),
    );

    let ir = match parse(&call, &body) {
        Ok(ir) => ir,
        Err(e) => return reject(&mut call_log, call.source, e),
    };
    call_log.record.requested(&ir.model, ir.stream);

    let decision = match state.router.route_for(&ir.model).await {
        Ok(decision) => decision,
        Err(e) => return reject(&mut call_log, call.source, e),
    };

    let prompt_estimate = estimate_tokens(body.len());
    let mut decision = decision;
    let mut tried: Vec<i64> = Vec::new();
    let mut siblings: Option<Vec<Route>> = None;

    loop {
        tried.push(decision.route.id);
        call_log
            .record
            .routed(decision.route.id, &decision.effective_model);
        let target = call.forced_target.unwrap_or(decision.route.dialect);

        let attempt = Attempt {
            state,
            cfg: &cfg,
            call: &call,
            ir: &ir,
            decision: &decision,
            target,
            prompt_estimate,
        };
        let result = if ir.stream {
            attempt.stream(&mut call_log).await
        } else {
            attempt.buffered(&mut call_log).await
        };

        let error = match result {
            Ok(response) => return response,
            Err(error) => error,
        };
        state.health().record(decision.route.id, false);

        if error.is_retryable() && cfg.fallback_enabled && tried.len() <= cfg.fallback_depth {
            if siblings.is_none() {
                siblings = Some(state.router.siblings(&decision.route).await.unwrap_or_else(|e| {
                    log::warn!("Could not load fallback routes: {}", e);
                    Vec::new()
                }));
            }
            let next = siblings.as_deref().and_then(|members| {
                next_fallback(
                    members,
                    decision.route.id,
                    &tried,
                    state.health(),
                    cfg.health_skip_threshold,
                )
            });
            if let Some(next) = next {
                log::warn!(
                    "Route {} failed ({}), falling back to route {}",
                    decision.route.id,
                    error,
                    next.id
                );
                if cfg.log_fallback_attempts {
                    call_log.write_attempt(error.status().as_u16(), &error.to_string());
                }
                decision = RouteDecision::sibling(next.clone());
                continue;
            }
        }

        log::error!(
            "{} request for {} via route {} failed: {}",
            call.source,
            ir.model,
            decision.route.id,
            error
        );
        call_log.write(
            error.status().as_u16(),
            IrUsage::default(),
            Some(&error.to_string()),
        );
        return error.for_dialect(call.source).into_response();
    }
}

fn parse(call: &ProxyCall, body: &[u8]) -> Result<IrChatRequest, AppError> {
    let mut ir = get_decoder(call.source).decode_request(body)?;
    if let Some(model) = &call.path_model {
        ir.model = model.clone();
    }
    if let Some(stream) = call.path_stream {
        ir.stream = stream;
    }
    if ir.model.trim().is_empty() {
        return Err(AppError::BadRequest("model is required".into()));
    }
    Ok(ir)
}

fn reject(call_log: &mut CallLog, source: Dialect, error: AppError) -> Response {
    log::warn!("Rejected {} request: {}", source, error);
    call_log.write(
        error.status().as_u16(),
        IrUsage::default(),
        Some(&error.to_string()),
    );
    error.for_dialect(source).into_response()
}

/// One try of a call against one route.
struct Attempt<'a> {
    state: &'a AppState,
    cfg: &'a AppConfig,
    call: &'a ProxyCall,
    ir: &'a IrChatRequest,
    decision: &'a RouteDecision,
    target: Dialect,
    prompt_estimate: u32,
}

impl Attempt<'_> {
    async fn dispatch(&self) -> Result<reqwest::Response, AppError> {
        let decision = self.decision;
        let mut outbound = self.ir.clone();
        // unknown fields only mean something to the dialect that sent them
        if self.call.source.wire_family() != self.target.wire_family() {
            outbound.extra.clear();
        }
        outbound.model = decision.effective_model.clone();

        let body = get_encoder(self.target).encode_request(&outbound, &decision.effective_model)?;
        let url = upstream::build_upstream_url(
            &decision.route.api_url,
            self.target,
            &decision.effective_model,
            self.ir.stream,
        );
        log::debug!(
            "Dispatching {} -> {} via route {} to {}",
            self.call.source,
            self.target,
            decision.route.id,
            url
        );

        let mut builder = self
            .state
            .http
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body);
        builder = upstream::apply_auth(builder, self.target, &decision.route.api_key);
        builder = upstream::forward_headers(builder, &self.call.headers);
        if !self.ir.stream {
            builder = builder.timeout(Duration::from_secs(self.cfg.request_timeout_secs));
        }

        upstream::check_status(builder.send().await?).await
    }

    async fn buffered(&self, call_log: &mut CallLog) -> Result<Response, AppError> {
        let resp = self.dispatch().await?;
        let bytes = resp.bytes().await?;

        let mut translated = get_decoder(self.target).decode_response(&bytes)?;
        if translated.model.is_empty() {
            translated.model = self.decision.effective_model.clone();
        }
        let out = get_encoder(self.call.source).encode_response(&translated)?;

        let usage = translated.usage.unwrap_or_else(|| {
            IrUsage::new(
                self.prompt_estimate,
                estimate_tokens(translated.content_len()),
            )
        });
        self.state.health().record(self.decision.route.id, true);
        call_log.record.response_body(&out);
        call_log.write(200, usage, None);

        Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            out,
        )
            .into_response())
    }

    async fn stream(&self, call_log: &mut CallLog) -> Result<Response, AppError> {
        let resp = self.dispatch().await?;
        let idle = Duration::from_secs(self.cfg.stream_idle_timeout_secs);
        let mut upstream = Box::pin(resp.bytes_stream());
        let mut parser = SseParser::new();
        let mut translator = StreamTranslator::new(
            get_decoder(self.target).stream_decoder(),
            get_encoder(self.call.source).stream_encoder(),
            self.decision.effective_model.clone(),
            self.prompt_estimate,
        );

        // Nothing is flushed until the upstream has produced output, so a
        // dead upstream can still fall back.
        let mut first: Vec<SseFrame> = Vec::new();
        while first.is_empty() {
            match tokio::time::timeout(idle, upstream.next()).await {
                Err(_) => {
                    return Err(AppError::UpstreamTransport(format!(
                        "no data from upstream for {}s",
                        idle.as_secs()
                    )))
                }
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(chunk))) => {
                    for frame in parser.push(&chunk) {
                        first.extend(translator.feed(&frame)?);
                    }
                }
                Ok(None) => {
                    if let Some(frame) = parser.finish() {
                        first.extend(translator.feed(&frame)?);
                    }
                    if !translator.is_started() && first.is_empty() {
                        return Err(AppError::UpstreamTransport(
                            "upstream closed the stream without data".into(),
                        ));
                    }
                    first.extend(translator.finish()?);
                    break;
                }
            }
        }

        let mut guard = StreamGuard {
            logs: self.state.logs.clone(),
            health: self.state.health().clone(),
            route_id: self.decision.route.id,
            record: call_log.hand_off(),
            translator,
            captured: String::new(),
            aborted: false,
            done: false,
        };

        let body = async_stream::stream! {
            yield Ok::<Bytes, std::convert::Infallible>(guard.encode(&first));

            while !guard.finished() {
                let frames = match tokio::time::timeout(idle, upstream.next()).await {
                    Err(_) => guard.fail(
                        "timeout_error",
                        &format!("upstream sent nothing for {}s", idle.as_secs()),
                    ),
                    Ok(None) => guard.eof(parser.finish()),
                    Ok(Some(Err(e))) => {
                        guard.fail("api_error", &format!("upstream read failed: {}", e))
                    }
                    Ok(Some(Ok(chunk))) => guard.feed(parser.push(&chunk)),
                };
                if !frames.is_empty() {
                    yield Ok(guard.encode(&frames));
                }
            }

            guard.complete();
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .header("X-Accel-Buffering", "no")
            .body(Body::from_stream(body))
            .map_err(|e| AppError::Internal(e.to_string()))
    }
}

/// Owns the translator for a committed stream and writes its log row exactly
/// once: on completion, or as `cancelled` when the client goes away first.
struct StreamGuard {
    logs: LogWriter,
    health: Arc<HealthTracker>,
    route_id: i64,
    record: CallRecord,
    translator: StreamTranslator,
    captured: String,
    aborted: bool,
    done: bool,
}

impl StreamGuard {
    fn finished(&self) -> bool {
        self.aborted || self.translator.is_finished()
    }

    fn feed(&mut self, frames: Vec<SseFrame>) -> Vec<SseFrame> {
        let mut out = Vec::new();
        for frame in frames {
            match self.translator.feed(&frame) {
                Ok(encoded) => out.extend(encoded),
                Err(e) => {
                    out.extend(self.fail("translation_error", &e.to_string()));
                    break;
                }
            }
            if self.translator.is_finished() {
                break;
            }
        }
        out
    }

    fn eof(&mut self, tail: Option<SseFrame>) -> Vec<SseFrame> {
        let mut out = match tail {
            Some(frame) => self.feed(vec![frame]),
            None => Vec::new(),
        };
        match self.translator.finish() {
            Ok(encoded) => out.extend(encoded),
            Err(e) => out.extend(self.fail("translation_error", &e.to_string())),
        }
        out
    }

    fn fail(&mut self, kind: &str, message: &str) -> Vec<SseFrame> {
        log::warn!("Stream via route {} failed: {}", self.route_id, message);
        let frames = self.translator.fail(kind, message).unwrap_or_else(|e| {
            log::error!("Could not encode stream error: {}", e);
            Vec::new()
        });
        if !self.translator.is_finished() {
            self.aborted = true;
        }
        frames
    }

    fn encode(&mut self, frames: &[SseFrame]) -> Bytes {
        let mut buf = Vec::new();
        for frame in frames {
            buf.extend_from_slice(&frame.to_bytes());
        }
        if self.record.traces && self.captured.len() < self.record.snippet_limit {
            self.captured.push_str(&String::from_utf8_lossy(&buf));
        }
        Bytes::from(buf)
    }

    fn complete(&mut self) {
        self.done = true;
        let usage = self.translator.usage();
        let error = match self.translator.outcome() {
            Some(StreamOutcome::Completed) => None,
            Some(StreamOutcome::Failed { kind, message }) => Some(format!("{}: {}", kind, message)),
            None => Some("stream aborted".to_string()),
        };
        self.health.record(self.route_id, error.is_none());
        self.record.response_body(self.captured.as_bytes());
        self.logs
            .append(self.record.finish(200, usage, error.as_deref()));
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        log::info!(
            "Client disconnected, cancelled stream via route {}",
            self.route_id
        );
        let status = AppError::Cancelled.status().as_u16();
        self.record.response_body(self.captured.as_bytes());
        self.logs.append(
            self.record
                .finish(status, self.translator.usage(), Some("cancelled")),
        );
    }
}
