use super::middleware::{self, ClientAddr};
use super::proxy::{self, ProxyCall};
use super::{manage, passthrough, AppState};
use crate::db::logs::{self, LogQuery};
use crate::error::AppError;
use crate::modality::chat::Dialect;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

const BODY_LIMIT: usize = 512 * 1024 * 1024;

pub fn create_router(state: AppState) -> Router {
    let authed = Router::new()
        // OpenAI
        .route("/models", get(openai_models))
        .route("/v1/models", get(openai_models))
        .route("/v1/chat/completions", post(openai_chat))
        .route("/v1/completions", post(passthrough::completions))
        .route("/v1/embeddings", post(passthrough::embeddings))
        .route("/v1/images/generations", post(passthrough::images))
        .route("/v1/audio/transcriptions", post(passthrough::transcriptions))
        .route("/v1/audio/speech", post(passthrough::speech))
        // Anthropic
        .route("/anthropic/v1/models", get(claude_models))
        .route("/anthropic/v1/messages", post(claude_messages))
        .route("/claudecode/v1/models", get(claude_models))
        .route("/claudecode/v1/messages", post(claudecode_messages))
        // Gemini
        .route("/gemini/models", get(gemini_models))
        .route("/gemini/models/{model}", post(gemini_generate))
        .route("/gemini/completions", post(gemini_completions))
        // Cursor
        .route("/cursor/v1/models", get(openai_models))
        .route("/cursor/v1/chat/completions", post(cursor_chat))
        .route("/logs", get(list_logs))
        .nest("/manage", manage::routes())
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::authenticate,
        ));

    let api = Router::new().route("/health", get(health_check)).merge(authed);

    Router::new()
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn advertised(state: &AppState, dialect: Dialect) -> Result<Vec<String>, Response> {
    state
        .router
        .advertised_models()
        .await
        .map_err(|e| e.for_dialect(dialect).into_response())
}

async fn openai_models(State(state): State<AppState>) -> Response {
    let models = match advertised(&state, Dialect::Openai).await {
        Ok(models) => models,
        Err(resp) => return resp,
    };
    let created = chrono::Utc::now().timestamp();
    let data: Vec<Value> = models
        .iter()
        .map(|m| {
            json!({
                "id": m,
                "object": "model",
                "created": created,
                "owned_by": "modelbridge",
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": data })).into_response()
}

async fn claude_models(State(state): State<AppState>) -> Response {
    let models = match advertised(&state, Dialect::Claude).await {
        Ok(models) => models,
        Err(resp) => return resp,
    };
    let created_at = chrono::Utc::now().to_rfc3339();
    let data: Vec<Value> = models
        .iter()
        .map(|m| {
            json!({
                "type": "model",
                "id": m,
                "display_name": m,
                "created_at": created_at,
            })
        })
        .collect();

    Json(json!({
        "data": data,
        "has_more": false,
        "first_id": models.first(),
        "last_id": models.last(),
    }))
    .into_response()
}

async fn gemini_models(State(state): State<AppState>) -> Response {
    let models = match advertised(&state, Dialect::Gemini).await {
        Ok(models) => models,
        Err(resp) => return resp,
    };
    let data: Vec<Value> = models
        .iter()
        .map(|m| {
            json!({
                "name": format!("models/{}", m),
                "displayName": m,
                "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
            })
        })
        .collect();

    Json(json!({ "models": data })).into_response()
}

async fn openai_chat(
    State(state): State<AppState>,
    Extension(client): Extension<ClientAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy::execute(&state, ProxyCall::new(Dialect::Openai, client, headers), body).await
}

async fn cursor_chat(
    State(state): State<AppState>,
    Extension(client): Extension<ClientAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy::execute(&state, ProxyCall::new(Dialect::Cursor, client, headers), body).await
}

async fn claude_messages(
    State(state): State<AppState>,
    Extension(client): Extension<ClientAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy::execute(&state, ProxyCall::new(Dialect::Claude, client, headers), body).await
}

/// Claude clients over OpenAI-compatible upstreams, whatever the route says.
async fn claudecode_messages(
    State(state): State<AppState>,
    Extension(client): Extension<ClientAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let call = ProxyCall::new(Dialect::Claude, client, headers).force_target(Dialect::Openai);
    proxy::execute(&state, call, body).await
}

/// `{model}` is `name:action`, e.g. `gemini-1.5-pro:streamGenerateContent`.
pub fn split_gemini_target(target: &str) -> Result<(String, bool), AppError> {
    let (model, action) = match target.rsplit_once(':') {
        Some((model, action)) => (model, action),
        None => (target, "generateContent"),
    };
    let model = model.strip_prefix("models/").unwrap_or(model);
    if model.is_empty() {
        return Err(AppError::BadRequest("model is required".into()));
    }
    match action {
        "generateContent" => Ok((model.to_string(), false)),
        "streamGenerateContent" => Ok((model.to_string(), true)),
        other => Err(AppError::BadRequest(format!(
            "Unsupported Gemini action: {}",
            other
        ))),
    }
}

async fn gemini_generate(
    State(state): State<AppState>,
    Extension(client): Extension<ClientAddr>,
    Path(target): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (model, stream) = match split_gemini_target(&target) {
        Ok(parts) => parts,
        Err(e) => return e.for_dialect(Dialect::Gemini).into_response(),
    };
    let call = ProxyCall::new(Dialect::Gemini, client, headers).path_model(model, stream);
    proxy::execute(&state, call, body).await
}

/// Gemini body with a top-level `model` and optional `stream` flag.
async fn gemini_completions(
    State(state): State<AppState>,
    Extension(client): Extension<ClientAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy::execute(&state, ProxyCall::new(Dialect::Gemini, client, headers), body).await
}

async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Value>, AppError> {
    let page = logs::list_logs(&state.db, &query).await?;
    Ok(Json(serde_json::to_value(page)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::init_pool;
    use crate::db::logs::LogWriter;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn app(config: AppConfig) -> (Router, AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_pool(&dir.path().join("router.db")).await.unwrap();
        let (logs, _handle) = LogWriter::spawn(pool.clone(), 64);
        let state = AppState::new(config.into_shared(), pool, logs)
            .await
            .unwrap();
        (create_router(state.clone()), state, dir)
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn gemini_target_splits_action() {
        assert_eq!(
            split_gemini_target("gemini-1.5-pro:streamGenerateContent").unwrap(),
            ("gemini-1.5-pro".to_string(), true)
        );
        assert_eq!(
            split_gemini_target("models/gemini-1.5-pro:generateContent").unwrap(),
            ("gemini-1.5-pro".to_string(), false)
        );
        assert!(split_gemini_target("gemini-1.5-pro:embedContent").is_err());
    }

    #[tokio::test]
    async fn health_needs_no_key() {
        let config = AppConfig {
            local_api_key: "sk-x".into(),
            ..Default::default()
        };
        let (app, _state, _dir) = app(config).await;
        let resp = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_key_is_rejected_and_counted() {
        let config = AppConfig {
            local_api_key: "sk-x".into(),
            ..Default::default()
        };
        let (app, state, _dir) = app(config).await;
        let resp = app
            .clone()
            .oneshot(
                Request::post("/api/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"model":"gpt-4o","messages":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["type"], "invalid_api_key");
        assert_eq!(state.counters.auth_failures(), 1);

        let resp = app
            .oneshot(
                Request::post("/api/anthropic/v1/messages")
                    .header("x-api-key", "wrong")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["type"], "error");
    }

    #[tokio::test]
    async fn any_matching_key_location_is_accepted() {
        let config = AppConfig {
            local_api_key: "sk-x".into(),
            ..Default::default()
        };
        let (app, state, _dir) = app(config).await;
        let resp = app
            .oneshot(
                Request::get("/api/anthropic/v1/models")
                    .header("authorization", "Bearer some-other-token")
                    .header("x-api-key", "sk-x")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.counters.auth_failures(), 0);
    }

    #[tokio::test]
    async fn unrouted_model_is_404_in_source_shape() {
        let (app, _state, _dir) = app(AppConfig::default()).await;
        let resp = app
            .oneshot(
                Request::post("/api/gemini/models/nope:generateContent")
                    .body(Body::from(r#"{"contents":[{"role":"user","parts":[{"text":"hi"}]}]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"]["status"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn model_lists_follow_dialect_shape() {
        let config = AppConfig {
            redirect_enabled: true,
            redirect_target_model: "gpt-4o".into(),
            ..Default::default()
        };
        let (app, _state, _dir) = app(config).await;

        let resp = app
            .clone()
            .oneshot(Request::get("/api/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"][0]["id"], "proxy_auto");

        let resp = app
            .clone()
            .oneshot(Request::get("/api/gemini/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["models"][0]["name"], "models/proxy_auto");

        let resp = app
            .oneshot(
                Request::get("/api/anthropic/v1/models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["data"][0]["type"], "model");
    }
}
