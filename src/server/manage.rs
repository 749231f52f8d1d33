//! Operator API: routes, redirect, health and usage statistics.

use super::AppState;
use crate::config::{AppConfig, RedirectConfig};
use crate::db::models::{Route, RouteInput};
use crate::error::AppError;
use crate::routing::HealthReport;
use crate::telemetry::{self, compaction};
use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/routes", get(list_routes).post(save_route))
        .route("/routes/{id}", axum::routing::delete(delete_route))
        .route("/routes/{id}/toggle", post(toggle_route))
        .route("/routes/{id}/health", get(route_health))
        .route("/config", get(get_config))
        .route("/redirect", get(get_redirect).put(set_redirect))
        .route("/stats/summary", get(summary))
        .route("/stats/daily", get(daily))
        .route("/stats/hourly", get(hourly))
        .route("/stats/seconds", get(seconds))
        .route("/stats/models", get(models))
        .route("/stats/compact", post(compact_now))
}

#[derive(Debug, Default, Deserialize)]
pub struct GroupQuery {
    pub group: Option<String>,
}

async fn list_routes(
    State(state): State<AppState>,
    Query(query): Query<GroupQuery>,
) -> Result<Json<Vec<Route>>, AppError> {
    let routes = state.store().list(query.group.as_deref()).await?;
    Ok(Json(routes.iter().map(Route::masked).collect()))
}

async fn save_route(
    State(state): State<AppState>,
    Json(input): Json<RouteInput>,
) -> Result<Json<Route>, AppError> {
    let id = state.store().upsert(input).await?;
    Ok(Json(state.store().get(id).await?.masked()))
}

#[derive(Debug, Deserialize)]
pub struct ToggleBody {
    pub enabled: bool,
}

async fn toggle_route(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<ToggleBody>,
) -> Result<Json<Route>, AppError> {
    state.store().toggle(id, body.enabled).await?;
    Ok(Json(state.store().get(id).await?.masked()))
}

async fn delete_route(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    state.store().delete(id).await?;
    state.health().forget(id);
    Ok(Json(json!({ "deleted": id })))
}

async fn route_health(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<HealthReport>, AppError> {
    state.store().get(id).await?;
    Ok(Json(state.health().sample(id)))
}

/// Effective configuration, local key masked.
async fn get_config(State(state): State<AppState>) -> Json<AppConfig> {
    let mut cfg = state.config.read().await.clone();
    if !cfg.local_api_key.is_empty() {
        cfg.local_api_key = "****".to_string();
    }
    Json(cfg)
}

async fn get_redirect(State(state): State<AppState>) -> Json<RedirectConfig> {
    Json(state.config.read().await.redirect())
}

async fn set_redirect(
    State(state): State<AppState>,
    Json(redirect): Json<RedirectConfig>,
) -> Result<Json<RedirectConfig>, AppError> {
    if redirect.enabled && redirect.keyword.trim().is_empty() {
        return Err(AppError::Validation("redirect keyword must not be empty".into()));
    }
    if let Some(id) = redirect.target_route_id {
        state.store().get(id).await?;
    }

    let mut cfg = state.config.write().await;
    cfg.set_redirect(redirect);
    log::info!(
        "Redirect {} ({} -> {})",
        if cfg.redirect_enabled { "enabled" } else { "disabled" },
        cfg.redirect_keyword,
        cfg.redirect_target_model
    );
    Ok(Json(cfg.redirect()))
}

async fn summary(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let totals = telemetry::totals(&state.db, chrono::Utc::now()).await?;
    Ok(Json(json!({
        "totals": totals,
        "auth_failures": state.counters.auth_failures(),
        "dropped_logs": state.logs.dropped(),
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct DaysQuery {
    pub days: Option<u32>,
}

async fn daily(
    State(state): State<AppState>,
    Query(query): Query<DaysQuery>,
) -> Result<Json<Value>, AppError> {
    let series =
        telemetry::daily_series(&state.db, query.days.unwrap_or(7), chrono::Utc::now()).await?;
    Ok(Json(json!({ "items": series })))
}

#[derive(Debug, Default, Deserialize)]
pub struct HoursQuery {
    pub hours: Option<u32>,
}

/// Today's hours by default; `?hours=N` for a rolling window.
async fn hourly(
    State(state): State<AppState>,
    Query(query): Query<HoursQuery>,
) -> Result<Json<Value>, AppError> {
    let now = chrono::Utc::now();
    let series = match query.hours {
        Some(hours) => telemetry::hourly_window(&state.db, hours, now).await?,
        None => telemetry::hourly_series(&state.db, now).await?,
    };
    Ok(Json(json!({ "items": series })))
}

#[derive(Debug, Default, Deserialize)]
pub struct MinutesQuery {
    pub minutes: Option<u32>,
}

async fn seconds(
    State(state): State<AppState>,
    Query(query): Query<MinutesQuery>,
) -> Result<Json<Value>, AppError> {
    let series =
        telemetry::second_series(&state.db, query.minutes.unwrap_or(5), chrono::Utc::now())
            .await?;
    Ok(Json(json!({ "items": series })))
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<u32>,
}

async fn models(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, AppError> {
    let ranked = telemetry::top_models(&state.db, query.limit.unwrap_or(10)).await?;
    Ok(Json(json!({ "items": ranked })))
}

async fn compact_now(
    State(state): State<AppState>,
) -> Result<Json<compaction::CompactionReport>, AppError> {
    let retention = state.config.read().await.traces_retention_days;
    state.logs.flush().await;
    Ok(Json(
        compaction::compact(&state.db, retention, chrono::Utc::now()).await?,
    ))
}

#[cfg(test)]
mod tests {
    use crate::config::AppConfig;
    use crate::db::init_pool;
    use crate::db::logs::LogWriter;
    use crate::server::router::create_router;
    use crate::server::AppState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn app() -> (Router, AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_pool(&dir.path().join("manage.db")).await.unwrap();
        let (logs, _handle) = LogWriter::spawn(pool.clone(), 64);
        let state = AppState::new(AppConfig::default().into_shared(), pool, logs)
            .await
            .unwrap();
        (create_router(state.clone()), state, dir)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn route_lifecycle_masks_keys() {
        let (app, state, _dir) = app().await;
        let (status, created) = call(
            &app,
            "POST",
            "/api/manage/routes",
            Some(json!({
                "name": "main",
                "model": "gpt-4o",
                "api_url": "https://api.openai.com/v1/",
                "api_key": "sk-secret-value",
                "group": "g",
                "dialect": "openai"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["api_key"], "sk-s****");
        assert_eq!(created["group"], "g");
        let id = created["id"].as_i64().unwrap();

        let (_, listed) = call(&app, "GET", "/api/manage/routes?group=g", None).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (_, toggled) = call(
            &app,
            "POST",
            &format!("/api/manage/routes/{}/toggle", id),
            Some(json!({ "enabled": false })),
        )
        .await;
        assert_eq!(toggled["enabled"], false);

        state.health().record(id, false);
        let (_, health) = call(&app, "GET", &format!("/api/manage/routes/{}/health", id), None).await;
        assert_eq!(health["success_rate"], 0.0);

        let (status, _) = call(&app, "DELETE", &format!("/api/manage/routes/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "GET", &format!("/api/manage/routes/{}/health", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn redirect_update_is_visible_to_routing() {
        let (app, state, _dir) = app().await;
        let (status, body) = call(
            &app,
            "PUT",
            "/api/manage/redirect",
            Some(json!({
                "enabled": true,
                "keyword": "proxy_auto",
                "target_model": "gpt-4o",
                "target_route_id": null
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["target_model"], "gpt-4o");
        assert!(state.config.read().await.redirect_enabled);

        let (status, _) = call(
            &app,
            "PUT",
            "/api/manage/redirect",
            Some(json!({ "enabled": true, "keyword": " ", "target_model": "x", "target_route_id": null })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, cfg) = call(&app, "GET", "/api/manage/config", None).await;
        assert_eq!(cfg["redirect_target_model"], "gpt-4o");
        assert_eq!(cfg["language"], "en");
    }

    #[tokio::test]
    async fn stats_endpoints_answer_on_empty_db() {
        let (app, _state, _dir) = app().await;
        let (status, summary) = call(&app, "GET", "/api/manage/stats/summary", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["totals"]["all_time"]["request_count"], 0);
        assert_eq!(summary["auth_failures"], 0);

        let (_, daily) = call(&app, "GET", "/api/manage/stats/daily?days=3", None).await;
        assert_eq!(daily["items"].as_array().unwrap().len(), 3);

        let (_, hourly) = call(&app, "GET", "/api/manage/stats/hourly?hours=48", None).await;
        assert_eq!(hourly["items"].as_array().unwrap().len(), 48);

        let (status, report) = call(&app, "POST", "/api/manage/stats/compact", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["compacted_rows"], 0);
    }
}
