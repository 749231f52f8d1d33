use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use modelbridge::config::AppConfig;
use modelbridge::db::init_pool;
use modelbridge::db::logs::{list_logs, LogQuery, LogWriter};
use modelbridge::db::models::{RequestLog, RouteInput};
use modelbridge::server::{self, AppState};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

type Seen = Arc<Mutex<Vec<Value>>>;

struct Proxy {
    base: String,
    state: AppState,
    _dir: tempfile::TempDir,
}

impl Proxy {
    async fn start(config: AppConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_pool(&dir.path().join("e2e.db")).await.unwrap();
        let (logs, _writer) = LogWriter::spawn(pool.clone(), 256);
        let state = AppState::new(config.into_shared(), pool, logs).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server::serve(
            listener,
            state.clone(),
            std::future::pending::<()>(),
        ));

        Self {
            base: format!("http://{}/api", addr),
            state,
            _dir: dir,
        }
    }

    async fn route(&self, name: &str, model: &str, api_url: &str, dialect: &str, group: Option<&str>) -> i64 {
        self.state
            .store()
            .upsert(RouteInput {
                name: name.into(),
                model: model.into(),
                api_url: api_url.into(),
                api_key: "sk-upstream".into(),
                group: group.map(str::to_string),
                dialect: dialect.into(),
                enabled: true,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn logs(&self) -> Vec<RequestLog> {
        self.state.logs.flush().await;
        list_logs(&self.state.db, &LogQuery::default())
            .await
            .unwrap()
            .items
    }
}

async fn spawn_upstream(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    format!("http://{}", addr)
}

fn sse(body: &'static str) -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from(body))
        .unwrap()
}

const CLAUDE_STREAM: &str = "event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"model\":\"claude-3-5-sonnet\",\"content\":[],\"usage\":{\"input_tokens\":5,\"output_tokens\":0}}}\n\n\
event: content_block_start\n\
data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n\
event: content_block_stop\n\
data: {\"type\":\"content_block_stop\",\"index\":0}\n\n\
event: message_delta\n\
data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n\
event: message_stop\n\
data: {\"type\":\"message_stop\"}\n\n";

async fn record_claude(State(seen): State<Seen>, Json(body): Json<Value>) -> Response {
    seen.lock().unwrap().push(body);
    sse(CLAUDE_STREAM)
}

#[tokio::test]
async fn openai_client_streams_from_claude_upstream() {
    let seen: Seen = Arc::default();
    let upstream = spawn_upstream(
        Router::new()
            .route("/v1/messages", post(record_claude))
            .with_state(seen.clone()),
    )
    .await;
    let proxy = Proxy::start(AppConfig::default()).await;
    let route_id = proxy
        .route("anthropic", "claude-3-5-sonnet", &upstream, "claude", None)
        .await;

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", proxy.base))
        .json(&json!({
            "model": "claude-3-5-sonnet",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");
    let text = resp.text().await.unwrap();

    let sent = seen.lock().unwrap()[0].clone();
    assert!(sent.get("system").is_none());
    assert_eq!(
        sent["messages"],
        json!([{"role": "user", "content": [{"type": "text", "text": "hi"}]}])
    );

    let chunks: Vec<Value> = text
        .split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();
    let content: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(content, "Hello");
    assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "stop");
    assert!(text.ends_with("data: [DONE]\n\n"));

    let logs = proxy.logs().await;
    assert_eq!(logs.len(), 1);
    assert!(logs[0].success);
    assert!(logs[0].is_stream);
    assert_eq!(logs[0].resolved_route_id, Some(route_id));
    assert_eq!(logs[0].request_tokens, 5);
    assert_eq!(logs[0].response_tokens, 2);
}

async fn record_openai_tool_call(State(seen): State<Seen>, Json(body): Json<Value>) -> Json<Value> {
    seen.lock().unwrap().push(body);
    Json(json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "created": 1,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "c1",
                    "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}
                }]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": {"prompt_tokens": 12, "completion_tokens": 7, "total_tokens": 19}
    }))
}

#[tokio::test]
async fn gemini_tool_call_over_openai_route() {
    let seen: Seen = Arc::default();
    let upstream = spawn_upstream(
        Router::new()
            .route("/v1/chat/completions", post(record_openai_tool_call))
            .with_state(seen.clone()),
    )
    .await;
    let proxy = Proxy::start(AppConfig::default()).await;
    proxy
        .route("gemini-over-openai", "gemini-1.5-pro", &upstream, "openai", None)
        .await;

    let resp = reqwest::Client::new()
        .post(format!(
            "{}/gemini/models/gemini-1.5-pro:generateContent",
            proxy.base
        ))
        .json(&json!({
            "contents": [{"role": "user", "parts": [{"text": "weather?"}]}],
            "tools": [{"functionDeclarations": [{
                "name": "get_weather",
                "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
            }]}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();

    let sent = seen.lock().unwrap()[0].clone();
    assert_eq!(sent["model"], "gemini-1.5-pro");
    assert_eq!(sent["tools"][0]["type"], "function");
    assert_eq!(sent["tools"][0]["function"]["name"], "get_weather");
    assert_eq!(sent["messages"][0]["role"], "user");

    let candidate = &body["candidates"][0];
    assert_eq!(
        candidate["content"]["parts"][0]["functionCall"],
        json!({"name": "get_weather", "args": {"city": "Paris"}})
    );
    assert_eq!(candidate["finishReason"], "STOP");

    let logs = proxy.logs().await;
    assert_eq!(logs[0].source_dialect, "gemini");
    assert_eq!(logs[0].total_tokens, 19);
}

async fn echo_model(State(seen): State<Seen>, Json(body): Json<Value>) -> Json<Value> {
    let model = body["model"].clone();
    seen.lock().unwrap().push(body);
    Json(json!({
        "id": "chatcmpl-2",
        "object": "chat.completion",
        "created": 1,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "ok"},
            "finish_reason": "stop"
        }]
    }))
}

#[tokio::test]
async fn proxy_auto_redirects_to_target_model() {
    let seen: Seen = Arc::default();
    let upstream = spawn_upstream(
        Router::new()
            .route("/v1/chat/completions", post(echo_model))
            .with_state(seen.clone()),
    )
    .await;
    let proxy = Proxy::start(AppConfig {
        redirect_enabled: true,
        redirect_keyword: "proxy_auto".into(),
        redirect_target_model: "gpt-4o".into(),
        ..Default::default()
    })
    .await;
    proxy.route("main", "gpt-4o", &upstream, "openai", None).await;
    let client = reqwest::Client::new();

    let models: Value = client
        .get(format!("{}/models", proxy.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = models["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["gpt-4o", "proxy_auto"]);

    let resp = client
        .post(format!("{}/v1/chat/completions", proxy.base))
        .json(&json!({"model": "proxy_auto", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "ok");
    assert_eq!(seen.lock().unwrap()[0]["model"], "gpt-4o");

    let logs = proxy.logs().await;
    assert_eq!(logs[0].requested_model, "proxy_auto");
    assert_eq!(logs[0].provider_model.as_deref(), Some("gpt-4o"));
}

async fn unavailable() -> Response {
    Response::builder()
        .status(503)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"error":{"message":"overloaded"}}"#))
        .unwrap()
}

#[tokio::test]
async fn falls_back_to_sibling_on_503() {
    let seen: Seen = Arc::default();
    let upstream = spawn_upstream(
        Router::new()
            .route("/bad/v1/chat/completions", post(unavailable))
            .route("/good/v1/chat/completions", post(echo_model))
            .with_state(seen.clone()),
    )
    .await;
    let proxy = Proxy::start(AppConfig {
        log_fallback_attempts: true,
        ..Default::default()
    })
    .await;
    let first = proxy
        .route("bad", "gpt-4o", &format!("{}/bad", upstream), "openai", Some("g"))
        .await;
    let second = proxy
        .route("good", "gpt-4o", &format!("{}/good", upstream), "openai", Some("g"))
        .await;

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", proxy.base))
        .json(&json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(seen.lock().unwrap().len(), 1);

    let logs = proxy.logs().await;
    assert_eq!(logs.len(), 2);
    assert!(logs[0].success);
    assert_eq!(logs[0].resolved_route_id, Some(second));
    assert!(!logs[1].success);
    assert_eq!(logs[1].resolved_route_id, Some(first));
    assert_eq!(logs[1].http_status, 503);

    assert_eq!(proxy.state.health().sample(first).success_rate, Some(0.0));
    assert_eq!(proxy.state.health().sample(second).success_rate, Some(1.0));
}

struct CloseFlag(Arc<AtomicBool>);

impl Drop for CloseFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

async fn endless_stream(State(closed): State<Arc<AtomicBool>>) -> Response {
    let flag = CloseFlag(closed);
    let body = async_stream::stream! {
        let _flag = flag;
        let mut i = 0u32;
        loop {
            let chunk = format!(
                "data: {{\"id\":\"chatcmpl-3\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"c{} \"}},\"finish_reason\":null}}]}}\n\n",
                i
            );
            yield Ok::<Bytes, std::io::Error>(Bytes::from(chunk));
            i += 1;
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    };
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(body))
        .unwrap()
}

#[tokio::test]
async fn client_disconnect_cancels_upstream_and_logs() {
    let closed = Arc::new(AtomicBool::new(false));
    let upstream = spawn_upstream(
        Router::new()
            .route("/v1/chat/completions", post(endless_stream))
            .with_state(closed.clone()),
    )
    .await;
    let proxy = Proxy::start(AppConfig::default()).await;
    proxy.route("main", "gpt-4o", &upstream, "openai", None).await;

    let client = reqwest::Client::new();
    let mut resp = client
        .post(format!("{}/v1/chat/completions", proxy.base))
        .json(&json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}], "stream": true}))
        .send()
        .await
        .unwrap();
    let mut received = String::new();
    while !received.contains("c2 ") {
        let chunk = resp.chunk().await.unwrap().unwrap();
        received.push_str(&String::from_utf8_lossy(&chunk));
    }
    drop(resp);
    drop(client);

    let mut waited = Duration::ZERO;
    while !closed.load(Ordering::SeqCst) && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }
    assert!(closed.load(Ordering::SeqCst), "upstream stream still open");

    let logs = proxy.logs().await;
    assert_eq!(logs.len(), 1);
    assert!(!logs[0].success);
    assert_eq!(logs[0].error_message.as_deref(), Some("cancelled"));
    assert_eq!(logs[0].http_status, 499);
    assert!(logs[0].response_tokens > 0);
}

#[tokio::test]
async fn wrong_key_is_401_without_log_row() {
    let proxy = Proxy::start(AppConfig {
        local_api_key: "sk-x".into(),
        ..Default::default()
    })
    .await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/v1/chat/completions", proxy.base))
        .json(&json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_api_key");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .starts_with("Invalid API key"));
    assert!(proxy.logs().await.is_empty());
    assert_eq!(proxy.state.counters.auth_failures(), 1);

    // an accepted key reaches routing, which does log
    let resp = client
        .post(format!("{}/v1/chat/completions", proxy.base))
        .bearer_auth("sk-x")
        .json(&json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let logs = proxy.logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].http_status, 404);
}
