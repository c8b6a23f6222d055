use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use relaychat_core::{
    Config, GeminiClient, Relay, RelayClient, RelayError, RenderedView, FETCH_ERROR_PLACEHOLDER,
};

#[derive(Clone, Default)]
struct MockGemini {
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<(String, String, Value)>>>,
}

async fn generate_content(
    State(mock): State<MockGemini>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    mock.calls.fetch_add(1, Ordering::SeqCst);
    let key = headers
        .get("x-goog-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    mock.seen.lock().unwrap().push((model_action, key.clone(), body.clone()));

    if key != "test-key" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "code": 400, "message": "API key not valid", "status": "INVALID_ARGUMENT" } })),
        );
    }

    let prompt = body["contents"][0]["parts"][0]["text"].as_str().unwrap_or_default();
    (
        StatusCode::OK,
        Json(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": "```" }, { "text": prompt }, { "text": "```" }] },
                "finishReason": "STOP"
            }]
        })),
    )
}

async fn spawn_mock() -> (String, MockGemini) {
    let mock = MockGemini::default();
    let app = Router::new()
        .route("/v1beta/models/:model_action", post(generate_content))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), mock)
}

#[tokio::test]
async fn test_gemini_request_shape() {
    let (url, mock) = spawn_mock().await;
    let client = GeminiClient::new("test-key").with_base_url(&url);

    let text = client.query("2+2").await.unwrap();
    assert_eq!(text, "```2+2```");

    let seen = mock.seen.lock().unwrap();
    let (model_action, key, body) = &seen[0];
    assert_eq!(model_action, "gemini-1.5-flash:generateContent");
    assert_eq!(key, "test-key");
    assert_eq!(body, &json!({ "contents": [{ "parts": [{ "text": "2+2" }] }] }));
}

#[tokio::test]
async fn test_relay_end_to_end_renders_output() {
    let (url, mock) = spawn_mock().await;
    let relay = Relay::new(Arc::new(GeminiClient::new("test-key").with_base_url(&url)));

    let reply = relay.send("2+2").await.unwrap();
    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);

    match relaychat_core::render(&reply) {
        RenderedView::Code { execution, .. } => assert_eq!(execution.lines(), vec!["Output: 4"]),
        other => panic!("expected code view, got {:?}", other),
    }
}

#[tokio::test]
async fn test_relay_rejects_blank_prompt_without_calling_out() {
    let (url, mock) = spawn_mock().await;
    let relay = Relay::new(Arc::new(GeminiClient::new("test-key").with_base_url(&url)));

    assert_eq!(relay.send("  ").await, Err(RelayError::InvalidInput));
    assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_upstream_error_becomes_service_error() {
    let (url, mock) = spawn_mock().await;
    let relay = Relay::new(Arc::new(GeminiClient::new("wrong-key").with_base_url(&url)));

    match relay.send("hello").await {
        Err(RelayError::Service(detail)) => assert!(detail.contains("API key not valid")),
        other => panic!("expected service error, got {:?}", other),
    }
    // No retry
    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_client_from_config_uses_model_and_base_url() {
    let (url, mock) = spawn_mock().await;
    let config = Config {
        gemini_api_key: Some("test-key".to_string()),
        model: "gemini-test".to_string(),
        base_url: url,
        timeout_secs: 5,
        ..Config::default()
    };
    let client = GeminiClient::from_config(&config).unwrap();
    client.query("hi").await.unwrap();

    let seen = mock.seen.lock().unwrap();
    assert_eq!(seen[0].0, "gemini-test:generateContent");
}

async fn fake_relay_server(status: StatusCode, body: Value) -> String {
    let app = Router::new().route(
        "/api/generate",
        post(move || {
            let body = body.clone();
            async move { (status, Json(body)) }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_relay_client_reads_response() {
    let url = fake_relay_server(StatusCode::OK, json!({ "response": "hello there" })).await;
    let client = RelayClient::new(&url);
    assert_eq!(client.generate("hi").await.unwrap(), "hello there");
    assert_eq!(client.reply_for("hi").await, "hello there");
}

#[tokio::test]
async fn test_relay_client_error_gives_placeholder() {
    let url = fake_relay_server(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "error": "Failed to generate content" }),
    )
    .await;
    let client = RelayClient::with_timeout(&url, Some(Duration::from_secs(5))).unwrap();

    let err = client.generate("hi").await.unwrap_err();
    assert!(err.to_string().contains("Failed to generate content"));
    assert_eq!(client.reply_for("hi").await, FETCH_ERROR_PLACEHOLDER);
}
