use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use relaychat::create_router;
use relaychat_core::{Relay, TextGenerator};

struct FakeGenerator {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("quota exceeded for project 1234"));
        }
        Ok(format!("```{}```", prompt))
    }
}

fn app(fail: bool) -> (Router, Arc<FakeGenerator>) {
    let generator = Arc::new(FakeGenerator {
        calls: AtomicUsize::new(0),
        fail,
    });
    (create_router(Relay::new(generator.clone())), generator)
}

async fn call(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_generate_success() {
    let (app, generator) = app(false);
    let (status, body) = call(app, "POST", "/api/generate", r#"{"prompt": "2+2"}"#).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "response": "```2+2```" }));
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_wrong_method_is_405() {
    let (app, generator) = app(false);
    let (status, body) = call(app, "GET", "/api/generate", "").await;

    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body, json!({ "error": "Method not allowed" }));
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_405_advertises_post() {
    let (app, _) = app(false);
    let request = Request::builder()
        .method("PUT")
        .uri("/api/generate")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.headers().get(header::ALLOW).unwrap(), "POST");
}

#[tokio::test]
async fn test_missing_prompt_is_400() {
    for body in ["{}", r#"{"prompt": ""}"#, r#"{"prompt": "   "}"#, "not json"] {
        let (app, generator) = app(false);
        let (status, response) = call(app, "POST", "/api/generate", body).await;

        assert_eq!(status, StatusCode::BAD_REQUEST, "body {}", body);
        assert_eq!(response, json!({ "error": "Prompt is required" }));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn test_downstream_failure_is_500_without_detail() {
    let (app, generator) = app(true);
    let (status, body) = call(app, "POST", "/api/generate", r#"{"prompt": "hi"}"#).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({ "error": "Failed to generate content" }));
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_health() {
    let (app, _) = app(false);
    let (status, body) = call(app, "GET", "/health", "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}
