use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use relaychat_core::{ErrorBody, Relay, RelayError};

pub struct AppState {
    pub relay: Relay,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Create the API router
pub fn create_router(relay: Relay) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Every method is routed here so the relay can answer 405 itself
        .route("/api/generate", any(generate))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(AppState { relay }))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn generate(State(state): State<Arc<AppState>>, method: Method, body: Bytes) -> Response {
    match state.relay.dispatch(method.as_str(), &body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &RelayError) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = Json(ErrorBody::new(err.public_message()));

    if matches!(err, RelayError::MethodNotAllowed) {
        return (status, [(header::ALLOW, "POST")], body).into_response();
    }
    (status, body).into_response()
}
