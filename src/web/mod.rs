pub mod bearer_auth;
pub mod stream_chat;

use crate::AppState;
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Full HTTP surface of the proxy server
pub fn router(app_state: Arc<AppState>) -> Router<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .merge(stream_chat::router(app_state))
        .layer(cors)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}
