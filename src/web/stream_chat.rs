//! Authenticated pass-through of a streaming chat completion

use crate::auth::Principal;
use crate::models::ChatRequest;
use crate::upstream::UpstreamRequest;
use crate::web::bearer_auth::require_bearer;
use crate::{ApiError, AppState};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    middleware::from_fn_with_state,
    response::Response,
    routing::post,
    Extension, Router,
};
use std::sync::Arc;
use tracing::{debug, error};

pub const STREAM_CHAT_PATH: &str = "/stream-chat";

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route(
            STREAM_CHAT_PATH,
            post(stream_chat)
                .fallback(method_not_allowed)
                .route_layer(from_fn_with_state(app_state.clone(), require_bearer)),
        )
        .with_state(app_state)
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

async fn stream_chat(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    body: Bytes,
) -> Result<Response, ApiError> {
    debug!("Entering stream_chat function for {}", principal.user_id);

    let request: ChatRequest = serde_json::from_slice(&body).map_err(|e| {
        error!("Invalid chat request body: {:?}", e);
        ApiError::BadRequest
    })?;

    if request.messages.is_empty() {
        error!("Chat request without messages");
        return Err(ApiError::BadRequest);
    }

    let upstream_request = UpstreamRequest {
        model: state.model.clone(),
        messages: request.messages,
        stream: true,
    };

    // Setup failures surface as one error response, never a partial stream.
    let upstream_body = state
        .upstream
        .open_stream(upstream_request)
        .await
        .map_err(|e| {
            error!("Failed to open upstream stream: {}", e);
            ApiError::UpstreamUnavailable
        })?;

    debug!("Exiting stream_chat function (streaming)");
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(upstream_body))
        .map_err(|e| {
            error!("Failed to build streaming response: {:?}", e);
            ApiError::InternalServerError
        })
}
