pub mod auth;
pub mod client;
pub mod config;
pub mod conversation;
pub mod decoder;
pub mod models;
pub mod persistence;
pub mod proxy_config;
pub mod upstream;
pub mod web;

#[cfg(test)]
pub(crate) mod test_support;

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::AuthGate;
use crate::upstream::UpstreamProvider;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Method Not Allowed")]
    MethodNotAllowed,

    #[error("Bad Request")]
    BadRequest,

    #[error("Upstream provider unavailable")]
    UpstreamUnavailable,

    #[error("Internal server error")]
    InternalServerError,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::BadRequest => StatusCode::BAD_REQUEST,
            ApiError::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ApiError::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                status: status.as_u16(),
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Shared state of the proxy server
pub struct AppState {
    pub auth_gate: Arc<dyn AuthGate>,
    pub upstream: Arc<dyn UpstreamProvider>,
    /// Model requested upstream
    pub model: String,
}

impl AppState {
    pub fn new(
        auth_gate: Arc<dyn AuthGate>,
        upstream: Arc<dyn UpstreamProvider>,
        model: String,
    ) -> Self {
        Self {
            auth_gate,
            upstream,
            model,
        }
    }
}
