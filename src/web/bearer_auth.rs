use crate::{ApiError, AppState};
use axum::{
    body::Body,
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

/// Reject the request unless it carries a bearer credential the auth gate
/// accepts. On success the [`Principal`](crate::auth::Principal) is inserted
/// into the request extensions.
pub async fn require_bearer(
    State(data): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let credential = match req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|auth_header| auth_header.to_str().ok())
        .and_then(|auth_value| auth_value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
    {
        Some(token) if !token.is_empty() => token,
        _ => {
            debug!("Request without bearer credential");
            return ApiError::Unauthorized.into_response();
        }
    };

    let principal = match data.auth_gate.verify(&credential).await {
        Ok(principal) => principal,
        Err(e) => {
            debug!("Bearer credential rejected: {}", e);
            return ApiError::Unauthorized.into_response();
        }
    };

    req.extensions_mut().insert(principal);
    next.run(req).await
}
