//! Client-side transport to the proxy endpoint

use crate::auth::Session;
use crate::decoder::full_completion_text;
use crate::models::{ChatMessage, ChatRequest};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw response body of a streaming completion
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Credential rejected by the proxy")]
    Unauthorized,

    #[error("Proxy returned status {0}")]
    Status(u16),

    #[error("Stream failed: {0}")]
    Stream(String),

    #[error("Stream ended without a terminal record")]
    Unterminated,

    #[error("No data received for {0:?}")]
    IdleTimeout(Duration),
}

/// What the proxy answered with
pub enum Completion {
    /// Incremental event stream
    Streaming(ByteStream),
    /// A single JSON completion, already reduced to its text
    Complete(String),
}

#[async_trait]
pub trait CompletionSource: Send + Sync {
    async fn open(
        &self,
        session: &Session,
        history: Vec<ChatMessage>,
    ) -> Result<Completion, TransportError>;
}

/// Posts the history to the proxy endpoint over HTTP
pub struct HttpCompletionSource {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpCompletionSource {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, TransportError> {
        // No overall timeout: streams are long-lived and guarded by the idle timeout.
        let http = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .user_agent("streamchat")
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl CompletionSource for HttpCompletionSource {
    async fn open(
        &self,
        session: &Session,
        history: Vec<ChatMessage>,
    ) -> Result<Completion, TransportError> {
        debug!(
            "Requesting completion for {} with {} messages",
            session.principal.user_id,
            history.len()
        );

        let response = self
            .http
            .post(&self.endpoint)
            .header(AUTHORIZATION, session.bearer_header())
            .json(&ChatRequest { messages: history })
            .send()
            .await
            .map_err(|e| {
                error!("Completion request failed: {:?}", e);
                TransportError::Request(e.to_string())
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized);
        }
        if !status.is_success() {
            error!("Proxy returned non-success status: {}", status);
            return Err(TransportError::Status(status.as_u16()));
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));

        if is_json {
            let json: Value = response
                .json()
                .await
                .map_err(|e| TransportError::Stream(e.to_string()))?;
            return full_completion_text(&json)
                .map(Completion::Complete)
                .ok_or_else(|| TransportError::Stream("Completion without content".to_string()));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::Stream(e.to_string())));
        Ok(Completion::Streaming(Box::pin(stream)))
    }
}
