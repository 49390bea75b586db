//! Upstream chat completion provider used by the proxy endpoint

use crate::models::ChatMessage;
use crate::proxy_config::ProxyConfig;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use hyper::body::to_bytes;
use hyper::client::HttpConnector;
use hyper::{Body as HyperBody, Client, Request};
use hyper_tls::HttpsConnector;
use serde::Serialize;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, trace};

/// Upstream response body, chunk by chunk as it arrives
pub type UpstreamBody = BoxStream<'static, Result<Bytes, UpstreamError>>;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Failed to build upstream request: {0}")]
    Request(String),

    #[error("Upstream connection failed: {0}")]
    Connect(String),

    #[error("Upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Upstream stream error: {0}")]
    Stream(String),

    #[error("No upstream chunk within {0:?}")]
    ChunkTimeout(Duration),
}

/// Chat completion request as sent upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    /// Open the request. Resolves once upstream has answered with a success
    /// status; the body is then streamed lazily.
    async fn open_stream(&self, request: UpstreamRequest) -> Result<UpstreamBody, UpstreamError>;
}

pub struct HyperUpstream {
    client: Client<HttpsConnector<HttpConnector>, HyperBody>,
    config: ProxyConfig,
    request_timeout: Duration,
    chunk_timeout: Duration,
}

impl HyperUpstream {
    pub fn new(config: ProxyConfig, request_timeout: Duration, chunk_timeout: Duration) -> Self {
        let https = HttpsConnector::new();
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build::<_, HyperBody>(https);

        Self {
            client,
            config,
            request_timeout,
            chunk_timeout,
        }
    }
}

#[async_trait]
impl UpstreamProvider for HyperUpstream {
    async fn open_stream(&self, request: UpstreamRequest) -> Result<UpstreamBody, UpstreamError> {
        debug!("Making request to {}", self.config.provider_name);

        let body_json = serde_json::to_string(&request)
            .map_err(|e| UpstreamError::Request(format!("{:?}", e)))?;

        let mut req = Request::builder()
            .method("POST")
            .uri(self.config.completions_url())
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream");

        if let Some(api_key) = &self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        trace!(
            "Sending to provider={} url={} body_len={}",
            self.config.provider_name,
            self.config.completions_url(),
            body_json.len()
        );

        let req = req
            .body(HyperBody::from(body_json))
            .map_err(|e| UpstreamError::Request(format!("{:?}", e)))?;

        let response = match timeout(self.request_timeout, self.client.request(req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(
                    "Provider {} connection failed: {:?}",
                    self.config.provider_name, e
                );
                return Err(UpstreamError::Connect(e.to_string()));
            }
            Err(_) => {
                error!(
                    "Provider {} timed out after {:?}",
                    self.config.provider_name, self.request_timeout
                );
                return Err(UpstreamError::Timeout(self.request_timeout));
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            error!(
                "Provider {} returned non-success status: {}",
                self.config.provider_name, status
            );
            let body = match to_bytes(response.into_body()).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
                Err(_) => "<unreadable>".to_string(),
            };
            error!("Response body: {}", body);
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let chunk_timeout = self.chunk_timeout;
        let mut body = Box::pin(response.into_body());
        let stream = async_stream::stream! {
            loop {
                match timeout(chunk_timeout, body.next()).await {
                    Ok(Some(Ok(bytes))) => {
                        trace!("Upstream chunk: {} bytes", bytes.len());
                        yield Ok(bytes);
                    }
                    Ok(Some(Err(e))) => {
                        error!("Upstream stream error: {:?}", e);
                        yield Err(UpstreamError::Stream(e.to_string()));
                        break;
                    }
                    Ok(None) => {
                        debug!("Upstream stream finished");
                        break;
                    }
                    Err(_) => {
                        error!("Stream chunk timeout after {:?}", chunk_timeout);
                        yield Err(UpstreamError::ChunkTimeout(chunk_timeout));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serializes_with_stream_flag() {
        let request = UpstreamRequest {
            model: "google/gemma-7b-it".to_string(),
            messages: vec![ChatMessage::user("Hi")],
            stream: true,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "model": "google/gemma-7b-it",
                "messages": [{"role": "user", "content": "Hi"}],
                "stream": true
            })
        );
    }

    #[tokio::test]
    async fn test_connection_failure_is_reported() {
        // Nothing listens on port 9 of localhost.
        let upstream = HyperUpstream::new(
            ProxyConfig::new("http://127.0.0.1:9".to_string(), None, "m".to_string()),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let result = upstream
            .open_stream(UpstreamRequest {
                model: "m".to_string(),
                messages: vec![ChatMessage::user("Hi")],
                stream: true,
            })
            .await;
        assert!(matches!(
            result,
            Err(UpstreamError::Connect(_)) | Err(UpstreamError::Timeout(_))
        ));
    }
}
