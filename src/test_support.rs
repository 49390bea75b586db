//! Fakes shared by the unit tests

use crate::auth::{AuthError, AuthGate, Principal, Session};
use crate::client::{Completion, CompletionSource, TransportError};
use crate::models::ChatMessage;
use crate::upstream::{UpstreamBody, UpstreamError, UpstreamProvider, UpstreamRequest};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const VALID_TOKEN: &str = "valid-token";
pub const TEST_USER: &str = "user-1";

pub const SSE_DONE: &str = "data: [DONE]\n\n";

/// One streaming chunk carrying `text` as its delta
pub fn sse_delta(text: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({"choices": [{"delta": {"content": text}}]})
    )
}

/// Accepts [`VALID_TOKEN`] only
pub struct FakeAuthGate;

#[async_trait]
impl AuthGate for FakeAuthGate {
    async fn verify(&self, credential: &str) -> Result<Principal, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        if credential != VALID_TOKEN {
            return Err(AuthError::InvalidCredential);
        }
        Ok(Principal {
            user_id: TEST_USER.to_string(),
        })
    }
}

/// Upstream provider replaying fixed chunks and recording every request
pub struct FakeUpstream {
    chunks: Option<Vec<Bytes>>,
    calls: AtomicUsize,
    requests: StdMutex<Vec<UpstreamRequest>>,
}

impl FakeUpstream {
    pub fn with_chunks(chunks: Vec<&str>) -> Self {
        Self {
            chunks: Some(
                chunks
                    .into_iter()
                    .map(|c| Bytes::from(c.to_string()))
                    .collect(),
            ),
            calls: AtomicUsize::new(0),
            requests: StdMutex::new(Vec::new()),
        }
    }

    /// Fails every request before any byte is sent
    pub fn failing() -> Self {
        Self {
            chunks: None,
            calls: AtomicUsize::new(0),
            requests: StdMutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamProvider for FakeUpstream {
    async fn open_stream(&self, request: UpstreamRequest) -> Result<UpstreamBody, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        match &self.chunks {
            Some(chunks) => Ok(stream::iter(chunks.clone().into_iter().map(Ok)).boxed()),
            None => Err(UpstreamError::Connect("connection refused".to_string())),
        }
    }
}

/// What a [`ScriptedCompletions`] answers with on one call
pub enum Script {
    /// Yield these items, then close the transport
    Chunks(Vec<Result<Bytes, TransportError>>),
    /// Yield these chunks, then never send anything again
    Hang(Vec<Bytes>),
    /// Never answer the request at all
    Stall,
    /// Forward chunks as the test sends them
    Channel(mpsc::UnboundedReceiver<Bytes>),
    Fail(TransportError),
    /// Non-streaming JSON reply
    Complete(String),
}

/// Completion source answering each call with the next script
pub struct ScriptedCompletions {
    scripts: Mutex<VecDeque<Script>>,
    histories: Mutex<Vec<Vec<ChatMessage>>>,
    calls: AtomicUsize,
}

impl ScriptedCompletions {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            histories: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Histories received, one per call
    pub async fn histories(&self) -> Vec<Vec<ChatMessage>> {
        self.histories.lock().await.clone()
    }
}

#[async_trait]
impl CompletionSource for ScriptedCompletions {
    async fn open(
        &self,
        _session: &Session,
        history: Vec<ChatMessage>,
    ) -> Result<Completion, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.histories.lock().await.push(history);

        let script = self
            .scripts
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| {
                Script::Fail(TransportError::Request("no script left".to_string()))
            });

        match script {
            Script::Chunks(items) => Ok(Completion::Streaming(stream::iter(items).boxed())),
            Script::Hang(chunks) => Ok(Completion::Streaming(
                stream::iter(chunks.into_iter().map(Ok))
                    .chain(stream::pending())
                    .boxed(),
            )),
            Script::Stall => futures::future::pending().await,
            Script::Channel(rx) => Ok(Completion::Streaming(
                UnboundedReceiverStream::new(rx).map(Ok).boxed(),
            )),
            Script::Fail(e) => Err(e),
            Script::Complete(text) => Ok(Completion::Complete(text)),
        }
    }
}
