//! Decoder for the upstream server-sent-event stream
//!
//! Turns raw transport chunks into [`DeltaEvent`]s. Records are
//! newline-delimited and may be split across reads at any byte, so the
//! decoder buffers bytes (not text) until a full line is available.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::fmt::Display;
use tracing::{trace, warn};

pub const DATA_PREFIX: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";

/// Initial capacity of the line buffer
const LINE_BUFFER_CAPACITY: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaEvent {
    /// Incremental fragment of assistant text
    Text(String),
    /// Upstream has no more deltas
    Terminal,
    /// A data record that could not be parsed. Safe to ignore.
    Malformed,
}

impl DeltaEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeltaEvent::Terminal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Stream ended without a terminal record")]
    Unterminated,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Incremental SSE record decoder.
///
/// Feed transport chunks with [`SseDecoder::push`] and call
/// [`SseDecoder::finish`] when the transport ends. Once the terminal sentinel
/// has been seen any further input is ignored.
pub struct SseDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(LINE_BUFFER_CAPACITY),
            finished: false,
        }
    }

    /// Whether the terminal sentinel has been decoded
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Append a chunk and decode every complete record it closes.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<DeltaEvent> {
        if self.finished {
            return Vec::new();
        }

        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = decode_record(&line) {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    self.finish_early();
                    break;
                }
            }
        }

        events
    }

    /// Signal end of transport.
    ///
    /// A trailing record without a newline is still decoded. If no terminal
    /// sentinel was ever seen the stream is reported as unterminated.
    pub fn finish(&mut self) -> Result<Vec<DeltaEvent>, DecodeError> {
        if self.finished {
            return Ok(Vec::new());
        }

        let rest = std::mem::take(&mut self.buffer);
        let events: Vec<DeltaEvent> = decode_record(&rest).into_iter().collect();

        if events.iter().any(DeltaEvent::is_terminal) {
            self.finished = true;
            Ok(events)
        } else {
            Err(DecodeError::Unterminated)
        }
    }

    fn finish_early(&mut self) {
        self.finished = true;
        if !self.buffer.is_empty() {
            trace!(
                "Decoder: discarding {} bytes after terminal record",
                self.buffer.len()
            );
        }
        self.buffer.clear();
    }
}

/// Decode a single record line. Returns `None` for lines that carry no event
/// (blank lines, comments/keepalives, non-data fields, data without text).
fn decode_record(raw: &[u8]) -> Option<DeltaEvent> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\n', '\r']);

    if line.trim().is_empty() || line.starts_with(':') {
        return None;
    }

    let payload = line.strip_prefix(DATA_PREFIX)?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload).trim();

    if payload == DONE_SENTINEL {
        trace!("Decoder: received {}", DONE_SENTINEL);
        return Some(DeltaEvent::Terminal);
    }

    match serde_json::from_str::<Value>(payload) {
        Ok(json) => {
            if let Some(error) = json.get("error") {
                warn!("Decoder: upstream sent an error record: {}", error);
                return Some(DeltaEvent::Malformed);
            }
            delta_text(&json).map(DeltaEvent::Text)
        }
        Err(e) => {
            trace!("Decoder: dropping unparseable data record: {:?}", e);
            Some(DeltaEvent::Malformed)
        }
    }
}

/// Extract `choices[0].delta.content` from a streaming chunk
pub fn delta_text(json: &Value) -> Option<String> {
    json["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Extract `choices[0].message.content` from a non-streaming completion
pub fn full_completion_text(json: &Value) -> Option<String> {
    json["choices"][0]["message"]["content"]
        .as_str()
        .map(ToString::to_string)
}

/// Lazily decode a transport byte stream.
///
/// The returned stream is forward-only: it yields events until the terminal
/// event, and ends with `Err(DecodeError::Unterminated)` if the transport
/// closes first or `Err(DecodeError::Transport)` if it fails.
pub fn decode_stream<S, E>(
    transport: S,
) -> impl Stream<Item = Result<DeltaEvent, DecodeError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    async_stream::stream! {
        let mut transport = Box::pin(transport);
        let mut decoder = SseDecoder::new();

        while let Some(chunk) = transport.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in decoder.push(&bytes) {
                        yield Ok(event);
                    }
                    if decoder.is_finished() {
                        return;
                    }
                }
                Err(e) => {
                    yield Err(DecodeError::Transport(e.to_string()));
                    return;
                }
            }
        }

        match decoder.finish() {
            Ok(events) => {
                for event in events {
                    yield Ok(event);
                }
            }
            Err(e) => yield Err(e),
        }
    }
}
