use crate::client::TransportError;
use crate::models::{Message, MessageId};
use std::fmt;

/// Why a streaming slot was discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Explicit stop by the caller
    Cancelled,
    /// Another conversation was selected mid-stream
    Superseded,
    Transport(TransportError),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Cancelled => f.write_str("cancelled"),
            AbortReason::Superseded => f.write_str("superseded"),
            AbortReason::Transport(e) => write!(f, "{}", e),
        }
    }
}

/// Notifications for a view of the conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    /// Messages were added, removed or replaced; re-read the timeline
    TimelineChanged,
    StreamStarted(MessageId),
    Delta { id: MessageId, fragment: String },
    StreamFinalized(Message),
    StreamAborted { id: MessageId, reason: AbortReason },
    /// User-visible failure report
    Notice(String),
}
