use crate::auth::AuthError;
use crate::client::TransportError;
use crate::models::MessageId;
use crate::persistence::PersistenceError;

/// Rejected operations. State is unchanged when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("No conversation selected")]
    NoConversation,

    #[error("A reply is already streaming")]
    StreamActive,

    #[error("Conversation is waiting for the store")]
    Busy,

    #[error("Only the latest user message can be edited")]
    NotLatestUserMessage,

    #[error("No active stream")]
    NoActiveStream,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// The user message was rolled back; `text` is handed back for resubmission.
    #[error("Failed to save message: {source}")]
    UserMessageNotSaved {
        text: String,
        #[source]
        source: PersistenceError,
    },

    /// The reply stays visible locally, marked unsaved.
    #[error("Reply could not be saved: {source}")]
    AssistantMessageNotSaved {
        message_id: MessageId,
        #[source]
        source: PersistenceError,
    },

    #[error("Storage error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl From<TransportError> for ChatError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unauthorized => ChatError::Auth(AuthError::InvalidCredential),
            other => ChatError::Transport(other),
        }
    }
}
