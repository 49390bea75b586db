//! Boundary to the durable message store

pub mod memory;

use crate::models::{ConversationSummary, NewMessage, StoredMessage};
use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

pub use memory::MemoryStore;

/// Live feed of persisted messages for one conversation, in creation order
pub type MessageFeed = BoxStream<'static, StoredMessage>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("Conversation not found")]
    ConversationNotFound,

    #[error("Message not found")]
    MessageNotFound,

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable store for finalized messages with real-time push.
#[async_trait]
pub trait PersistenceBridge: Send + Sync {
    async fn create_conversation(&self, title: String)
        -> Result<ConversationSummary, PersistenceError>;

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, PersistenceError>;

    async fn list_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<StoredMessage>, PersistenceError>;

    /// Store a message and return it with its durable id
    async fn insert(&self, message: NewMessage) -> Result<StoredMessage, PersistenceError>;

    async fn update(&self, id: Uuid, content: String) -> Result<(), PersistenceError>;

    async fn delete(&self, id: Uuid) -> Result<(), PersistenceError>;

    /// Subscribe to messages persisted in `conversation_id` from now on
    async fn subscribe(&self, conversation_id: Uuid) -> Result<MessageFeed, PersistenceError>;
}
