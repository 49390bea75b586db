//! In-process persistence bridge
//!
//! Keeps conversations and messages in memory and pushes every inserted or
//! updated message to live subscribers over a broadcast channel. Failures can
//! be injected per operation to exercise the rollback paths.

use super::{MessageFeed, PersistenceBridge, PersistenceError};
use crate::models::conversations::ConversationSummary;
use crate::models::{NewMessage, Role, StoredMessage};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};
use uuid::Uuid;

const FEED_CHANNEL_BUFFER: usize = 1024;

#[derive(Default)]
struct Tables {
    conversations: Vec<ConversationSummary>,
    messages: Vec<StoredMessage>,
    mutations: usize,
}

#[derive(Default)]
struct Faults {
    insert: Option<Role>,
    update: bool,
    delete: bool,
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
    feed: broadcast::Sender<StoredMessage>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CHANNEL_BUFFER);
        Self {
            tables: Mutex::new(Tables::default()),
            faults: Mutex::new(Faults::default()),
            feed,
        }
    }

    /// Fail the next insert of a message with `role`
    pub async fn fail_next_insert(&self, role: Role) {
        self.faults.lock().await.insert = Some(role);
    }

    pub async fn fail_next_update(&self) {
        self.faults.lock().await.update = true;
    }

    pub async fn fail_next_delete(&self) {
        self.faults.lock().await.delete = true;
    }

    /// Number of successful inserts, updates and deletes
    pub async fn mutation_count(&self) -> usize {
        self.tables.lock().await.mutations
    }

    fn publish(&self, message: StoredMessage) {
        // No subscribers is fine.
        let _ = self.feed.send(message);
    }
}

#[async_trait]
impl PersistenceBridge for MemoryStore {
    async fn create_conversation(
        &self,
        title: String,
    ) -> Result<ConversationSummary, PersistenceError> {
        let summary = ConversationSummary {
            id: Uuid::new_v4(),
            title,
            created_at: Utc::now(),
        };
        self.tables.lock().await.conversations.push(summary.clone());
        debug!("Created conversation {}", summary.id);
        Ok(summary)
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, PersistenceError> {
        let mut conversations = self.tables.lock().await.conversations.clone();
        conversations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(conversations)
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<StoredMessage>, PersistenceError> {
        let tables = self.tables.lock().await;
        if !tables.conversations.iter().any(|c| c.id == conversation_id) {
            return Err(PersistenceError::ConversationNotFound);
        }
        Ok(tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn insert(&self, message: NewMessage) -> Result<StoredMessage, PersistenceError> {
        {
            let mut faults = self.faults.lock().await;
            if faults.insert == Some(message.role) {
                faults.insert = None;
                return Err(PersistenceError::Unavailable(
                    "injected insert failure".to_string(),
                ));
            }
        }

        let stored = {
            let mut tables = self.tables.lock().await;
            if !tables
                .conversations
                .iter()
                .any(|c| c.id == message.conversation_id)
            {
                return Err(PersistenceError::ConversationNotFound);
            }
            let stored = StoredMessage {
                id: Uuid::new_v4(),
                conversation_id: message.conversation_id,
                role: message.role,
                content: message.content,
                created_at: Utc::now(),
            };
            tables.messages.push(stored.clone());
            tables.mutations += 1;
            stored
        };

        debug!("Inserted {} message {}", stored.role, stored.id);
        self.publish(stored.clone());
        Ok(stored)
    }

    async fn update(&self, id: Uuid, content: String) -> Result<(), PersistenceError> {
        {
            let mut faults = self.faults.lock().await;
            if faults.update {
                faults.update = false;
                return Err(PersistenceError::Unavailable(
                    "injected update failure".to_string(),
                ));
            }
        }

        let updated = {
            let mut tables = self.tables.lock().await;
            let message = tables
                .messages
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or(PersistenceError::MessageNotFound)?;
            message.content = content;
            let updated = message.clone();
            tables.mutations += 1;
            updated
        };

        debug!("Updated message {}", id);
        self.publish(updated);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), PersistenceError> {
        {
            let mut faults = self.faults.lock().await;
            if faults.delete {
                faults.delete = false;
                return Err(PersistenceError::Unavailable(
                    "injected delete failure".to_string(),
                ));
            }
        }

        let mut tables = self.tables.lock().await;
        let before = tables.messages.len();
        tables.messages.retain(|m| m.id != id);
        if tables.messages.len() == before {
            return Err(PersistenceError::MessageNotFound);
        }
        tables.mutations += 1;
        debug!("Deleted message {}", id);
        Ok(())
    }

    async fn subscribe(&self, conversation_id: Uuid) -> Result<MessageFeed, PersistenceError> {
        let rx = self.feed.subscribe();
        let feed = BroadcastStream::new(rx).filter_map(move |item| async move {
            match item {
                Ok(message) if message.conversation_id == conversation_id => Some(message),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("Message feed lagged, skipped {} messages", skipped);
                    None
                }
            }
        });
        Ok(Box::pin(feed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn store_with_conversation() -> (MemoryStore, Uuid) {
        let store = MemoryStore::new();
        let conversation = store
            .create_conversation("Chat".to_string())
            .await
            .unwrap();
        (store, conversation.id)
    }

    fn user(conversation_id: Uuid, content: &str) -> NewMessage {
        NewMessage {
            conversation_id,
            role: Role::User,
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_durable_id_and_lists_in_order() {
        let (store, id) = store_with_conversation().await;
        let first = store.insert(user(id, "one")).await.unwrap();
        let second = store.insert(user(id, "two")).await.unwrap();
        assert_ne!(first.id, second.id);

        let messages = store.list_messages(id).await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two"]);
        assert_eq!(store.mutation_count().await, 2);
    }

    #[tokio::test]
    async fn test_unknown_conversation() {
        let store = MemoryStore::new();
        assert_eq!(
            store.insert(user(Uuid::new_v4(), "x")).await,
            Err(PersistenceError::ConversationNotFound)
        );
        assert_eq!(
            store.list_messages(Uuid::new_v4()).await,
            Err(PersistenceError::ConversationNotFound)
        );
    }

    #[tokio::test]
    async fn test_injected_insert_failure_is_one_shot_and_role_specific() {
        let (store, id) = store_with_conversation().await;
        store.fail_next_insert(Role::Assistant).await;

        assert!(store.insert(user(id, "user ok")).await.is_ok());
        let assistant = NewMessage {
            conversation_id: id,
            role: Role::Assistant,
            content: "reply".to_string(),
        };
        assert!(store.insert(assistant.clone()).await.is_err());
        assert!(store.insert(assistant).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let (store, id) = store_with_conversation().await;
        let stored = store.insert(user(id, "draft")).await.unwrap();

        store.update(stored.id, "final".to_string()).await.unwrap();
        assert_eq!(store.list_messages(id).await.unwrap()[0].content, "final");

        store.delete(stored.id).await.unwrap();
        assert!(store.list_messages(id).await.unwrap().is_empty());
        assert_eq!(
            store.delete(stored.id).await,
            Err(PersistenceError::MessageNotFound)
        );
    }

    #[tokio::test]
    async fn test_subscription_only_sees_its_conversation() {
        let (store, id) = store_with_conversation().await;
        let other = store
            .create_conversation("Other".to_string())
            .await
            .unwrap();
        let mut feed = store.subscribe(id).await.unwrap();

        store.insert(user(other.id, "elsewhere")).await.unwrap();
        let stored = store.insert(user(id, "here")).await.unwrap();

        let pushed = timeout(Duration::from_secs(1), feed.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pushed, stored);
    }

    #[tokio::test]
    async fn test_list_conversations_newest_first() {
        let store = MemoryStore::new();
        let first = store.create_conversation("a".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = store.create_conversation("b".to_string()).await.unwrap();

        let listed = store.list_conversations().await.unwrap();
        assert_eq!(listed, vec![second, first]);
    }
}
