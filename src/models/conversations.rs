use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Title used when a conversation is created without one.
pub fn default_title(now: DateTime<Utc>) -> String {
    format!("Chat - {}", now.format("%H:%M:%S"))
}
