pub mod conversations;
pub mod messages;

pub use conversations::ConversationSummary;
pub use messages::{ChatMessage, ChatRequest, Message, MessageId, NewMessage, Role, StoredMessage};
