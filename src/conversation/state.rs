//! Synchronous conversation state
//!
//! Every transition of the conversation state machine lives here and is
//! validated against the current [`Phase`]. The async driver in
//! [`super::machine`] only sequences these calls around persistence and
//! transport awaits.

use super::errors::ValidationError;
use crate::models::{ChatMessage, Message, MessageId, Role, StoredMessage};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingUserPersist,
    Streaming,
    AwaitingAssistantPersist,
    AwaitingDelete,
    AwaitingUserUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Active,
    Finalized,
    Aborted,
}

/// Transient holder of an in-flight assistant reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingSlot {
    pub provisional_id: MessageId,
    pub accumulated_text: String,
    pub status: SlotStatus,
    pub started_at: DateTime<Utc>,
}

impl StreamingSlot {
    fn new() -> Self {
        Self {
            provisional_id: MessageId::provisional(),
            accumulated_text: String::new(),
            status: SlotStatus::Active,
            started_at: Utc::now(),
        }
    }

    /// The slot as it is shown in the timeline
    pub fn to_message(&self) -> Message {
        Message {
            id: self.provisional_id,
            role: Role::Assistant,
            content: self.accumulated_text.clone(),
            created_at: self.started_at,
            unsaved: false,
        }
    }
}

/// Durable mutations required before regenerating the latest turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditPlan {
    pub user_message_id: Uuid,
    /// Durable assistant replies following the edited message
    pub delete_replies: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub(super) id: Uuid,
    pub(super) messages: Vec<Message>,
    pub(super) slot: Option<StreamingSlot>,
    pub(super) phase: Phase,
    /// Durable ids deleted from here; late pushes of them are ignored
    pub(super) deleted: HashSet<Uuid>,
}

impl Conversation {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            messages: Vec::new(),
            slot: None,
            phase: Phase::Idle,
            deleted: HashSet::new(),
        }
    }

    pub fn from_history(id: Uuid, history: Vec<StoredMessage>) -> Self {
        let mut conversation = Self::new(id);
        for stored in history.into_iter().filter(|m| m.conversation_id == id) {
            conversation.insert_ordered(stored.into());
        }
        conversation
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn slot(&self) -> Option<&StreamingSlot> {
        self.slot.as_ref()
    }

    /// Messages followed by the in-flight reply, if any
    pub fn timeline(&self) -> Vec<Message> {
        let mut timeline = self.messages.clone();
        if let Some(slot) = self.slot.as_ref().filter(|s| s.status != SlotStatus::Aborted) {
            timeline.push(slot.to_message());
        }
        timeline
    }

    /// History sent upstream. The slot is never part of it.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(Message::to_chat_message).collect()
    }

    pub fn latest_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    fn ensure_idle(&self) -> Result<(), ValidationError> {
        match self.phase {
            Phase::Idle => Ok(()),
            Phase::Streaming => Err(ValidationError::StreamActive),
            _ => Err(ValidationError::Busy),
        }
    }

    fn active_slot_mut(&mut self) -> Result<&mut StreamingSlot, ValidationError> {
        match self.slot.as_mut() {
            Some(slot) if slot.status == SlotStatus::Active => Ok(slot),
            _ => Err(ValidationError::NoActiveStream),
        }
    }

    /// Append a provisional user message and wait for its durable write
    pub fn begin_submit(&mut self, text: &str) -> Result<MessageId, ValidationError> {
        if text.trim().is_empty() {
            return Err(ValidationError::EmptyMessage);
        }
        self.ensure_idle()?;

        let message = Message::provisional(Role::User, text);
        let id = message.id;
        self.insert_ordered(message);
        self.phase = Phase::AwaitingUserPersist;
        Ok(id)
    }

    /// The durable write of a submitted user message succeeded
    pub fn confirm_user(&mut self, provisional: MessageId, stored: StoredMessage) -> Message {
        self.migrate(provisional, stored)
    }

    /// The durable write of a submitted user message failed
    pub fn rollback_user(&mut self, provisional: MessageId) {
        self.messages.retain(|m| m.id != provisional);
        if self.phase == Phase::AwaitingUserPersist {
            self.phase = Phase::Idle;
        }
    }

    /// Open the streaming slot once the user side of the turn is durable
    pub fn open_slot(&mut self) -> Result<MessageId, ValidationError> {
        if self
            .slot
            .as_ref()
            .is_some_and(|s| s.status == SlotStatus::Active)
        {
            return Err(ValidationError::StreamActive);
        }
        match self.phase {
            Phase::AwaitingUserPersist | Phase::AwaitingUserUpdate => {}
            Phase::Streaming | Phase::AwaitingAssistantPersist => {
                return Err(ValidationError::StreamActive)
            }
            Phase::Idle | Phase::AwaitingDelete => return Err(ValidationError::Busy),
        }

        let slot = StreamingSlot::new();
        let id = slot.provisional_id;
        self.slot = Some(slot);
        self.phase = Phase::Streaming;
        Ok(id)
    }

    pub fn merge_delta(&mut self, fragment: &str) -> Result<(), ValidationError> {
        self.active_slot_mut()?.accumulated_text.push_str(fragment);
        Ok(())
    }

    /// Freeze the slot and hand back the text to persist
    pub fn finalize_slot(&mut self) -> Result<String, ValidationError> {
        let slot = self.active_slot_mut()?;
        slot.status = SlotStatus::Finalized;
        let text = slot.accumulated_text.clone();
        self.phase = Phase::AwaitingAssistantPersist;
        Ok(text)
    }

    /// The durable write of the finalized reply succeeded: the slot gives way
    /// to the durable entry.
    pub fn complete_finalize(&mut self, stored: StoredMessage) -> Message {
        if self
            .slot
            .as_ref()
            .is_some_and(|s| s.status == SlotStatus::Finalized)
        {
            self.slot = None;
        }
        self.phase = Phase::Idle;

        let durable = MessageId::Durable(stored.id);
        if let Some(existing) = self.messages.iter().find(|m| m.id == durable) {
            return existing.clone();
        }
        let message: Message = stored.into();
        self.messages.push(message.clone());
        message
    }

    /// The durable write of the finalized reply failed: keep the text visible
    /// as an unsaved message.
    pub fn fail_finalize(&mut self) -> Option<Message> {
        if self.slot.as_ref()?.status != SlotStatus::Finalized {
            return None;
        }
        let slot = self.slot.take()?;
        self.phase = Phase::Idle;

        let message = Message {
            id: slot.provisional_id,
            role: Role::Assistant,
            content: slot.accumulated_text,
            created_at: slot.started_at,
            unsaved: true,
        };
        self.messages.push(message.clone());
        Some(message)
    }

    /// Discard the active slot and its text. Returns the discarded slot's id.
    pub fn abort_slot(&mut self) -> Option<MessageId> {
        let slot = self.active_slot_mut().ok()?;
        slot.status = SlotStatus::Aborted;
        slot.accumulated_text.clear();
        let id = slot.provisional_id;
        self.slot = None;
        self.phase = Phase::Idle;
        Some(id)
    }

    /// Validate an edit of the latest user message and plan its durable steps
    pub fn begin_edit(
        &mut self,
        target: MessageId,
        new_text: &str,
    ) -> Result<EditPlan, ValidationError> {
        if new_text.trim().is_empty() {
            return Err(ValidationError::EmptyMessage);
        }
        self.ensure_idle()?;

        let index = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .ok_or(ValidationError::NotLatestUserMessage)?;
        let latest = &self.messages[index];
        if latest.id != target {
            return Err(ValidationError::NotLatestUserMessage);
        }
        let user_message_id = latest
            .id
            .durable()
            .ok_or(ValidationError::NotLatestUserMessage)?;

        let delete_replies: Vec<Uuid> = self.messages[index + 1..]
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .filter_map(|m| m.id.durable())
            .collect();

        self.phase = if delete_replies.is_empty() {
            Phase::AwaitingUserUpdate
        } else {
            Phase::AwaitingDelete
        };

        Ok(EditPlan {
            user_message_id,
            delete_replies,
        })
    }

    pub fn confirm_delete(&mut self, id: Uuid) {
        self.messages.retain(|m| m.id != MessageId::Durable(id));
        self.deleted.insert(id);
    }

    /// All replies are gone; the user message is next
    pub fn deletes_done(&mut self) {
        if self.phase == Phase::AwaitingDelete {
            self.phase = Phase::AwaitingUserUpdate;
        }
    }

    /// The edited user message is durable. Unsaved replies of the replaced
    /// turn are dropped.
    pub fn confirm_update(&mut self, user_message_id: Uuid, new_text: &str) {
        let durable = MessageId::Durable(user_message_id);
        let Some(index) = self.messages.iter().position(|m| m.id == durable) else {
            return;
        };
        self.messages[index].content = new_text.to_string();

        let mut position = 0;
        self.messages.retain(|m| {
            let replaced = position > index && m.role == Role::Assistant && !m.id.is_durable();
            position += 1;
            !replaced
        });
    }

    pub fn cancel_edit(&mut self) {
        if matches!(self.phase, Phase::AwaitingDelete | Phase::AwaitingUserUpdate) {
            self.phase = Phase::Idle;
        }
    }

    /// Replace a provisional entry by its durable counterpart in place
    pub(super) fn migrate(&mut self, provisional: MessageId, stored: StoredMessage) -> Message {
        let durable = MessageId::Durable(stored.id);
        if let Some(existing) = self.messages.iter().find(|m| m.id == durable).cloned() {
            // The live feed got here first.
            self.messages.retain(|m| m.id != provisional);
            return existing;
        }

        let message: Message = stored.into();
        match self.messages.iter().position(|m| m.id == provisional) {
            Some(pos) => self.messages[pos] = message.clone(),
            None => self.insert_ordered(message.clone()),
        }
        message
    }

    /// Insert by `created_at`; equal timestamps keep insertion order
    pub(super) fn insert_ordered(&mut self, message: Message) {
        let pos = self
            .messages
            .iter()
            .position(|m| m.created_at > message.created_at)
            .unwrap_or(self.messages.len());
        self.messages.insert(pos, message);
    }
}
