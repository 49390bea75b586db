//! Merging pushed messages into local state
//!
//! The live feed and the write acknowledgement race each other; whichever
//! arrives second must find the entry already migrated and leave it alone.

use super::state::{Conversation, SlotStatus};
use crate::models::{Message, MessageId, Role, StoredMessage};
use tracing::trace;

/// Maximum distance between a provisional entry and a pushed message for
/// them to be treated as the same logical message.
pub const RECONCILE_WINDOW_SECS: i64 = 60;

/// Merge one pushed message into `local`.
///
/// In order of precedence the pushed message
/// 1. replaces the entry carrying its durable id,
/// 2. replaces the oldest provisional entry with the same role and content
///    created within [`RECONCILE_WINDOW_SECS`],
/// 3. collapses a finalized streaming slot holding the same text,
/// 4. or is inserted by `created_at`.
pub fn reconcile(mut local: Conversation, remote: StoredMessage) -> Conversation {
    if remote.conversation_id != local.id {
        trace!(
            "Ignoring message {} pushed for conversation {}",
            remote.id,
            remote.conversation_id
        );
        return local;
    }

    if local.deleted.contains(&remote.id) {
        trace!("Ignoring late push of deleted message {}", remote.id);
        return local;
    }

    let durable = MessageId::Durable(remote.id);
    if let Some(existing) = local.messages.iter_mut().find(|m| m.id == durable) {
        existing.content = remote.content;
        return local;
    }

    if let Some(pos) = local
        .messages
        .iter()
        .position(|m| matches_provisional(m, &remote))
    {
        trace!("Pushed message {} replaces a provisional entry", remote.id);
        local.messages[pos] = remote.into();
        return local;
    }

    let collapses_slot = local.slot.as_ref().is_some_and(|slot| {
        slot.status == SlotStatus::Finalized
            && remote.role == Role::Assistant
            && slot.accumulated_text == remote.content
    });
    if collapses_slot {
        trace!("Pushed message {} replaces the finalized reply", remote.id);
        local.slot = None;
        local.messages.push(remote.into());
        return local;
    }

    local.insert_ordered(remote.into());
    local
}

fn matches_provisional(local: &Message, remote: &StoredMessage) -> bool {
    !local.id.is_durable()
        && local.role == remote.role
        && local.content == remote.content
        && (local.created_at - remote.created_at).num_seconds().abs() <= RECONCILE_WINDOW_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::state::Phase;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn pushed(conversation: &Conversation, role: Role, content: &str) -> StoredMessage {
        StoredMessage {
            id: Uuid::new_v4(),
            conversation_id: conversation.id(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_push_before_ack_does_not_duplicate() {
        let mut c = Conversation::new(Uuid::new_v4());
        let provisional = c.begin_submit("Hi").unwrap();
        let stored = pushed(&c, Role::User, "Hi");

        let mut c = reconcile(c, stored.clone());
        assert_eq!(c.messages().len(), 1);
        assert_eq!(c.messages()[0].id, MessageId::Durable(stored.id));

        c.confirm_user(provisional, stored.clone());
        assert_eq!(c.messages().len(), 1);
        assert_eq!(c.messages()[0].id, MessageId::Durable(stored.id));
    }

    #[test]
    fn test_ack_before_push_does_not_duplicate() {
        let mut c = Conversation::new(Uuid::new_v4());
        let provisional = c.begin_submit("Hi").unwrap();
        let stored = pushed(&c, Role::User, "Hi");

        c.confirm_user(provisional, stored.clone());
        let c = reconcile(c, stored.clone());
        assert_eq!(c.messages().len(), 1);
        assert_eq!(c.messages()[0].id, MessageId::Durable(stored.id));
    }

    #[test]
    fn test_push_of_finalized_reply_collapses_slot() {
        let mut c = Conversation::new(Uuid::new_v4());
        let provisional = c.begin_submit("Hi").unwrap();
        let user = pushed(&c, Role::User, "Hi");
        c.confirm_user(provisional, user);
        c.open_slot().unwrap();
        c.merge_delta("Hello!").unwrap();
        c.finalize_slot().unwrap();

        let reply = pushed(&c, Role::Assistant, "Hello!");
        let mut c = reconcile(c, reply.clone());
        assert!(c.slot().is_none());
        assert_eq!(c.timeline().len(), 2);

        let message = c.complete_finalize(reply.clone());
        assert_eq!(message.id, MessageId::Durable(reply.id));
        assert_eq!(c.timeline().len(), 2);
        assert_eq!(c.phase(), Phase::Idle);
    }

    #[test]
    fn test_active_slot_is_not_collapsed() {
        let mut c = Conversation::new(Uuid::new_v4());
        c.begin_submit("Hi").unwrap();
        c.open_slot().unwrap();
        c.merge_delta("Hello!").unwrap();

        let from_elsewhere = pushed(&c, Role::Assistant, "Hello!");
        let c = reconcile(c, from_elsewhere);
        assert!(c.slot().is_some());
        assert_eq!(c.timeline().len(), 3);
        assert_eq!(c.timeline().last().unwrap().content, "Hello!");
        assert!(!c.timeline().last().unwrap().id.is_durable());
    }

    #[test]
    fn test_provisional_outside_window_is_not_matched() {
        let mut c = Conversation::new(Uuid::new_v4());
        c.begin_submit("Hi").unwrap();
        let mut stored = pushed(&c, Role::User, "Hi");
        stored.created_at = Utc::now() + Duration::seconds(RECONCILE_WINDOW_SECS + 5);

        let c = reconcile(c, stored);
        assert_eq!(c.messages().len(), 2);
    }

    #[test]
    fn test_oldest_matching_provisional_wins() {
        let mut c = Conversation::new(Uuid::new_v4());
        let older = c.begin_submit("Hi").unwrap();
        c.phase = Phase::Idle;
        let newer = c.begin_submit("Hi").unwrap();

        let stored = pushed(&c, Role::User, "Hi");
        let c = reconcile(c, stored.clone());
        let ids: Vec<MessageId> = c.messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![MessageId::Durable(stored.id), newer]);
        assert!(!ids.contains(&older));
    }

    #[test]
    fn test_role_mismatch_is_not_matched() {
        let mut c = Conversation::new(Uuid::new_v4());
        c.begin_submit("Same").unwrap();
        let stored = pushed(&c, Role::Assistant, "Same");
        let c = reconcile(c, stored);
        assert_eq!(c.messages().len(), 2);
    }

    #[test]
    fn test_update_replaces_content_in_place() {
        let mut c = Conversation::new(Uuid::new_v4());
        let provisional = c.begin_submit("Hi").unwrap();
        let mut stored = pushed(&c, Role::User, "Hi");
        c.confirm_user(provisional, stored.clone());

        stored.content = "Hey".to_string();
        let c = reconcile(c, stored);
        assert_eq!(c.messages().len(), 1);
        assert_eq!(c.messages()[0].content, "Hey");
    }

    #[test]
    fn test_deleted_message_is_not_resurrected() {
        let mut c = Conversation::new(Uuid::new_v4());
        let stored = pushed(&c, Role::Assistant, "old reply");
        c = reconcile(c, stored.clone());
        c.confirm_delete(stored.id);
        assert!(c.messages().is_empty());

        let c = reconcile(c, stored);
        assert!(c.messages().is_empty());
    }

    #[test]
    fn test_other_conversation_is_ignored() {
        let c = Conversation::new(Uuid::new_v4());
        let mut stored = pushed(&c, Role::User, "Hi");
        stored.conversation_id = Uuid::new_v4();
        let c = reconcile(c, stored);
        assert!(c.messages().is_empty());
    }

    #[test]
    fn test_remote_messages_are_ordered_by_created_at() {
        let c = Conversation::new(Uuid::new_v4());
        let now = Utc::now();
        let mut later = pushed(&c, Role::User, "later");
        later.created_at = now + Duration::seconds(10);
        let mut earlier = pushed(&c, Role::Assistant, "earlier");
        earlier.created_at = now;

        let c = reconcile(c, later);
        let c = reconcile(c, earlier);
        let contents: Vec<&str> = c.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["earlier", "later"]);
    }
}
