//! Async driver for the conversation state machine
//!
//! Owns the selected [`Conversation`] behind a single lock and sequences the
//! persistence and transport awaits of a turn around the synchronous
//! transitions in [`super::state`]. The lock is never held across an await
//! on the store or the transport.

use super::errors::{ChatError, ValidationError};
use super::events::{AbortReason, ConversationEvent};
use super::reconcile::reconcile;
use super::state::{Conversation, Phase};
use crate::auth::Session;
use crate::client::{Completion, CompletionSource, TransportError};
use crate::decoder::{decode_stream, DecodeError, DeltaEvent};
use crate::models::conversations::default_title;
use crate::models::{ChatMessage, ConversationSummary, Message, MessageId, NewMessage, Role};
use crate::persistence::{MessageFeed, PersistenceBridge};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const EVENT_CHANNEL_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct MachineOptions {
    /// Longest wait for the reply to open or for its next chunk before the
    /// turn is aborted
    pub idle_timeout: Duration,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// How a submitted or regenerated turn ended without error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The reply was persisted and replaced the streaming slot
    Completed(Message),
    /// The stream was stopped or superseded; nothing was persisted for it
    Cancelled,
}

enum StreamEnd {
    Terminal,
    Cancelled(AbortReason),
}

struct ActiveStream {
    slot_id: MessageId,
    history: Vec<ChatMessage>,
    cancel: oneshot::Receiver<AbortReason>,
}

#[derive(Default)]
struct Inner {
    conversation: Option<Conversation>,
    /// Bumped on every selection so late results of an older turn are dropped
    epoch: u64,
    cancel: Option<(MessageId, oneshot::Sender<AbortReason>)>,
    feed_task: Option<JoinHandle<()>>,
}

pub struct ConversationMachine {
    session: Session,
    persistence: Arc<dyn PersistenceBridge>,
    completions: Arc<dyn CompletionSource>,
    options: MachineOptions,
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<ConversationEvent>,
}

impl ConversationMachine {
    pub fn new(
        session: Session,
        persistence: Arc<dyn PersistenceBridge>,
        completions: Arc<dyn CompletionSource>,
        options: MachineOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_BUFFER);
        Self {
            session,
            persistence,
            completions,
            options,
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    pub async fn selected(&self) -> Option<Uuid> {
        self.inner.lock().await.conversation.as_ref().map(Conversation::id)
    }

    pub async fn phase(&self) -> Option<Phase> {
        self.inner.lock().await.conversation.as_ref().map(Conversation::phase)
    }

    /// Messages of the selected conversation with the in-flight reply last
    pub async fn timeline(&self) -> Vec<Message> {
        self.inner
            .lock()
            .await
            .conversation
            .as_ref()
            .map(Conversation::timeline)
            .unwrap_or_default()
    }

    pub async fn create_conversation(
        &self,
        title: Option<String>,
    ) -> Result<ConversationSummary, ChatError> {
        let title = title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| default_title(Utc::now()));
        let summary = self.persistence.create_conversation(title).await?;
        info!("Created conversation {} ({})", summary.id, summary.title);
        Ok(summary)
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ChatError> {
        Ok(self.persistence.list_conversations().await?)
    }

    /// Load `conversation_id` and follow its live feed.
    ///
    /// Any stream of the previously selected conversation is aborted.
    pub async fn select_conversation(&self, conversation_id: Uuid) -> Result<(), ChatError> {
        debug!("Selecting conversation {}", conversation_id);

        // Subscribe first so nothing persisted during the load is missed.
        let feed = self.persistence.subscribe(conversation_id).await?;
        let history = self.persistence.list_messages(conversation_id).await?;

        {
            let mut inner = self.inner.lock().await;
            if let Some((slot_id, cancel)) = inner.cancel.take() {
                debug!("Superseding stream {}", slot_id);
                let _ = cancel.send(AbortReason::Superseded);
            }
            if let Some(task) = inner.feed_task.take() {
                task.abort();
            }

            inner.epoch += 1;
            let epoch = inner.epoch;
            inner.conversation = Some(Conversation::from_history(conversation_id, history));
            inner.feed_task = Some(tokio::spawn(follow_feed(
                self.inner.clone(),
                self.events.clone(),
                epoch,
                feed,
            )));
        }

        self.emit(ConversationEvent::TimelineChanged);
        Ok(())
    }

    /// Send `text` as the next user message and stream the reply.
    pub async fn submit_user_message(&self, text: &str) -> Result<TurnOutcome, ChatError> {
        let (epoch, conversation_id, provisional) = {
            let mut inner = self.inner.lock().await;
            let epoch = inner.epoch;
            let conversation = inner
                .conversation
                .as_mut()
                .ok_or(ValidationError::NoConversation)?;
            let provisional = conversation.begin_submit(text)?;
            (epoch, conversation.id(), provisional)
        };
        self.emit(ConversationEvent::TimelineChanged);

        let insert = NewMessage {
            conversation_id,
            role: Role::User,
            content: text.to_string(),
        };
        let stored = match self.persistence.insert(insert).await {
            Ok(stored) => stored,
            Err(source) => {
                warn!("Failed to persist user message: {}", source);
                self.with_current(epoch, |c| c.rollback_user(provisional))
                    .await;
                self.emit(ConversationEvent::TimelineChanged);
                self.emit(ConversationEvent::Notice(format!(
                    "Message was not sent: {}",
                    source
                )));
                return Err(ChatError::UserMessageNotSaved {
                    text: text.to_string(),
                    source,
                });
            }
        };

        let started = self
            .begin_stream(epoch, move |c| {
                c.confirm_user(provisional, stored);
                c.open_slot()
            })
            .await?;
        match started {
            Some(active) => self.drive(epoch, active).await,
            None => Ok(TurnOutcome::Cancelled),
        }
    }

    /// Replace the latest user message with `new_text` and regenerate the
    /// reply from the edited history.
    pub async fn edit_and_regenerate(
        &self,
        message_id: MessageId,
        new_text: &str,
    ) -> Result<TurnOutcome, ChatError> {
        let (epoch, plan) = {
            let mut inner = self.inner.lock().await;
            let epoch = inner.epoch;
            let conversation = inner
                .conversation
                .as_mut()
                .ok_or(ValidationError::NoConversation)?;
            (epoch, conversation.begin_edit(message_id, new_text)?)
        };
        debug!(
            "Editing message {}, deleting {} replies",
            plan.user_message_id,
            plan.delete_replies.len()
        );

        for reply in &plan.delete_replies {
            if !self.is_current(epoch).await {
                return Ok(TurnOutcome::Cancelled);
            }
            if let Err(e) = self.persistence.delete(*reply).await {
                return Err(self.fail_edit(epoch, e.into()).await);
            }
            self.with_current(epoch, |c| c.confirm_delete(*reply)).await;
        }
        self.with_current(epoch, |c| c.deletes_done()).await;
        self.emit(ConversationEvent::TimelineChanged);

        if !self.is_current(epoch).await {
            debug!(
                "Conversation changed during edit, not updating {}",
                plan.user_message_id
            );
            return Ok(TurnOutcome::Cancelled);
        }
        if let Err(e) = self
            .persistence
            .update(plan.user_message_id, new_text.to_string())
            .await
        {
            return Err(self.fail_edit(epoch, e.into()).await);
        }

        let text = new_text.to_string();
        let user_message_id = plan.user_message_id;
        let started = self
            .begin_stream(epoch, move |c| {
                c.confirm_update(user_message_id, &text);
                c.open_slot()
            })
            .await?;
        match started {
            Some(active) => self.drive(epoch, active).await,
            None => Ok(TurnOutcome::Cancelled),
        }
    }

    /// Abort the active stream. Returns `false` if nothing was streaming.
    pub async fn stop(&self) -> bool {
        let cancel = self.inner.lock().await.cancel.take();
        match cancel {
            Some((slot_id, cancel)) => {
                info!("Stopping stream {}", slot_id);
                cancel.send(AbortReason::Cancelled).is_ok()
            }
            None => false,
        }
    }

    fn emit(&self, event: ConversationEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    async fn is_current(&self, epoch: u64) -> bool {
        self.inner.lock().await.epoch == epoch
    }

    /// Apply `f` to the selected conversation if it is still the one `epoch`
    /// refers to.
    async fn with_current<T>(
        &self,
        epoch: u64,
        f: impl FnOnce(&mut Conversation) -> T,
    ) -> Option<T> {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return None;
        }
        inner.conversation.as_mut().map(f)
    }

    /// Open the slot and register its cancel handle in one transition
    async fn begin_stream(
        &self,
        epoch: u64,
        open: impl FnOnce(&mut Conversation) -> Result<MessageId, ValidationError>,
    ) -> Result<Option<ActiveStream>, ValidationError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.epoch != epoch {
            return Ok(None);
        }
        let Some(conversation) = inner.conversation.as_mut() else {
            return Ok(None);
        };

        let slot_id = open(conversation)?;
        let history = conversation.history();
        let (tx, rx) = oneshot::channel();
        inner.cancel = Some((slot_id, tx));

        Ok(Some(ActiveStream {
            slot_id,
            history,
            cancel: rx,
        }))
    }

    /// Consume the reply stream, then finalize or abort the slot
    async fn drive(&self, epoch: u64, active: ActiveStream) -> Result<TurnOutcome, ChatError> {
        let slot_id = active.slot_id;
        self.emit(ConversationEvent::StreamStarted(slot_id));
        self.emit(ConversationEvent::TimelineChanged);

        let result = self
            .consume(epoch, slot_id, active.history, active.cancel)
            .await;

        {
            let mut inner = self.inner.lock().await;
            if inner.cancel.as_ref().is_some_and(|(id, _)| *id == slot_id) {
                inner.cancel = None;
            }
        }

        match result {
            Ok(StreamEnd::Terminal) => self.finalize(epoch, slot_id).await,
            Ok(StreamEnd::Cancelled(reason)) => {
                self.abort(epoch, slot_id, reason).await;
                Ok(TurnOutcome::Cancelled)
            }
            Err(e) => {
                error!("Stream {} failed: {}", slot_id, e);
                self.abort(epoch, slot_id, AbortReason::Transport(e.clone()))
                    .await;
                self.emit(ConversationEvent::Notice(format!(
                    "Reply was interrupted: {}",
                    e
                )));
                Err(e.into())
            }
        }
    }

    async fn consume(
        &self,
        epoch: u64,
        slot_id: MessageId,
        history: Vec<ChatMessage>,
        mut cancel: oneshot::Receiver<AbortReason>,
    ) -> Result<StreamEnd, TransportError> {
        let idle = self.options.idle_timeout;
        let completion = tokio::select! {
            biased;
            reason = &mut cancel => {
                return Ok(StreamEnd::Cancelled(reason.unwrap_or(AbortReason::Cancelled)));
            }
            opened = timeout(idle, self.completions.open(&self.session, history)) => {
                opened.map_err(|_| TransportError::IdleTimeout(idle))??
            }
        };

        let bytes = match completion {
            Completion::Complete(text) => {
                trace!("Received complete reply of {} bytes", text.len());
                if !self.merge(epoch, slot_id, text).await {
                    return Ok(StreamEnd::Cancelled(AbortReason::Superseded));
                }
                return Ok(StreamEnd::Terminal);
            }
            Completion::Streaming(bytes) => bytes,
        };

        let mut events = Box::pin(decode_stream(bytes));
        loop {
            let next = tokio::select! {
                biased;
                reason = &mut cancel => {
                    return Ok(StreamEnd::Cancelled(reason.unwrap_or(AbortReason::Cancelled)));
                }
                next = timeout(idle, events.next()) => next,
            };

            let event = match next {
                Err(_) => return Err(TransportError::IdleTimeout(idle)),
                Ok(None) => return Err(TransportError::Unterminated),
                Ok(Some(Err(DecodeError::Unterminated))) => {
                    return Err(TransportError::Unterminated)
                }
                Ok(Some(Err(DecodeError::Transport(e)))) => return Err(TransportError::Stream(e)),
                Ok(Some(Ok(event))) => event,
            };

            match event {
                DeltaEvent::Text(fragment) => {
                    trace!("Stream {} delta: {} bytes", slot_id, fragment.len());
                    if !self.merge(epoch, slot_id, fragment).await {
                        return Ok(StreamEnd::Cancelled(AbortReason::Superseded));
                    }
                }
                DeltaEvent::Malformed => trace!("Stream {} skipped a malformed record", slot_id),
                DeltaEvent::Terminal => return Ok(StreamEnd::Terminal),
            }
        }
    }

    async fn merge(&self, epoch: u64, slot_id: MessageId, fragment: String) -> bool {
        let merged = self
            .with_current(epoch, |c| c.merge_delta(&fragment).is_ok())
            .await
            .unwrap_or(false);
        if merged {
            self.emit(ConversationEvent::Delta {
                id: slot_id,
                fragment,
            });
        }
        merged
    }

    async fn finalize(&self, epoch: u64, slot_id: MessageId) -> Result<TurnOutcome, ChatError> {
        let finalized = self
            .with_current(epoch, |c| {
                let text = c.finalize_slot().ok()?;
                Some((c.id(), text))
            })
            .await
            .flatten();
        let Some((conversation_id, text)) = finalized else {
            return Ok(TurnOutcome::Cancelled);
        };
        self.emit(ConversationEvent::TimelineChanged);

        let insert = NewMessage {
            conversation_id,
            role: Role::Assistant,
            content: text,
        };
        match self.persistence.insert(insert).await {
            Ok(stored) => {
                debug!("Stream {} persisted as {}", slot_id, stored.id);
                let fallback: Message = stored.clone().into();
                let message = self
                    .with_current(epoch, |c| c.complete_finalize(stored))
                    .await
                    .unwrap_or(fallback);
                self.emit(ConversationEvent::StreamFinalized(message.clone()));
                self.emit(ConversationEvent::TimelineChanged);
                Ok(TurnOutcome::Completed(message))
            }
            Err(source) => {
                error!("Failed to persist reply {}: {}", slot_id, source);
                self.with_current(epoch, |c| c.fail_finalize()).await;
                self.emit(ConversationEvent::TimelineChanged);
                self.emit(ConversationEvent::Notice(format!(
                    "Reply could not be saved: {}",
                    source
                )));
                Err(ChatError::AssistantMessageNotSaved {
                    message_id: slot_id,
                    source,
                })
            }
        }
    }

    async fn abort(&self, epoch: u64, slot_id: MessageId, reason: AbortReason) {
        debug!("Aborting stream {}: {}", slot_id, reason);
        self.with_current(epoch, |c| c.abort_slot()).await;
        self.emit(ConversationEvent::StreamAborted {
            id: slot_id,
            reason,
        });
        self.emit(ConversationEvent::TimelineChanged);
    }

    async fn fail_edit(&self, epoch: u64, error: ChatError) -> ChatError {
        warn!("Edit failed: {}", error);
        self.with_current(epoch, |c| c.cancel_edit()).await;
        self.emit(ConversationEvent::TimelineChanged);
        self.emit(ConversationEvent::Notice(format!("Edit failed: {}", error)));
        error
    }
}

impl Drop for ConversationMachine {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.try_lock() {
            if let Some(task) = inner.feed_task.take() {
                task.abort();
            }
            if let Some((_, cancel)) = inner.cancel.take() {
                let _ = cancel.send(AbortReason::Cancelled);
            }
        }
    }
}

/// Reconcile every pushed message into the conversation selected at `epoch`
async fn follow_feed(
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<ConversationEvent>,
    epoch: u64,
    mut feed: MessageFeed,
) {
    while let Some(remote) = feed.next().await {
        {
            let mut inner = inner.lock().await;
            if inner.epoch != epoch {
                break;
            }
            trace!("Reconciling pushed message {}", remote.id);
            if let Some(conversation) = inner.conversation.take() {
                inner.conversation = Some(reconcile(conversation, remote));
            }
        }
        let _ = events.send(ConversationEvent::TimelineChanged);
    }
    debug!("Message feed for epoch {} closed", epoch);
}
