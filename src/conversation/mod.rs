//! Per-conversation message log with optimistic sends.
//!
//! [`ConversationStore`] owns every conversation's ordered message list. All
//! mutation goes through its methods so duplicate detection and ordering
//! cannot be bypassed. Outbound messages appear immediately as `Sending`,
//! and delivery runs in the background with bounded retries. A message that
//! cannot be delivered is marked `Failed` and kept for the user to retry.

mod merge;
mod message;
mod reply;
mod retry;


pub use message::{DeliveryState, Message, MessageMetadata, Role};
pub use reply::{
    ControlSignal, ConversationSummary, FormField, ReplyError, ServerReply, SmartForm,
    parse_history, parse_summaries,
};
pub use retry::RetryPolicy;

use crate::clock::{Clock, SystemClock};
use crate::gateway::{self, RequestGateway};
use crate::workflow::WorkflowSessionCache;
use chrono::{DateTime, Utc};
use retry::retryable_category;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default window for treating two identical messages as one.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Message is empty")]
    Empty,

    #[error("Duplicate of message {existing_id}")]
    Duplicate { existing_id: String },

    #[error("Message {0} not found")]
    UnknownMessage(String),

    #[error("Message {0} is not in a failed state")]
    NotRetryable(String),

    #[error(transparent)]
    Gateway(#[from] gateway::Error),

    #[error("Malformed reply: {0}")]
    MalformedReply(#[from] ReplyError),

    #[error("Delivery task failed: {0}")]
    Task(String),
}

/// Result of [`ConversationStore::append`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// Already present; any new metadata was folded into the existing entry.
    Merged { existing_id: String },
    /// Hidden message discarded because hidden messages are not retained.
    Dropped,
}

/// Store events. Every method has a no-op default.
pub trait ConversationObserver: Send + Sync {
    /// Messages in a conversation were added, removed or changed state.
    fn on_messages_changed(&self, _conversation_id: &str) {}
    /// A reply carried control data for the UI to act on.
    fn on_signal(&self, _conversation_id: &str, _signal: &ControlSignal) {}
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub dedup_window: Duration,
    /// Keep system, feedback and empty assistant messages internally. They
    /// are never part of [`ConversationStore::visible`] either way.
    pub retain_hidden: bool,
    pub retry: RetryPolicy,
    /// Endpoint that accepts a new message and returns the reply.
    pub chat_path: String,
    /// History endpoint; `{id}` is replaced by the conversation id.
    pub history_path: String,
    /// Conversation list endpoint; `DELETE {conversations_path}{id}` removes one.
    pub conversations_path: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            dedup_window: DEFAULT_DEDUP_WINDOW,
            retain_hidden: false,
            retry: RetryPolicy::default(),
            chat_path: "/api/chat".to_string(),
            history_path: "/api/chats/{id}/messages".to_string(),
            conversations_path: "/api/chats/".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    /// Ascending by `created_at`.
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    fn new(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn find_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == message_id)
    }
}

/// A send whose delivery is still running.
///
/// The optimistic copy is already in the store; await
/// [`outcome`](Self::outcome) for the server's answer.
#[derive(Debug)]
pub struct PendingSend {
    pub conversation_id: String,
    pub message_id: String,
    handle: JoinHandle<Result<ServerReply, SendError>>,
}

impl PendingSend {
    pub async fn outcome(self) -> Result<ServerReply, SendError> {
        self.handle
            .await
            .map_err(|e| SendError::Task(e.to_string()))?
    }
}

struct Inner {
    gateway: RequestGateway,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
    conversations: Mutex<HashMap<String, Conversation>>,
    observers: Mutex<Vec<Arc<dyn ConversationObserver>>>,
    cache: Option<Arc<WorkflowSessionCache>>,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<Inner>,
}

pub struct ConversationStoreBuilder {
    gateway: RequestGateway,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
    cache: Option<Arc<WorkflowSessionCache>>,
}

impl ConversationStoreBuilder {
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    /// Write execution plans from replies through to `cache`.
    #[must_use]
    pub fn cache(mut self, cache: Arc<WorkflowSessionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn build(self) -> ConversationStore {
        ConversationStore {
            inner: Arc::new(Inner {
                gateway: self.gateway,
                clock: self.clock,
                options: self.options,
                conversations: Mutex::new(HashMap::new()),
                observers: Mutex::new(Vec::new()),
                cache: self.cache,
            }),
        }
    }
}

impl ConversationStore {
    #[must_use]
    pub fn builder(gateway: RequestGateway) -> ConversationStoreBuilder {
        ConversationStoreBuilder {
            gateway,
            clock: Arc::new(SystemClock),
            options: StoreOptions::default(),
            cache: None,
        }
    }

    #[must_use]
    pub fn new(gateway: RequestGateway) -> Self {
        Self::builder(gateway).build()
    }

    pub fn subscribe(&self, observer: Arc<dyn ConversationObserver>) {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Add a message unless an equivalent one is already there.
    ///
    /// A duplicate is not inserted again. Metadata it carries that the
    /// existing entry lacks is merged in, and a server copy confirms a
    /// local one that was still sending or had failed.
    pub fn append(&self, conversation_id: &str, message: Message) -> AppendOutcome {
        let outcome = {
            let mut conversations = self.inner.lock_conversations();
            let now = self.inner.clock.now();
            let conversation = conversations
                .entry(conversation_id.to_string())
                .or_insert_with(|| Conversation::new(conversation_id, now));
            self.inner.append_locked(conversation, message)
        };

        if outcome != AppendOutcome::Dropped {
            self.inner.notify_changed(conversation_id);
        }
        outcome
    }

    /// Send a message.
    ///
    /// The message is in the store as `Sending` by the time this returns;
    /// delivery continues on a spawned task. Must be called from within a
    /// Tokio runtime.
    pub fn send(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<PendingSend, SendError> {
        if content.trim().is_empty() {
            return Err(SendError::Empty);
        }

        let message = Message::outbound(role, content, self.inner.clock.now());
        let message_id = message.id.clone();
        match self.append(conversation_id, message) {
            AppendOutcome::Inserted => {}
            AppendOutcome::Merged { existing_id } => {
                debug!(conversation_id, %existing_id, "duplicate send suppressed");
                return Err(SendError::Duplicate { existing_id });
            }
            AppendOutcome::Dropped => return Err(SendError::Empty),
        }

        Ok(self.spawn_delivery(conversation_id, message_id))
    }

    /// Resend a failed message.
    pub fn retry(&self, conversation_id: &str, message_id: &str) -> Result<PendingSend, SendError> {
        {
            let mut conversations = self.inner.lock_conversations();
            let message = conversations
                .get_mut(conversation_id)
                .and_then(|c| c.find_mut(message_id))
                .ok_or_else(|| SendError::UnknownMessage(message_id.to_string()))?;
            if message.delivery != DeliveryState::Failed {
                return Err(SendError::NotRetryable(message_id.to_string()));
            }
            message.delivery = DeliveryState::Sending;
            message.error = None;
        }
        self.inner.notify_changed(conversation_id);

        Ok(self.spawn_delivery(conversation_id, message_id.to_string()))
    }

    fn spawn_delivery(&self, conversation_id: &str, message_id: String) -> PendingSend {
        let inner = Arc::clone(&self.inner);
        let conv = conversation_id.to_string();
        let id = message_id.clone();
        let handle = tokio::spawn(async move { inner.deliver(&conv, &id).await });

        PendingSend {
            conversation_id: conversation_id.to_string(),
            message_id,
            handle,
        }
    }

    /// Reconcile a conversation with authoritative server history.
    pub fn merge(&self, conversation_id: &str, server_messages: Vec<Message>) {
        {
            let mut conversations = self.inner.lock_conversations();
            let now = self.inner.clock.now();
            let conversation = conversations
                .entry(conversation_id.to_string())
                .or_insert_with(|| Conversation::new(conversation_id, now));

            let retain_hidden = self.inner.options.retain_hidden;
            let server_messages = server_messages
                .into_iter()
                .filter(|m| retain_hidden || m.is_visible())
                .collect();

            let local = std::mem::take(&mut conversation.messages);
            let (merged, report) =
                merge::merge(local, server_messages, self.inner.options.dedup_window);
            debug!(
                conversation_id,
                matched = report.matched,
                kept = report.kept,
                dropped = report.dropped,
                "merged server history"
            );
            conversation.messages = merged;
            conversation.updated_at = now;
        }
        self.inner.notify_changed(conversation_id);
    }

    /// Fetch history from the backend, merge it, and return the visible
    /// transcript.
    pub async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<Message>, SendError> {
        let path = self
            .inner
            .options
            .history_path
            .replace("{id}", conversation_id);
        let body = self.inner.gateway.get(&path).await?;
        let messages = parse_history(body, self.inner.clock.now())?;
        self.merge(conversation_id, messages);
        Ok(self.visible(conversation_id))
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, SendError> {
        let body = self
            .inner
            .gateway
            .get(&self.inner.options.conversations_path)
            .await?;
        Ok(parse_summaries(body)?)
    }

    /// Delete on the backend, then forget the conversation locally.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), SendError> {
        let path = format!(
            "{}/{}",
            self.inner.options.conversations_path.trim_end_matches('/'),
            conversation_id
        );
        self.inner.gateway.delete(&path).await?;

        self.inner.lock_conversations().remove(conversation_id);
        if let Some(cache) = &self.inner.cache
            && let Err(e) = cache.remove(conversation_id)
        {
            warn!(conversation_id, "Failed to drop cached plan: {}", e);
        }
        info!(conversation_id, "conversation deleted");
        self.inner.notify_changed(conversation_id);
        Ok(())
    }

    /// Every stored message, hidden ones included.
    #[must_use]
    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.inner
            .lock_conversations()
            .get(conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// The transcript as it should be rendered.
    #[must_use]
    pub fn visible(&self, conversation_id: &str) -> Vec<Message> {
        self.inner
            .lock_conversations()
            .get(conversation_id)
            .map(|c| c.messages.iter().filter(|m| m.is_visible()).cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.inner
            .lock_conversations()
            .get(conversation_id)
            .cloned()
    }

    #[must_use]
    pub fn message(&self, conversation_id: &str, message_id: &str) -> Option<Message> {
        self.inner
            .lock_conversations()
            .get(conversation_id)
            .and_then(|c| c.messages.iter().find(|m| m.id == message_id).cloned())
    }
}

impl Inner {
    fn lock_conversations(&self) -> MutexGuard<'_, HashMap<String, Conversation>> {
        self.conversations.lock().unwrap_or_else(|poisoned| {
            warn!("conversation store lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    fn observers(&self) -> Vec<Arc<dyn ConversationObserver>> {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn notify_changed(&self, conversation_id: &str) {
        for observer in self.observers() {
            observer.on_messages_changed(conversation_id);
        }
    }

    fn append_locked(&self, conversation: &mut Conversation, message: Message) -> AppendOutcome {
        // Outbound messages are always kept; delivery has to be tracked.
        if !self.options.retain_hidden && !message.delivery.is_local() && !message.is_visible() {
            debug!(conversation_id = %conversation.id, role = %message.role, "dropping hidden message");
            return AppendOutcome::Dropped;
        }

        let window = self.options.dedup_window;
        if let Some(existing) = conversation
            .messages
            .iter_mut()
            .find(|m| merge::is_duplicate(m, &message, window))
        {
            if existing.delivery.is_local() && message.delivery == DeliveryState::Received {
                existing.delivery = DeliveryState::Sent;
                existing.error = None;
            }
            existing.metadata.absorb(message.metadata);
            return AppendOutcome::Merged {
                existing_id: existing.id.clone(),
            };
        }

        conversation.updated_at = conversation.updated_at.max(message.created_at);
        merge::insert_sorted(&mut conversation.messages, message);
        AppendOutcome::Inserted
    }

    fn set_delivery(
        &self,
        conversation_id: &str,
        message_id: &str,
        delivery: DeliveryState,
        error: Option<String>,
    ) {
        let updated = {
            let mut conversations = self.lock_conversations();
            match conversations
                .get_mut(conversation_id)
                .and_then(|c| c.find_mut(message_id))
            {
                Some(message) => {
                    message.delivery = delivery;
                    message.error = error;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.notify_changed(conversation_id);
        }
    }

    async fn deliver(&self, conversation_id: &str, message_id: &str) -> Result<ServerReply, SendError> {
        let (role, content) = {
            let conversations = self.lock_conversations();
            let message = conversations
                .get(conversation_id)
                .and_then(|c| c.messages.iter().find(|m| m.id == message_id))
                .ok_or_else(|| SendError::UnknownMessage(message_id.to_string()))?;
            (message.role, message.content.clone())
        };

        let body = json!({
            "conversation_id": conversation_id,
            "role": role,
            "message": content,
        });

        let policy = &self.options.retry;
        let mut attempt = 0u32;
        let value = loop {
            attempt += 1;
            match self.gateway.post(&self.options.chat_path, body.clone()).await {
                Ok(value) => break value,
                Err(err) => {
                    if let Some(reason) = retryable_category(&err)
                        && policy.allows_another(attempt)
                    {
                        let delay = policy.delay_for(attempt);
                        warn!(
                            "{}, retrying in {}ms (attempt {}/{})",
                            reason,
                            delay.as_millis(),
                            attempt,
                            policy.max_attempts
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    warn!(conversation_id, message_id, "delivery failed: {}", err);
                    self.set_delivery(
                        conversation_id,
                        message_id,
                        DeliveryState::Failed,
                        Some(err.user_message()),
                    );
                    return Err(err.into());
                }
            }
        };

        // The backend accepted the message even if its reply is unusable.
        self.set_delivery(conversation_id, message_id, DeliveryState::Sent, None);

        let reply = ServerReply::parse(value).map_err(|e| {
            warn!(conversation_id, "malformed reply: {}", e);
            e
        })?;

        self.apply_reply(conversation_id, &reply);
        Ok(reply)
    }

    fn apply_reply(&self, conversation_id: &str, reply: &ServerReply) {
        if !reply.is_control_only() && !reply.reply.trim().is_empty() {
            let message = Message::new(Role::Assistant, reply.reply.clone(), self.clock.now())
                .with_metadata(reply.metadata());
            let outcome = {
                let mut conversations = self.lock_conversations();
                let now = self.clock.now();
                let conversation = conversations
                    .entry(conversation_id.to_string())
                    .or_insert_with(|| Conversation::new(conversation_id, now));
                self.append_locked(conversation, message)
            };
            if outcome != AppendOutcome::Dropped {
                self.notify_changed(conversation_id);
            }
        }

        if let Some(plan) = &reply.execution_plan
            && let Some(cache) = &self.cache
            && let Err(e) = cache.save(conversation_id, plan)
        {
            warn!(conversation_id, "Failed to cache execution plan: {}", e);
        }

        let observers = self.observers();
        for signal in &reply.signals {
            debug!(conversation_id, ?signal, "control signal");
            for observer in &observers {
                observer.on_signal(conversation_id, signal);
            }
        }
    }
}
