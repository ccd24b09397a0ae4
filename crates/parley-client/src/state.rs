//! Client state shared by every UI-facing operation.
//!
//! [`ChatClient`] wires the store, registry, permission gate, send pipeline
//! and ingest loop together around a single injected [`DataSource`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_shared::types::{ChatId, ChatKind, DeliveryState, MessageId, MessageType, UserId};
use parley_store::{
    Chat, DeliveryStateMachine, Message, MessageStore, ReactionAggregator, StoreError,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, SendError};
use crate::events::{ClientEvent, EventBus};
use crate::ingest::RealtimeIngest;
use crate::permission::{ChatPermission, PermissionGate};
use crate::registry::{ChatFilter, ChatRegistry, ChatSummary};
use crate::send::{OptimisticSendPipeline, PendingSend};
use crate::source::DataSource;

const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

pub struct ChatClient {
    config: ClientConfig,
    source: Arc<dyn DataSource>,
    store: Arc<MessageStore>,
    registry: Arc<ChatRegistry>,
    gate: PermissionGate,
    delivery: DeliveryStateMachine,
    reactions: ReactionAggregator,
    sender: OptimisticSendPipeline,
    ingest: Arc<RealtimeIngest>,
    bus: EventBus,
}

impl ChatClient {
    pub fn new(config: ClientConfig, source: Arc<dyn DataSource>) -> Self {
        let store = Arc::new(MessageStore::new());
        let registry = Arc::new(ChatRegistry::new(config.user_id.clone(), store.clone()));
        let bus = EventBus::new(config.event_bus_capacity);
        let gate = PermissionGate::new(
            source.clone(),
            config.user_id.clone(),
            config.permission_ttl,
            config.permission_timeout,
        );
        let sender = OptimisticSendPipeline::new(
            &config,
            source.clone(),
            store.clone(),
            registry.clone(),
            gate.clone(),
            bus.clone(),
        );
        let ingest = Arc::new(RealtimeIngest::new(
            &config,
            store.clone(),
            registry.clone(),
            gate.clone(),
            bus.clone(),
        ));

        Self {
            delivery: DeliveryStateMachine::new(store.clone()),
            reactions: ReactionAggregator::new(store.clone()),
            config,
            source,
            store,
            registry,
            gate,
            sender,
            ingest,
            bus,
        }
    }

    /// Load the chat list from the backend. Returns the number of chats.
    pub async fn bootstrap(&self) -> Result<usize, ClientError> {
        let chats = self.source.list_chats().await?;
        for dto in &chats {
            self.registry.load_dto(dto);
        }
        info!(count = chats.len(), user = %self.config.user_id, "Chat list loaded");
        self.bus.emit(ClientEvent::ChatsChanged);
        Ok(chats.len())
    }

    pub async fn create_chat(
        &self,
        participants: &[UserId],
        kind: ChatKind,
        name: Option<&str>,
    ) -> Result<Chat, ClientError> {
        let dto = self.source.create_chat(participants, kind, name).await?;
        let chat = self.registry.load_dto(&dto);
        info!(chat = %chat.id, kind = ?chat.kind, members = chat.participants.len(), "Chat created");
        self.bus.emit(ClientEvent::ChatsChanged);
        Ok(chat)
    }

    /// Keep a push connection open for the lifetime of the returned task,
    /// reconnecting with exponential backoff.
    pub fn spawn_event_stream(&self) -> JoinHandle<()> {
        let source = self.source.clone();
        let ingest = self.ingest.clone();
        tokio::spawn(async move {
            let mut backoff = RECONNECT_BACKOFF_INITIAL;
            loop {
                match source.stream_events().await {
                    Ok(rx) => {
                        backoff = RECONNECT_BACKOFF_INITIAL;
                        ingest.run(rx).await;
                        warn!("Push stream ended");
                    }
                    Err(e) => warn!(error = %e, "Failed to open push stream"),
                }
                debug!(backoff_ms = backoff.as_millis() as u64, "Reconnecting push stream");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
            }
        })
    }

    pub async fn send(
        &self,
        chat_id: &ChatId,
        content: impl Into<String>,
        message_type: MessageType,
        reply_to: Option<MessageId>,
    ) -> Result<PendingSend, SendError> {
        self.sender
            .send(chat_id, content.into(), message_type, reply_to)
            .await
    }

    pub async fn retry(&self, message_id: &MessageId) -> Result<PendingSend, SendError> {
        self.sender.retry(message_id).await
    }

    /// Toggle the local user's reaction. Returns whether it is now present.
    pub fn toggle_reaction(&self, message_id: &MessageId, emoji: &str) -> Result<bool, ClientError> {
        let present = self
            .reactions
            .toggle(message_id, &self.config.user_id, emoji)
            .ok_or_else(|| StoreError::MessageNotFound(message_id.clone()))?;
        if let Some(chat_id) = self.store.chat_of(message_id) {
            self.bus.emit(ClientEvent::ReactionChanged {
                chat_id,
                message_id: message_id.clone(),
            });
        }
        Ok(present)
    }

    /// Mark every delivered message from others in a chat as read.
    /// Returns how many changed.
    pub fn mark_read(&self, chat_id: &ChatId) -> usize {
        let mut changed = 0;
        for message in self.store.list(chat_id) {
            if message.sender_id == self.config.user_id
                || message.delivery != DeliveryState::Delivered
            {
                continue;
            }
            if self.delivery.transition(&message.id, DeliveryState::Read) {
                changed += 1;
                self.bus.emit(ClientEvent::DeliveryChanged {
                    chat_id: chat_id.clone(),
                    message_id: message.id,
                    state: DeliveryState::Read,
                });
            }
        }
        if changed > 0 {
            debug!(chat = %chat_id, changed, "Chat marked read");
        }
        changed
    }

    pub fn messages(&self, chat_id: &ChatId) -> Vec<Message> {
        self.store.list(chat_id)
    }

    pub fn chats(&self, filter: ChatFilter) -> Vec<ChatSummary> {
        self.registry.resort(filter)
    }

    /// The user opened a chat: warm the permission cache in the background.
    pub fn focus_chat(&self, chat_id: &ChatId) -> Result<(), ClientError> {
        let chat = self
            .registry
            .get(chat_id)
            .ok_or_else(|| ClientError::UnknownChat(chat_id.clone()))?;
        self.gate.prefetch(chat);
        Ok(())
    }

    /// The user navigated away: abandon any in-flight prefetch.
    pub fn leave_chat(&self, chat_id: &ChatId) -> bool {
        self.gate.cancel(chat_id)
    }

    pub async fn can_message(&self, chat_id: &ChatId) -> Result<ChatPermission, ClientError> {
        let chat = self
            .registry
            .get(chat_id)
            .ok_or_else(|| ClientError::UnknownChat(chat_id.clone()))?;
        Ok(self.gate.evaluate_chat(&chat).await)
    }

    pub fn set_pinned(&self, chat_id: &ChatId, pinned: bool) -> Result<(), ClientError> {
        self.flag_result(chat_id, self.registry.set_pinned(chat_id, pinned))
    }

    pub fn set_muted(&self, chat_id: &ChatId, muted: bool) -> Result<(), ClientError> {
        self.flag_result(chat_id, self.registry.set_muted(chat_id, muted))
    }

    pub fn set_archived(&self, chat_id: &ChatId, archived: bool) -> Result<(), ClientError> {
        self.flag_result(chat_id, self.registry.set_archived(chat_id, archived))
    }

    fn flag_result(&self, chat_id: &ChatId, found: bool) -> Result<(), ClientError> {
        if !found {
            return Err(ClientError::UnknownChat(chat_id.clone()));
        }
        self.bus.emit(ClientEvent::ChatsChanged);
        Ok(())
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ClientEvent> {
        self.bus.subscribe()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ChatRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn ingest(&self) -> &Arc<RealtimeIngest> {
        &self.ingest
    }
}
