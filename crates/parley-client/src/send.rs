//! Optimistic send pipeline.
//!
//! A message becomes visible the moment it is accepted locally. The network
//! round-trip runs in a spawned task whose result either swaps the
//! placeholder for the server's copy or marks it failed. Failed sends stay
//! failed until the user retries.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_shared::error::ValidationError;
use parley_shared::protocol::SendMessageRequest;
use parley_shared::types::{ChatId, DeliveryState, MessageId, MessageType, UserId};
use parley_store::{Chat, DeliveryStateMachine, Message, MessageStore};

use crate::config::ClientConfig;
use crate::error::SendError;
use crate::events::{ClientEvent, EventBus};
use crate::permission::PermissionGate;
use crate::registry::ChatRegistry;
use crate::source::DataSource;

/// Reject empty or oversized content before anything is touched.
pub fn validate_content(content: &str, max_chars: usize) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::EmptyContent);
    }
    let len = content.chars().count();
    if len > max_chars {
        return Err(ValidationError::ContentTooLong {
            len,
            max: max_chars,
        });
    }
    Ok(())
}

/// How a dispatched send ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Confirmed {
        provisional_id: MessageId,
        message_id: MessageId,
    },
    /// The message is now `failed` and waits for a manual retry.
    NetworkFailure {
        provisional_id: MessageId,
        error: String,
    },
}

/// A locally accepted message and the task carrying it to the server.
#[derive(Debug)]
pub struct PendingSend {
    pub message: Message,
    pub completion: JoinHandle<SendOutcome>,
}

#[derive(Clone)]
pub struct OptimisticSendPipeline {
    source: Arc<dyn DataSource>,
    store: Arc<MessageStore>,
    delivery: DeliveryStateMachine,
    registry: Arc<ChatRegistry>,
    gate: PermissionGate,
    bus: EventBus,
    local_user: UserId,
    max_message_chars: usize,
}

impl OptimisticSendPipeline {
    pub fn new(
        config: &ClientConfig,
        source: Arc<dyn DataSource>,
        store: Arc<MessageStore>,
        registry: Arc<ChatRegistry>,
        gate: PermissionGate,
        bus: EventBus,
    ) -> Self {
        Self {
            source,
            delivery: DeliveryStateMachine::new(store.clone()),
            store,
            registry,
            gate,
            bus,
            local_user: config.user_id.clone(),
            max_message_chars: config.max_message_chars,
        }
    }

    /// Accept a message for sending.
    ///
    /// Validation and permission failures are returned before the store or
    /// the network is touched. On success the provisional message is
    /// already in the store when this returns.
    pub async fn send(
        &self,
        chat_id: &ChatId,
        content: String,
        message_type: MessageType,
        reply_to: Option<MessageId>,
    ) -> Result<PendingSend, SendError> {
        validate_content(&content, self.max_message_chars)?;
        let chat = self
            .registry
            .get(chat_id)
            .ok_or_else(|| SendError::UnknownChat(chat_id.clone()))?;
        self.authorize(&chat).await?;

        let message = Message::provisional(
            chat_id.clone(),
            self.local_user.clone(),
            content,
            message_type,
            reply_to,
        );
        self.store.append(message.clone());
        self.bus.emit(ClientEvent::NewMessage {
            chat_id: chat_id.clone(),
            message_id: message.id.clone(),
        });
        info!(chat = %chat_id, msg_id = %message.id, "Message accepted, sending");

        let completion = self.dispatch(message.clone());
        Ok(PendingSend {
            message,
            completion,
        })
    }

    /// Resend a `failed` message under its original provisional id.
    pub async fn retry(&self, message_id: &MessageId) -> Result<PendingSend, SendError> {
        let message = self
            .store
            .get(message_id)
            .filter(|m| m.delivery == DeliveryState::Failed && m.is_provisional())
            .ok_or_else(|| SendError::NotRetryable(message_id.clone()))?;
        let chat = self
            .registry
            .get(&message.chat_id)
            .ok_or_else(|| SendError::UnknownChat(message.chat_id.clone()))?;
        self.authorize(&chat).await?;

        // A concurrent retry may have won.
        if !self.delivery.transition(message_id, DeliveryState::Sending) {
            return Err(SendError::NotRetryable(message_id.clone()));
        }
        self.bus.emit(ClientEvent::DeliveryChanged {
            chat_id: message.chat_id.clone(),
            message_id: message_id.clone(),
            state: DeliveryState::Sending,
        });
        info!(chat = %message.chat_id, msg_id = %message_id, "Retrying failed message");

        let message = Message {
            delivery: DeliveryState::Sending,
            ..message
        };
        let completion = self.dispatch(message.clone());
        Ok(PendingSend {
            message,
            completion,
        })
    }

    async fn authorize(&self, chat: &Chat) -> Result<(), SendError> {
        let permission = self.gate.evaluate_chat(chat).await;
        if permission.can_message {
            return Ok(());
        }
        let reason = permission
            .reason
            .unwrap_or_else(|| "messaging not permitted".to_string());
        info!(chat = %chat.id, %reason, "Send blocked by permission gate");
        Err(SendError::PermissionDenied { reason })
    }

    fn dispatch(&self, message: Message) -> JoinHandle<SendOutcome> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.deliver(message).await })
    }

    async fn deliver(&self, message: Message) -> SendOutcome {
        let provisional_id = message.id.clone();
        let chat_id = message.chat_id.clone();
        let request = build_request(&message);

        match self.source.send_message(&chat_id, &request).await {
            Ok(dto) => {
                // Swapped in already `sent`, so a receipt can never observe
                // the confirmed id in `sending`.
                let mut confirmed = Message::from_dto(dto, DeliveryState::Sent);
                confirmed.chat_id = chat_id.clone();
                let message_id = confirmed.id.clone();

                if self.store.contains(&message_id) && !self.store.contains(&provisional_id) {
                    debug!(msg_id = %provisional_id, final_id = %message_id, "Already reconciled by echo");
                } else if self.store.replace_provisional(&provisional_id, confirmed) {
                    self.bus.emit(ClientEvent::MessageReconciled {
                        chat_id: chat_id.clone(),
                        provisional_id: provisional_id.clone(),
                        message_id: message_id.clone(),
                    });
                    if let Some(state) = self.delivery.state(&message_id) {
                        self.bus.emit(ClientEvent::DeliveryChanged {
                            chat_id: chat_id.clone(),
                            message_id: message_id.clone(),
                            state,
                        });
                    }
                }
                info!(chat = %chat_id, msg_id = %provisional_id, final_id = %message_id, "Message confirmed");
                SendOutcome::Confirmed {
                    provisional_id,
                    message_id,
                }
            }
            Err(e) => {
                warn!(chat = %chat_id, msg_id = %provisional_id, error = %e, "Send failed");
                if self.delivery.transition(&provisional_id, DeliveryState::Failed) {
                    self.bus.emit(ClientEvent::DeliveryChanged {
                        chat_id,
                        message_id: provisional_id.clone(),
                        state: DeliveryState::Failed,
                    });
                }
                SendOutcome::NetworkFailure {
                    provisional_id,
                    error: e.to_string(),
                }
            }
        }
    }
}

fn build_request(message: &Message) -> SendMessageRequest {
    let client_id = match &message.id {
        MessageId::Provisional(uuid) => *uuid,
        MessageId::Server(_) => Uuid::new_v4(),
    };
    // The server cannot resolve a reply to an unconfirmed message.
    let reply_to = match &message.reply_to {
        Some(MessageId::Server(id)) => Some(id.clone()),
        Some(MessageId::Provisional(_)) => {
            debug!(msg_id = %message.id, "Dropping reply to unconfirmed message");
            None
        }
        None => None,
    };
    SendMessageRequest {
        content: message.content.clone(),
        message_type: message.message_type,
        reply_to,
        client_id,
    }
}
