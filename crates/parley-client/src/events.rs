//! State-change notifications for the UI layer.
//!
//! Notifications only say *what* changed; subscribers re-read the
//! registry and store snapshots to re-render.

use serde::Serialize;
use tokio::sync::broadcast;

use parley_shared::types::{ChatId, DeliveryState, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    NewMessage {
        chat_id: ChatId,
        message_id: MessageId,
    },
    MessageReconciled {
        chat_id: ChatId,
        provisional_id: MessageId,
        message_id: MessageId,
    },
    DeliveryChanged {
        chat_id: ChatId,
        message_id: MessageId,
        state: DeliveryState,
    },
    ReactionChanged {
        chat_id: ChatId,
        message_id: MessageId,
    },
    MessageEdited {
        chat_id: ChatId,
        message_id: MessageId,
    },
    PermissionChanged {
        peer_id: UserId,
    },
    PresenceChanged {
        user_id: UserId,
        online: bool,
    },
    ChatsChanged,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ClientEvent) {
        // No subscribers is normal before the UI attaches.
        if self.tx.send(event).is_err() {
            tracing::trace!("No subscribers for client event");
        }
    }
}
