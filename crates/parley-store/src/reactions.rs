use std::sync::Arc;

use tracing::debug;

use parley_shared::types::{MessageId, UserId};

use crate::messages::MessageStore;
use crate::models::Reactions;

/// Per-message emoji tallies, mutated through the owning [`MessageStore`].
#[derive(Debug, Clone)]
pub struct ReactionAggregator {
    store: Arc<MessageStore>,
}

impl ReactionAggregator {
    pub fn new(store: Arc<MessageStore>) -> Self {
        Self { store }
    }

    /// Add the reaction if absent, remove it otherwise. Distinct emojis are
    /// independent, so a user may hold several on one message.
    ///
    /// Returns whether the reaction is now present, or `None` if the
    /// message is unknown.
    pub fn toggle(&self, message_id: &MessageId, user_id: &UserId, emoji: &str) -> Option<bool> {
        let present = self
            .store
            .with_message_mut(message_id, |m| m.reactions.toggle(user_id, emoji))?;
        debug!(msg_id = %message_id, user = %user_id, emoji, present, "Reaction toggled");
        Some(present)
    }

    /// Idempotent add. Returns whether the set changed.
    pub fn add(&self, message_id: &MessageId, user_id: &UserId, emoji: &str) -> Option<bool> {
        self.store
            .with_message_mut(message_id, |m| m.reactions.add(user_id, emoji))
    }

    /// Idempotent remove. Returns whether the set changed.
    pub fn remove(&self, message_id: &MessageId, user_id: &UserId, emoji: &str) -> Option<bool> {
        self.store
            .with_message_mut(message_id, |m| m.reactions.remove(user_id, emoji))
    }

    pub fn reactions(&self, message_id: &MessageId) -> Option<Reactions> {
        self.store.get(message_id).map(|m| m.reactions)
    }
}
