//! Per-chat ordered message logs.
//!
//! Each chat's log sits behind its own mutex; every mutation of a chat's
//! messages runs while holding it, which makes the lock the chat's
//! serialization domain. A store-wide index maps message ids to chats so
//! that duplicates are detected regardless of which chat they claim.
//!
//! Lock order is always chat log, then index.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use parley_shared::types::{ChatId, DeliveryState, MessageId, MessageType, UserId};

use crate::error::{Result, StoreError};
use crate::models::{Message, MessageEdit};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    created_at: DateTime<Utc>,
    id: MessageId,
}

impl SortKey {
    fn of(message: &Message) -> Self {
        Self {
            created_at: message.created_at,
            id: message.id.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct ChatLog {
    order: BTreeSet<SortKey>,
    messages: HashMap<MessageId, Message>,
}

impl ChatLog {
    fn insert(&mut self, message: Message) {
        self.order.insert(SortKey::of(&message));
        self.messages.insert(message.id.clone(), message);
    }

    fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let message = self.messages.remove(id)?;
        self.order.remove(&SortKey::of(&message));
        Some(message)
    }

    fn ordered(&self) -> impl DoubleEndedIterator<Item = &Message> {
        self.order.iter().filter_map(|key| self.messages.get(&key.id))
    }
}

/// Authoritative owner of every message the client knows about.
#[derive(Debug, Default)]
pub struct MessageStore {
    chats: RwLock<HashMap<ChatId, Arc<Mutex<ChatLog>>>>,
    index: RwLock<HashMap<MessageId, ChatId>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message unless its id is already known.
    ///
    /// Returns `false` for duplicates. This is the only dedup point for both
    /// pushed and locally created messages, so at-least-once delivery from
    /// the transport is harmless.
    pub fn append(&self, message: Message) -> bool {
        let log = self.log_or_create(&message.chat_id);
        let mut log = lock(&log);

        match write(&self.index).entry(message.id.clone()) {
            Entry::Occupied(_) => {
                debug!(msg_id = %message.id, chat = %message.chat_id, "Duplicate message ignored");
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(message.chat_id.clone());
            }
        }

        debug!(msg_id = %message.id, chat = %message.chat_id, "Message appended");
        log.insert(message);
        true
    }

    /// Swap a provisional entry for its server-confirmed counterpart.
    ///
    /// Reactions recorded on the placeholder carry over and the further of
    /// the two delivery states is kept. If the confirmed id is already
    /// present (its echo won the race) the placeholder is simply dropped.
    /// Returns `false` when the provisional id is unknown.
    pub fn replace_provisional(&self, provisional_id: &MessageId, final_message: Message) -> bool {
        let Some(log) = self.log(&final_message.chat_id) else {
            warn!(msg_id = %provisional_id, chat = %final_message.chat_id, "Reconcile for unknown chat");
            return false;
        };
        let mut log = lock(&log);

        let Some(placeholder) = log.remove(provisional_id) else {
            warn!(
                msg_id = %provisional_id,
                final_id = %final_message.id,
                "Provisional message not found, already reconciled or evicted"
            );
            return false;
        };

        let mut index = write(&self.index);
        index.remove(provisional_id);

        if let Some(existing) = log.messages.get_mut(&final_message.id) {
            existing.reactions.merge(placeholder.reactions);
            debug!(
                msg_id = %provisional_id,
                final_id = %final_message.id,
                "Confirmed message already present, dropped placeholder"
            );
            return true;
        }

        let mut confirmed = final_message;
        confirmed.reactions.merge(placeholder.reactions);
        if placeholder.delivery.rank() > confirmed.delivery.rank() {
            confirmed.delivery = placeholder.delivery;
        }

        index.insert(confirmed.id.clone(), confirmed.chat_id.clone());
        debug!(msg_id = %provisional_id, final_id = %confirmed.id, "Provisional message reconciled");
        log.insert(confirmed);
        true
    }

    /// Snapshot of a chat's messages ordered by `(created_at, id)`.
    pub fn list(&self, chat_id: &ChatId) -> Vec<Message> {
        match self.log(chat_id) {
            Some(log) => lock(&log).ordered().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn get(&self, id: &MessageId) -> Option<Message> {
        self.with_message(id, Message::clone)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        read(&self.index).contains_key(id)
    }

    /// The chat a message belongs to.
    pub fn chat_of(&self, id: &MessageId) -> Option<ChatId> {
        read(&self.index).get(id).cloned()
    }

    pub fn last_message(&self, chat_id: &ChatId) -> Option<Message> {
        let log = self.log(chat_id)?;
        let log = lock(&log);
        let last = log.ordered().next_back().cloned();
        last
    }

    pub fn message_count(&self, chat_id: &ChatId) -> usize {
        self.log(chat_id).map_or(0, |log| lock(&log).messages.len())
    }

    /// Messages authored by others that have not reached `read`.
    pub fn unread_count(&self, chat_id: &ChatId, local: &UserId) -> usize {
        self.log(chat_id).map_or(0, |log| {
            lock(&log)
                .messages
                .values()
                .filter(|m| m.sender_id != *local && !m.delivery.is_read())
                .count()
        })
    }

    /// Oldest unconfirmed message by `sender` in `chat_id` with matching
    /// content and type. Used to pair a pushed echo with its placeholder
    /// when the server did not echo the provisional id.
    pub fn find_pending_echo(
        &self,
        chat_id: &ChatId,
        sender: &UserId,
        content: &str,
        message_type: MessageType,
    ) -> Option<MessageId> {
        let log = self.log(chat_id)?;
        let log = lock(&log);
        let found = log
            .ordered()
            .find(|m| {
                m.is_provisional()
                    && matches!(m.delivery, DeliveryState::Sending | DeliveryState::Failed)
                    && m.sender_id == *sender
                    && m.message_type == message_type
                    && m.content == content
            })
            .map(|m| m.id.clone());
        found
    }

    /// Replace a message's content, keeping the previous version in its
    /// history.
    pub fn edit(&self, id: &MessageId, content: String, at: DateTime<Utc>) -> Result<Message> {
        if content.trim().is_empty() {
            return Err(StoreError::EmptyEdit);
        }
        self.with_message_mut(id, |message| {
            let previous = std::mem::replace(&mut message.content, content);
            message.edit_history.push(MessageEdit {
                content: previous,
                replaced_at: at,
            });
            message.edited = true;
            message.clone()
        })
        .ok_or_else(|| StoreError::MessageNotFound(id.clone()))
    }

    pub fn chat_ids(&self) -> Vec<ChatId> {
        read(&self.chats).keys().cloned().collect()
    }

    /// Run `f` against a message inside its chat's serialized context.
    ///
    /// `f` must not change `id`, `chat_id` or `created_at`, which key the
    /// ordering and the index.
    pub(crate) fn with_message_mut<R>(
        &self,
        id: &MessageId,
        f: impl FnOnce(&mut Message) -> R,
    ) -> Option<R> {
        let chat_id = self.chat_of(id)?;
        let log = self.log(&chat_id)?;
        let mut log = lock(&log);
        log.messages.get_mut(id).map(f)
    }

    fn with_message<R>(&self, id: &MessageId, f: impl FnOnce(&Message) -> R) -> Option<R> {
        let chat_id = self.chat_of(id)?;
        let log = self.log(&chat_id)?;
        let log = lock(&log);
        log.messages.get(id).map(f)
    }

    fn log(&self, chat_id: &ChatId) -> Option<Arc<Mutex<ChatLog>>> {
        read(&self.chats).get(chat_id).cloned()
    }

    fn log_or_create(&self, chat_id: &ChatId) -> Arc<Mutex<ChatLog>> {
        if let Some(log) = self.log(chat_id) {
            return log;
        }
        write(&self.chats)
            .entry(chat_id.clone())
            .or_default()
            .clone()
    }
}

// A panic while holding a lock leaves the maps structurally intact, so the
// poison flag is ignored.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
