//! Chat list, participant roster and chat-list ordering.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use parley_shared::protocol::ChatDto;
use parley_shared::types::{ChatId, UserId};
use parley_store::{Chat, Message, MessageStore, Participant};

/// Which chats a list view shows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatFilter {
    /// Everything except archived chats.
    #[default]
    Active,
    Unread,
    Pinned,
    Archived,
    All,
}

impl ChatFilter {
    fn accepts(&self, summary: &ChatSummary) -> bool {
        match self {
            Self::Active => !summary.chat.archived,
            Self::Unread => !summary.chat.archived && summary.unread_count > 0,
            Self::Pinned => summary.chat.pinned,
            Self::Archived => summary.chat.archived,
            Self::All => true,
        }
    }
}

/// One row of the chat list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatSummary {
    pub chat: Chat,
    pub last_message: Option<Message>,
    pub unread_count: usize,
    /// Last message time, or chat creation time for empty chats.
    pub last_activity: DateTime<Utc>,
}

/// Chat-list order: pinned first, then most recent activity, then id.
pub fn compare_summaries(a: &ChatSummary, b: &ChatSummary) -> Ordering {
    b.chat
        .pinned
        .cmp(&a.chat.pinned)
        .then_with(|| b.last_activity.cmp(&a.last_activity))
        .then_with(|| a.chat.id.cmp(&b.chat.id))
}

pub struct ChatRegistry {
    local_user: UserId,
    store: Arc<MessageStore>,
    chats: RwLock<HashMap<ChatId, Chat>>,
    participants: RwLock<HashMap<UserId, Participant>>,
}

impl ChatRegistry {
    pub fn new(local_user: UserId, store: Arc<MessageStore>) -> Self {
        Self {
            local_user,
            store,
            chats: RwLock::new(HashMap::new()),
            participants: RwLock::new(HashMap::new()),
        }
    }

    /// Register a chat and its participants from a backend payload.
    pub fn load_dto(&self, dto: &ChatDto) -> Chat {
        {
            let mut roster = write(&self.participants);
            for p in &dto.participants {
                roster
                    .entry(p.id.clone())
                    .and_modify(|known| known.online = p.online)
                    .or_insert_with(|| Participant::from(p.clone()));
            }
        }
        let chat = Chat::from_dto(dto);
        self.upsert(chat.clone());
        chat
    }

    pub fn upsert(&self, chat: Chat) {
        debug!(chat = %chat.id, kind = ?chat.kind, "Chat registered");
        write(&self.chats).insert(chat.id.clone(), chat);
    }

    pub fn get(&self, chat_id: &ChatId) -> Option<Chat> {
        read(&self.chats).get(chat_id).cloned()
    }

    pub fn contains(&self, chat_id: &ChatId) -> bool {
        read(&self.chats).contains_key(chat_id)
    }

    pub fn len(&self) -> usize {
        read(&self.chats).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The other participant of a direct chat.
    pub fn peer_of(&self, chat_id: &ChatId) -> Option<UserId> {
        read(&self.chats)
            .get(chat_id)
            .and_then(|chat| chat.peer_of(&self.local_user).cloned())
    }

    pub fn set_pinned(&self, chat_id: &ChatId, pinned: bool) -> bool {
        self.update_flags(chat_id, |chat| chat.pinned = pinned)
    }

    pub fn set_muted(&self, chat_id: &ChatId, muted: bool) -> bool {
        self.update_flags(chat_id, |chat| chat.muted = muted)
    }

    pub fn set_archived(&self, chat_id: &ChatId, archived: bool) -> bool {
        self.update_flags(chat_id, |chat| chat.archived = archived)
    }

    fn update_flags(&self, chat_id: &ChatId, f: impl FnOnce(&mut Chat)) -> bool {
        match write(&self.chats).get_mut(chat_id) {
            Some(chat) => {
                f(chat);
                info!(
                    chat = %chat_id,
                    pinned = chat.pinned,
                    muted = chat.muted,
                    archived = chat.archived,
                    "Chat flags updated"
                );
                true
            }
            None => false,
        }
    }

    /// Update a participant's presence. Unknown users are added to the
    /// roster. Returns whether the flag changed.
    pub fn set_online(&self, user_id: &UserId, online: bool) -> bool {
        let mut roster = write(&self.participants);
        let participant = roster.entry(user_id.clone()).or_insert_with(|| Participant {
            id: user_id.clone(),
            display_name: user_id.to_string(),
            avatar: None,
            online: !online,
        });
        let changed = participant.online != online;
        participant.online = online;
        changed
    }

    pub fn participant(&self, user_id: &UserId) -> Option<Participant> {
        read(&self.participants).get(user_id).cloned()
    }

    /// Chat list snapshot. Recomputed from the chat flags and the message
    /// store on every call.
    pub fn resort(&self, filter: ChatFilter) -> Vec<ChatSummary> {
        let chats: Vec<Chat> = read(&self.chats).values().cloned().collect();
        let mut summaries: Vec<ChatSummary> = chats
            .into_iter()
            .map(|chat| self.summarize(chat))
            .filter(|summary| filter.accepts(summary))
            .collect();
        summaries.sort_by(compare_summaries);
        summaries
    }

    fn summarize(&self, chat: Chat) -> ChatSummary {
        let last_message = self.store.last_message(&chat.id);
        let last_activity = last_message
            .as_ref()
            .map_or(chat.created_at, |m| m.created_at);
        ChatSummary {
            unread_count: self.store.unread_count(&chat.id, &self.local_user),
            last_message,
            last_activity,
            chat,
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
