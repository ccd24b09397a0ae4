//! Domain model structs held by the in-memory store.
//!
//! Every struct derives `Serialize` and `Deserialize` so snapshots can be
//! handed directly to the UI layer.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::protocol::{ChatDto, IncomingMessage, MessageDto, ParticipantDto};
use parley_shared::types::{ChatId, ChatKind, DeliveryState, MessageId, MessageType, UserId};

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// A known user. Only `online` changes after creation (presence events).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: UserId,
    pub display_name: String,
    /// Opaque avatar reference (URL or blob hash).
    pub avatar: Option<String>,
    pub online: bool,
}

impl From<ParticipantDto> for Participant {
    fn from(p: ParticipantDto) -> Self {
        Self {
            id: p.id,
            display_name: p.display_name,
            avatar: p.avatar,
            online: p.online,
        }
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A direct or group conversation.
///
/// Permission status is not stored here: direct chats are always re-checked
/// through the permission gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub id: ChatId,
    pub kind: ChatKind,
    pub name: Option<String>,
    pub participants: BTreeSet<UserId>,
    pub created_at: DateTime<Utc>,
    pub pinned: bool,
    pub muted: bool,
    pub archived: bool,
}

impl Chat {
    pub fn from_dto(dto: &ChatDto) -> Self {
        Self {
            id: dto.id.clone(),
            kind: dto.kind,
            name: dto.name.clone(),
            participants: dto.participants.iter().map(|p| p.id.clone()).collect(),
            created_at: dto.created_at,
            pinned: dto.pinned,
            muted: dto.muted,
            archived: dto.archived,
        }
    }

    /// The other participant of a direct chat.
    pub fn peer_of(&self, local: &UserId) -> Option<&UserId> {
        if self.kind != ChatKind::Direct {
            return None;
        }
        self.participants.iter().find(|p| *p != local)
    }
}

// ---------------------------------------------------------------------------
// Reactions
// ---------------------------------------------------------------------------

/// Emoji -> set of users who reacted with it. Emojis with no users are
/// never kept, so removing the last reaction restores an empty map.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Reactions(BTreeMap<String, BTreeSet<UserId>>);

impl Reactions {
    /// Returns `true` if the reaction is now present.
    pub fn toggle(&mut self, user: &UserId, emoji: &str) -> bool {
        if self.contains(user, emoji) {
            self.remove(user, emoji);
            false
        } else {
            self.add(user, emoji);
            true
        }
    }

    pub fn add(&mut self, user: &UserId, emoji: &str) -> bool {
        self.0
            .entry(emoji.to_string())
            .or_default()
            .insert(user.clone())
    }

    pub fn remove(&mut self, user: &UserId, emoji: &str) -> bool {
        let Some(users) = self.0.get_mut(emoji) else {
            return false;
        };
        let removed = users.remove(user);
        if users.is_empty() {
            self.0.remove(emoji);
        }
        removed
    }

    pub fn contains(&self, user: &UserId, emoji: &str) -> bool {
        self.0.get(emoji).is_some_and(|users| users.contains(user))
    }

    pub fn count(&self, emoji: &str) -> usize {
        self.0.get(emoji).map_or(0, BTreeSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Union another reaction set into this one.
    pub fn merge(&mut self, other: Reactions) {
        for (emoji, users) in other.0 {
            self.0.entry(emoji).or_default().extend(users);
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One prior version of an edited message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEdit {
    pub content: String,
    pub replaced_at: DateTime<Utc>,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Server id once acknowledged, provisional id before that.
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
    pub delivery: DeliveryState,
    pub reply_to: Option<MessageId>,
    pub edited: bool,
    /// Previous contents, oldest first.
    pub edit_history: Vec<MessageEdit>,
    pub reactions: Reactions,
}

impl Message {
    /// A locally created message awaiting server confirmation.
    pub fn provisional(
        chat_id: ChatId,
        sender_id: UserId,
        content: String,
        message_type: MessageType,
        reply_to: Option<MessageId>,
    ) -> Self {
        Self {
            id: MessageId::new_provisional(),
            chat_id,
            sender_id,
            content,
            message_type,
            created_at: Utc::now(),
            delivery: DeliveryState::Sending,
            reply_to,
            edited: false,
            edit_history: Vec::new(),
            reactions: Reactions::default(),
        }
    }

    pub fn from_dto(dto: MessageDto, delivery: DeliveryState) -> Self {
        Self {
            id: MessageId::Server(dto.id),
            chat_id: dto.chat_id,
            sender_id: dto.sender_id,
            content: dto.content,
            message_type: dto.message_type,
            created_at: dto.created_at,
            delivery,
            reply_to: dto.reply_to.map(MessageId::Server),
            edited: false,
            edit_history: Vec::new(),
            reactions: Reactions::default(),
        }
    }

    pub fn from_incoming(incoming: IncomingMessage, delivery: DeliveryState) -> Self {
        Self {
            id: incoming.message_id,
            chat_id: incoming.chat_id,
            sender_id: incoming.sender_id,
            content: incoming.content,
            message_type: incoming.message_type,
            created_at: incoming.timestamp,
            delivery,
            reply_to: incoming.reply_to,
            edited: false,
            edit_history: Vec::new(),
            reactions: Reactions::default(),
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.id.is_provisional()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reactions_toggle_restores_empty() {
        let mut reactions = Reactions::default();
        let alice = UserId::new("alice");
        assert!(reactions.toggle(&alice, "👍"));
        assert_eq!(reactions.count("👍"), 1);
        assert!(!reactions.toggle(&alice, "👍"));
        assert!(reactions.is_empty());
        assert_eq!(reactions, Reactions::default());
    }

    #[test]
    fn test_reactions_multiple_emojis_per_user() {
        let mut reactions = Reactions::default();
        let alice = UserId::new("alice");
        reactions.add(&alice, "👍");
        reactions.add(&alice, "❤️");
        assert!(reactions.contains(&alice, "👍"));
        assert!(reactions.contains(&alice, "❤️"));
        assert!(!reactions.add(&alice, "👍"));
        assert_eq!(reactions.count("👍"), 1);
    }

    #[test]
    fn test_direct_chat_peer() {
        let dto = ChatDto {
            id: ChatId::new("c1"),
            kind: ChatKind::Direct,
            participants: vec![
                ParticipantDto {
                    id: UserId::new("alice"),
                    display_name: "Alice".into(),
                    avatar: None,
                    online: true,
                },
                ParticipantDto {
                    id: UserId::new("bob"),
                    display_name: "Bob".into(),
                    avatar: None,
                    online: false,
                },
            ],
            name: None,
            created_at: Utc::now(),
            pinned: false,
            muted: false,
            archived: false,
        };
        let chat = Chat::from_dto(&dto);
        assert_eq!(chat.peer_of(&UserId::new("alice")), Some(&UserId::new("bob")));
    }
}
