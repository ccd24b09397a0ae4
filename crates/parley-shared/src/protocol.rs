//! Wire schema shared by the transport layer and the ingest pipeline.
//!
//! Push events arrive as `{ "type": ..., "data": { ... } }` JSON frames with
//! camelCase fields. Every field of `data` is optional on the wire; the
//! per-type requirements are enforced by [`InboundEvent::decode`], which is
//! the only way a frame becomes an internal update.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DecodeError;
use crate::types::{ChatId, ChatKind, DeliveryState, MessageId, MessageType, UserId};

pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_REACTION: &str = "reaction";
pub const EVENT_PRESENCE: &str = "presence";
pub const EVENT_READ_RECEIPT: &str = "read-receipt";
pub const EVENT_DELIVERY_RECEIPT: &str = "delivery-receipt";
pub const EVENT_CONNECTION: &str = "connection";
pub const EVENT_MESSAGE_EDIT: &str = "message-edit";

// ---------------------------------------------------------------------------
// Raw push frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: RawEventData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEventData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<RawTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Provisional id the sender attached to its own send, echoed back.
    /// Kept as text; values that are not UUIDs are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// `add` or `remove` for reactions; absent means add.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// Servers send either epoch milliseconds or RFC 3339 strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Millis(i64),
    Text(String),
}

impl RawTimestamp {
    fn parse(&self) -> Result<DateTime<Utc>, DecodeError> {
        match self {
            Self::Millis(ms) => Utc.timestamp_millis_opt(*ms).single().ok_or_else(|| {
                DecodeError::InvalidField {
                    field: "timestamp",
                    value: ms.to_string(),
                }
            }),
            Self::Text(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| DecodeError::InvalidField {
                    field: "timestamp",
                    value: s.clone(),
                }),
        }
    }
}

impl From<DateTime<Utc>> for RawTimestamp {
    fn from(ts: DateTime<Utc>) -> Self {
        Self::Text(ts.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Normalized events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Inbound reactions assert server state, so both actions are idempotent.
pub enum ReactionAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub reply_to: Option<MessageId>,
    pub client_id: Option<Uuid>,
}

/// A validated push event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message(IncomingMessage),
    Reaction {
        chat_id: ChatId,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
        action: ReactionAction,
    },
    Presence {
        user_id: UserId,
        online: bool,
    },
    Receipt {
        chat_id: ChatId,
        message_id: MessageId,
        state: DeliveryState,
    },
    Connection {
        peer_id: UserId,
    },
    Edit {
        chat_id: ChatId,
        message_id: MessageId,
        content: String,
        timestamp: DateTime<Utc>,
    },
}

impl InboundEvent {
    /// Parse and validate a raw JSON frame.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let event: RawEvent = serde_json::from_str(raw)?;
        Self::from_raw(event)
    }

    pub fn from_raw(event: RawEvent) -> Result<Self, DecodeError> {
        let RawEvent { kind, data } = event;
        match kind.as_str() {
            EVENT_MESSAGE => {
                let message_type = match data.message_type.as_deref() {
                    None => MessageType::Text,
                    Some(s) => MessageType::parse(s).ok_or_else(|| DecodeError::InvalidField {
                        field: "messageType",
                        value: s.to_string(),
                    })?,
                };
                Ok(Self::Message(IncomingMessage {
                    chat_id: ChatId(require(EVENT_MESSAGE, "chatId", data.chat_id)?),
                    message_id: MessageId::Server(require(
                        EVENT_MESSAGE,
                        "messageId",
                        data.message_id,
                    )?),
                    sender_id: UserId(require(EVENT_MESSAGE, "senderId", data.sender_id)?),
                    content: require(EVENT_MESSAGE, "content", data.content)?,
                    message_type,
                    timestamp: require(EVENT_MESSAGE, "timestamp", data.timestamp)?.parse()?,
                    reply_to: data.reply_to.map(MessageId::Server),
                    client_id: data
                        .client_id
                        .as_deref()
                        .and_then(|s| Uuid::parse_str(s).ok()),
                }))
            }
            EVENT_REACTION => {
                let action = match data.action.as_deref() {
                    None | Some("add") => ReactionAction::Add,
                    Some("remove") => ReactionAction::Remove,
                    Some(other) => {
                        return Err(DecodeError::InvalidField {
                            field: "action",
                            value: other.to_string(),
                        })
                    }
                };
                Ok(Self::Reaction {
                    chat_id: ChatId(require(EVENT_REACTION, "chatId", data.chat_id)?),
                    message_id: MessageId::Server(require(
                        EVENT_REACTION,
                        "messageId",
                        data.message_id,
                    )?),
                    user_id: UserId(require(
                        EVENT_REACTION,
                        "userId",
                        data.user_id.or(data.sender_id),
                    )?),
                    emoji: require(EVENT_REACTION, "emoji", data.emoji.filter(|e| !e.is_empty()))?,
                    action,
                })
            }
            EVENT_PRESENCE => Ok(Self::Presence {
                user_id: UserId(require(
                    EVENT_PRESENCE,
                    "userId",
                    data.user_id.or(data.sender_id),
                )?),
                online: data.online.unwrap_or(true),
            }),
            EVENT_READ_RECEIPT | EVENT_DELIVERY_RECEIPT => {
                let (event, state) = if kind == EVENT_READ_RECEIPT {
                    (EVENT_READ_RECEIPT, DeliveryState::Read)
                } else {
                    (EVENT_DELIVERY_RECEIPT, DeliveryState::Delivered)
                };
                Ok(Self::Receipt {
                    chat_id: ChatId(require(event, "chatId", data.chat_id)?),
                    message_id: MessageId::Server(require(event, "messageId", data.message_id)?),
                    state,
                })
            }
            EVENT_CONNECTION => Ok(Self::Connection {
                peer_id: UserId(require(
                    EVENT_CONNECTION,
                    "userId",
                    data.user_id.or(data.sender_id),
                )?),
            }),
            EVENT_MESSAGE_EDIT => Ok(Self::Edit {
                chat_id: ChatId(require(EVENT_MESSAGE_EDIT, "chatId", data.chat_id)?),
                message_id: MessageId::Server(require(
                    EVENT_MESSAGE_EDIT,
                    "messageId",
                    data.message_id,
                )?),
                content: require(EVENT_MESSAGE_EDIT, "content", data.content)?,
                timestamp: match data.timestamp {
                    Some(ts) => ts.parse()?,
                    None => Utc::now(),
                },
            }),
            _ => Err(DecodeError::UnknownType(kind)),
        }
    }

    /// The existing message this event mutates, if any.
    pub fn target_message(&self) -> Option<&MessageId> {
        match self {
            Self::Reaction { message_id, .. }
            | Self::Receipt { message_id, .. }
            | Self::Edit { message_id, .. } => Some(message_id),
            Self::Message(_) | Self::Presence { .. } | Self::Connection { .. } => None,
        }
    }

    pub fn chat_id(&self) -> Option<&ChatId> {
        match self {
            Self::Message(m) => Some(&m.chat_id),
            Self::Reaction { chat_id, .. }
            | Self::Receipt { chat_id, .. }
            | Self::Edit { chat_id, .. } => Some(chat_id),
            Self::Presence { .. } | Self::Connection { .. } => None,
        }
    }
}

fn require<T>(event: &'static str, field: &'static str, value: Option<T>) -> Result<T, DecodeError> {
    value.ok_or(DecodeError::MissingField { event, field })
}

// ---------------------------------------------------------------------------
// REST payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantDto {
    pub id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatDto {
    pub id: ChatId,
    pub kind: ChatKind,
    pub participants: Vec<ParticipantDto>,
    #[serde(default)]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub archived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageDto {
    pub id: String,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChatRequest {
    pub participant_ids: Vec<UserId>,
    pub kind: ChatKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub client_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CanMessageResponse {
    pub can_message: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_message_event() {
        let raw = r#"{"type":"message","data":{"chatId":"c1","messageId":"msg-1",
            "senderId":"bob","content":"hi","messageType":"image",
            "timestamp":"2024-05-01T10:00:00Z"}}"#;
        match InboundEvent::decode(raw).unwrap() {
            InboundEvent::Message(m) => {
                assert_eq!(m.chat_id, ChatId::new("c1"));
                assert_eq!(m.message_id, MessageId::server("msg-1"));
                assert_eq!(m.message_type, MessageType::Image);
                assert_eq!(m.client_id, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_decode_millis_timestamp() {
        let raw = r#"{"type":"message","data":{"chatId":"c1","messageId":"m",
            "senderId":"bob","content":"x","timestamp":1714557600000}}"#;
        let InboundEvent::Message(m) = InboundEvent::decode(raw).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(m.timestamp.timestamp_millis(), 1_714_557_600_000);
        assert_eq!(m.message_type, MessageType::Text);
    }

    #[test]
    fn test_missing_field_rejected() {
        let raw = r#"{"type":"message","data":{"chatId":"c1","senderId":"bob"}}"#;
        let err = InboundEvent::decode(raw).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MissingField {
                field: "messageId",
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = InboundEvent::decode(r#"{"type":"typing","data":{}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType(t) if t == "typing"));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            InboundEvent::decode("not json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_receipt_states() {
        let read = r#"{"type":"read-receipt","data":{"chatId":"c","messageId":"m"}}"#;
        let delivered = r#"{"type":"delivery-receipt","data":{"chatId":"c","messageId":"m"}}"#;
        assert!(matches!(
            InboundEvent::decode(read).unwrap(),
            InboundEvent::Receipt {
                state: DeliveryState::Read,
                ..
            }
        ));
        assert!(matches!(
            InboundEvent::decode(delivered).unwrap(),
            InboundEvent::Receipt {
                state: DeliveryState::Delivered,
                ..
            }
        ));
    }

    #[test]
    fn test_reaction_without_action_is_add() {
        let raw = r#"{"type":"reaction","data":{"chatId":"c","messageId":"m",
            "userId":"u","emoji":"👍"}}"#;
        assert!(matches!(
            InboundEvent::decode(raw).unwrap(),
            InboundEvent::Reaction {
                action: ReactionAction::Add,
                ..
            }
        ));
    }

    #[test]
    fn test_non_uuid_client_id_ignored() {
        let raw = r#"{"type":"message","data":{"chatId":"c1","messageId":"m",
            "senderId":"bob","content":"x","timestamp":1714557600000,
            "clientId":"tmp-17"}}"#;
        let InboundEvent::Message(m) = InboundEvent::decode(raw).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(m.client_id, None);

        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"message","data":{{"chatId":"c1","messageId":"m","senderId":"bob","content":"x","timestamp":1714557600000,"clientId":"{id}"}}}}"#
        );
        let InboundEvent::Message(m) = InboundEvent::decode(&raw).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(m.client_id, Some(id));
    }

    #[test]
    fn test_reaction_bad_action() {
        let raw = r#"{"type":"reaction","data":{"chatId":"c","messageId":"m",
            "userId":"u","emoji":"👍","action":"replace"}}"#;
        assert!(matches!(
            InboundEvent::decode(raw),
            Err(DecodeError::InvalidField { field: "action", .. })
        ));
    }

    #[test]
    fn test_presence_falls_back_to_sender() {
        let raw = r#"{"type":"presence","data":{"senderId":"bob","online":false}}"#;
        assert_eq!(
            InboundEvent::decode(raw).unwrap(),
            InboundEvent::Presence {
                user_id: UserId::new("bob"),
                online: false
            }
        );
    }
}
