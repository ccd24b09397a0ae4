//! Scripted in-memory backend.
//!
//! Stands in for the live transport in tests and demos: chats and
//! connections are seeded up front, sends are recorded, and push frames are
//! injected by hand.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use parley_shared::constants::RAW_EVENT_CHANNEL_CAPACITY;
use parley_shared::protocol::{
    CanMessageResponse, ChatDto, MessageDto, ParticipantDto, SendMessageRequest,
};
use parley_shared::types::{ChatId, ChatKind, UserId};

use super::DataSource;
use crate::error::SourceError;

#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub chat_id: ChatId,
    pub request: SendMessageRequest,
}

#[derive(Default)]
struct FixtureState {
    local_user: Option<UserId>,
    chats: Vec<ChatDto>,
    permissions: HashMap<UserId, CanMessageResponse>,
    sent: Vec<RecordedSend>,
    permission_checks: usize,
    next_message_id: u64,
    fail_sends: bool,
    fail_permission_checks: bool,
    send_delay: Option<Duration>,
    permission_delay: Option<Duration>,
    event_tx: Option<mpsc::Sender<String>>,
}

#[derive(Default)]
pub struct FixtureDataSource {
    state: Mutex<FixtureState>,
}

impl FixtureDataSource {
    pub fn new(local_user: UserId) -> Self {
        let fixture = Self::default();
        {
            let mut state = fixture.lock();
            state.local_user = Some(local_user);
            state.next_message_id = 1;
        }
        fixture
    }

    fn lock(&self) -> MutexGuard<'_, FixtureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_chat(&self, chat: ChatDto) {
        self.lock().chats.push(chat);
    }

    /// Seed a direct chat between the local user and `peer`.
    pub fn add_direct_chat(&self, chat_id: &str, peer: &str) -> ChatDto {
        let local = self
            .lock()
            .local_user
            .clone()
            .unwrap_or_else(|| UserId::new("local"));
        let chat = ChatDto {
            id: ChatId::new(chat_id),
            kind: ChatKind::Direct,
            participants: vec![participant(local), participant(UserId::new(peer))],
            name: None,
            created_at: Utc::now(),
            pinned: false,
            muted: false,
            archived: false,
        };
        self.add_chat(chat.clone());
        chat
    }

    pub fn set_connected(&self, peer: &str, connected: bool) {
        let response = CanMessageResponse {
            can_message: connected,
            reason: (!connected).then(|| "not connected".to_string()),
        };
        self.lock().permissions.insert(UserId::new(peer), response);
    }

    pub fn set_next_message_id(&self, id: u64) {
        self.lock().next_message_id = id;
    }

    pub fn fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    pub fn fail_permission_checks(&self, fail: bool) {
        self.lock().fail_permission_checks = fail;
    }

    pub fn delay_sends(&self, delay: Duration) {
        self.lock().send_delay = Some(delay);
    }

    pub fn delay_permission_checks(&self, delay: Duration) {
        self.lock().permission_delay = Some(delay);
    }

    pub fn sent(&self) -> Vec<RecordedSend> {
        self.lock().sent.clone()
    }

    pub fn send_count(&self) -> usize {
        self.lock().sent.len()
    }

    pub fn permission_checks(&self) -> usize {
        self.lock().permission_checks
    }

    /// Deliver a raw frame to the open event stream. Returns `false` if no
    /// stream is open.
    pub async fn push_event(&self, raw: impl Into<String>) -> bool {
        let tx = self.lock().event_tx.clone();
        match tx {
            Some(tx) => tx.send(raw.into()).await.is_ok(),
            None => false,
        }
    }

    /// Drop the stream sender, ending the consumer's receive loop.
    pub fn close_stream(&self) {
        self.lock().event_tx = None;
    }
}

fn participant(id: UserId) -> ParticipantDto {
    ParticipantDto {
        display_name: id.to_string(),
        id,
        avatar: None,
        online: false,
    }
}

#[async_trait]
impl DataSource for FixtureDataSource {
    async fn create_chat(
        &self,
        participant_ids: &[UserId],
        kind: ChatKind,
        name: Option<&str>,
    ) -> Result<ChatDto, SourceError> {
        let mut state = self.lock();
        let mut participants: Vec<ParticipantDto> =
            participant_ids.iter().cloned().map(participant).collect();
        if let Some(local) = state.local_user.clone() {
            if !participant_ids.contains(&local) {
                participants.push(participant(local));
            }
        }
        let chat = ChatDto {
            id: ChatId::new(format!("chat-{}", state.chats.len() + 1)),
            kind,
            participants,
            name: name.map(str::to_string),
            created_at: Utc::now(),
            pinned: false,
            muted: false,
            archived: false,
        };
        state.chats.push(chat.clone());
        Ok(chat)
    }

    async fn list_chats(&self) -> Result<Vec<ChatDto>, SourceError> {
        Ok(self.lock().chats.clone())
    }

    async fn send_message(
        &self,
        chat_id: &ChatId,
        request: &SendMessageRequest,
    ) -> Result<MessageDto, SourceError> {
        let delay = self.lock().send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.sent.push(RecordedSend {
            chat_id: chat_id.clone(),
            request: request.clone(),
        });
        if state.fail_sends {
            return Err(SourceError::Unavailable("fixture send failure".into()));
        }

        let id = state.next_message_id;
        state.next_message_id += 1;
        Ok(MessageDto {
            id: format!("msg-{id}"),
            chat_id: chat_id.clone(),
            sender_id: state
                .local_user
                .clone()
                .unwrap_or_else(|| UserId::new("local")),
            content: request.content.clone(),
            message_type: request.message_type,
            created_at: Utc::now(),
            reply_to: request.reply_to.clone(),
        })
    }

    async fn can_message(&self, peer_id: &UserId) -> Result<CanMessageResponse, SourceError> {
        let delay = {
            let mut state = self.lock();
            state.permission_checks += 1;
            state.permission_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        if state.fail_permission_checks {
            return Err(SourceError::Unavailable("fixture permission failure".into()));
        }
        Ok(state
            .permissions
            .get(peer_id)
            .cloned()
            .unwrap_or(CanMessageResponse {
                can_message: false,
                reason: Some("not connected".into()),
            }))
    }

    async fn stream_events(&self) -> Result<mpsc::Receiver<String>, SourceError> {
        let (tx, rx) = mpsc::channel(RAW_EVENT_CHANNEL_CAPACITY);
        self.lock().event_tx = Some(tx);
        Ok(rx)
    }
}
