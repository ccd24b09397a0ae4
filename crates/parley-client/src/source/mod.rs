//! Backend access injected into the client at construction.
//!
//! The live implementation talks REST + WebSocket; the fixture scripts
//! responses for tests. Nothing else in the crate knows which one it has.

pub mod fixture;
pub mod http;

use async_trait::async_trait;
use tokio::sync::mpsc;

use parley_shared::protocol::{CanMessageResponse, ChatDto, MessageDto, SendMessageRequest};
use parley_shared::types::{ChatId, ChatKind, UserId};

use crate::error::SourceError;

pub use fixture::FixtureDataSource;
pub use http::HttpDataSource;

#[async_trait]
pub trait DataSource: Send + Sync {
    async fn create_chat(
        &self,
        participant_ids: &[UserId],
        kind: ChatKind,
        name: Option<&str>,
    ) -> Result<ChatDto, SourceError>;

    async fn list_chats(&self) -> Result<Vec<ChatDto>, SourceError>;

    async fn send_message(
        &self,
        chat_id: &ChatId,
        request: &SendMessageRequest,
    ) -> Result<MessageDto, SourceError>;

    async fn can_message(&self, peer_id: &UserId) -> Result<CanMessageResponse, SourceError>;

    /// Open the push-event stream. Each item is one raw JSON frame.
    async fn stream_events(&self) -> Result<mpsc::Receiver<String>, SourceError>;
}
