use thiserror::Error;

use parley_shared::error::ValidationError;
use parley_shared::types::{ChatId, MessageId};
use parley_store::StoreError;

/// Failures of the transport behind a [`DataSource`](crate::source::DataSource).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for SourceError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

/// Errors surfaced synchronously by the send pipeline, before any network
/// interaction. Network failures are not here: they become a `failed`
/// message.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Invalid message: {0}")]
    Validation(#[from] ValidationError),

    #[error("Unknown chat: {0}")]
    UnknownChat(ChatId),

    #[error("Message {0} is not in a retryable state")]
    NotRetryable(MessageId),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Data source error: {0}")]
    Source(#[from] SourceError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Unknown chat: {0}")]
    UnknownChat(ChatId),
}
