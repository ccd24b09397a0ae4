use thiserror::Error;

use parley_shared::types::MessageId;

/// Errors produced by the store layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No message with this id is held by the store.
    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    /// An edit would leave the message without content.
    #[error("Edited content is empty")]
    EmptyEdit,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
