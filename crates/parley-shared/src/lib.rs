//! Types, wire schema and error taxonomy shared by every Parley crate.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{DecodeError, IllegalTransition, ValidationError};
pub use types::{ChatId, ChatKind, DeliveryState, MessageId, MessageType, UserId};
