use thiserror::Error;

use crate::types::DeliveryState;

/// A push event that could not be turned into an internal update.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed event JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown event type: {0}")]
    UnknownType(String),

    #[error("Event `{event}` is missing required field `{field}`")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },

    #[error("Invalid value for field `{field}`: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Outgoing content rejected before any store mutation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message content is empty")]
    EmptyContent,

    #[error("Message content too long: {len} chars (max {max})")]
    ContentTooLong { len: usize, max: usize },
}

/// A delivery state update that would move a message backwards or skip a
/// step. Logged as an anomaly, never surfaced to the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{from} -> {to}")]
pub struct IllegalTransition {
    pub from: DeliveryState,
    pub to: DeliveryState,
}
