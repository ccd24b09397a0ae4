//! Delivery lifecycle enforcement.
//!
//! Legal moves are one step along `sending -> sent -> delivered -> read`,
//! `sending -> failed`, and the manual retry edge `failed -> sending`.
//! Everything else is an [`IllegalTransition`] and leaves the message
//! untouched.

use std::sync::Arc;

use tracing::{debug, warn};

use parley_shared::error::IllegalTransition;
use parley_shared::types::{DeliveryState, MessageId};

use crate::messages::MessageStore;

/// Validate a single delivery state change.
pub fn check_transition(from: DeliveryState, to: DeliveryState) -> Result<(), IllegalTransition> {
    use DeliveryState::*;

    match (from, to) {
        (Sending, Sent) | (Sent, Delivered) | (Delivered, Read) => Ok(()),
        (Sending, Failed) | (Failed, Sending) => Ok(()),
        _ => Err(IllegalTransition { from, to }),
    }
}

/// Applies delivery transitions to messages owned by a [`MessageStore`].
#[derive(Debug, Clone)]
pub struct DeliveryStateMachine {
    store: Arc<MessageStore>,
}

impl DeliveryStateMachine {
    pub fn new(store: Arc<MessageStore>) -> Self {
        Self { store }
    }

    /// Move a message to `new_state`.
    ///
    /// Returns `true` if the state changed. Unknown messages, repeats of the
    /// current state and illegal moves all return `false`; only the last is
    /// logged as an anomaly.
    pub fn transition(&self, message_id: &MessageId, new_state: DeliveryState) -> bool {
        let outcome = self.store.with_message_mut(
            message_id,
            |message| -> Result<DeliveryState, Option<IllegalTransition>> {
                let from = message.delivery;
                if from == new_state {
                    return Err(None);
                }
                check_transition(from, new_state).map_err(Some)?;
                message.delivery = new_state;
                Ok(from)
            },
        );

        match outcome {
            None => {
                debug!(msg_id = %message_id, to = %new_state, "Transition for unknown message");
                false
            }
            Some(Ok(from)) => {
                debug!(msg_id = %message_id, %from, to = %new_state, "Delivery state changed");
                true
            }
            Some(Err(None)) => {
                debug!(msg_id = %message_id, state = %new_state, "Repeated delivery state ignored");
                false
            }
            Some(Err(Some(anomaly))) => {
                warn!(msg_id = %message_id, transition = %anomaly, "Illegal delivery transition rejected");
                false
            }
        }
    }

    pub fn state(&self, message_id: &MessageId) -> Option<DeliveryState> {
        self.store.get(message_id).map(|m| m.delivery)
    }
}
