//! # parley-store
//!
//! In-memory message truth for the Parley client.
//!
//! [`MessageStore`] exclusively owns every chat's ordered message log.
//! [`DeliveryStateMachine`] and [`ReactionAggregator`] never hold copies of
//! messages; they mutate delivery state and reactions through the store,
//! inside the owning chat's serialized context.

pub mod delivery;
pub mod messages;
pub mod models;
pub mod reactions;

mod error;

pub use delivery::DeliveryStateMachine;
pub use error::{Result, StoreError};
pub use messages::MessageStore;
pub use models::*;
pub use reactions::ReactionAggregator;
