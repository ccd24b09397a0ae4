//! # parley-client
//!
//! Connection-gated messaging client core: optimistic sends, push-event
//! ingestion and the permission gate, driven through [`ChatClient`].

pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod permission;
pub mod registry;
pub mod send;
pub mod source;
pub mod state;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::ClientConfig;
pub use error::{ClientError, SendError, SourceError};
pub use events::{ClientEvent, EventBus};
pub use ingest::{IngestOutcome, RealtimeIngest};
pub use permission::{ChatPermission, PermissionDecision, PermissionGate};
pub use registry::{ChatFilter, ChatRegistry, ChatSummary};
pub use send::{OptimisticSendPipeline, PendingSend, SendOutcome};
pub use source::{DataSource, FixtureDataSource, HttpDataSource};
pub use state::ChatClient;

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("parley_client=debug,parley_store=info,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
