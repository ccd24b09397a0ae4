//! Headless Parley client.
//!
//! Loads the chat list, follows the push stream and logs every client
//! event until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use parley_client::{ChatClient, ChatFilter, ClientConfig, HttpDataSource};
use parley_shared::constants::APP_NAME;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    parley_client::init_tracing();

    let config = ClientConfig::from_env();
    info!(
        api = %config.api_url,
        ws = %config.ws_url,
        user = %config.user_id,
        "Starting {APP_NAME} headless client"
    );

    let source = HttpDataSource::new(&config).context("Failed to build HTTP client")?;
    let client = ChatClient::new(config, Arc::new(source));

    let count = client
        .bootstrap()
        .await
        .context("Failed to load chat list")?;
    for summary in client.chats(ChatFilter::Active) {
        info!(
            chat = %summary.chat.id,
            unread = summary.unread_count,
            pinned = summary.chat.pinned,
            "Chat"
        );
    }
    info!(count, "Ready");

    let mut events = client.subscribe();
    let stream = client.spawn_event_stream();

    let gate = client.gate().clone();
    let purge_every = client.config().permission_ttl.max(std::time::Duration::from_secs(1));
    let maintenance = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(purge_every);
        loop {
            ticker.tick().await;
            gate.purge_stale().await;
        }
    });

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(event = %json, "Client event"),
                    Err(e) => warn!(error = %e, "Failed to serialize client event"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    stream.abort();
    maintenance.abort();
    Ok(())
}
