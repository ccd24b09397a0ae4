//! Client configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the client can start with zero
//! configuration against a local development backend.

use std::str::FromStr;
use std::time::Duration;

use parley_shared::constants::{
    DEFAULT_API_URL, DEFAULT_WS_URL, EVENT_BUS_CAPACITY, MAX_MESSAGE_CHARS,
    PENDING_EVENT_CAPACITY, PENDING_EVENT_TICK_MS, PENDING_EVENT_TTL_MS, PERMISSION_TIMEOUT_MS,
    PERMISSION_TTL_SECS,
};
use parley_shared::types::UserId;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the REST API.
    /// Env: `PARLEY_API_URL`
    /// Default: `http://127.0.0.1:8080`
    pub api_url: String,

    /// WebSocket endpoint for push events.
    /// Env: `PARLEY_WS_URL`
    /// Default: `ws://127.0.0.1:8080/events`
    pub ws_url: String,

    /// Bearer token issued by the session layer.
    /// Env: `PARLEY_TOKEN`
    pub token: Option<String>,

    /// The local actor.
    /// Env: `PARLEY_USER_ID`
    /// Default: `local`
    pub user_id: UserId,

    /// How long a permission decision is trusted.
    /// Env: `PERMISSION_TTL_SECS`
    pub permission_ttl: Duration,

    /// Remote permission check timeout; expiry fails closed.
    /// Env: `PERMISSION_TIMEOUT_MS`
    pub permission_timeout: Duration,

    /// How long an event for an unknown message is buffered.
    /// Env: `PENDING_EVENT_TTL_MS`
    pub pending_event_ttl: Duration,

    /// Upper bound on buffered out-of-order events.
    /// Env: `PENDING_EVENT_CAPACITY`
    pub pending_event_capacity: usize,

    /// How often the ingest loop revisits buffered events.
    pub pending_event_tick: Duration,

    /// Maximum message length in characters.
    /// Env: `MAX_MESSAGE_CHARS`
    pub max_message_chars: usize,

    /// Capacity of the UI notification channel.
    /// Env: `EVENT_BUS_CAPACITY`
    pub event_bus_capacity: usize,

    /// Timeout applied to every REST request.
    /// Env: `REQUEST_TIMEOUT_SECS`
    /// Default: `15`
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            token: None,
            user_id: UserId::new("local"),
            permission_ttl: Duration::from_secs(PERMISSION_TTL_SECS),
            permission_timeout: Duration::from_millis(PERMISSION_TIMEOUT_MS),
            pending_event_ttl: Duration::from_millis(PENDING_EVENT_TTL_MS),
            pending_event_capacity: PENDING_EVENT_CAPACITY,
            pending_event_tick: Duration::from_millis(PENDING_EVENT_TICK_MS),
            max_message_chars: MAX_MESSAGE_CHARS,
            event_bus_capacity: EVENT_BUS_CAPACITY,
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("PARLEY_API_URL") {
            self.api_url = url.trim_end_matches('/').to_string();
        }

        if let Some(url) = lookup("PARLEY_WS_URL") {
            self.ws_url = url;
        }

        if let Some(token) = lookup("PARLEY_TOKEN") {
            if !token.is_empty() {
                self.token = Some(token);
            }
        }

        if let Some(user) = lookup("PARLEY_USER_ID") {
            if !user.is_empty() {
                self.user_id = UserId(user);
            }
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "PERMISSION_TTL_SECS") {
            self.permission_ttl = Duration::from_secs(secs);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "PERMISSION_TIMEOUT_MS") {
            self.permission_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "PENDING_EVENT_TTL_MS") {
            self.pending_event_ttl = Duration::from_millis(ms);
        }

        if let Some(n) = parse_var::<usize>(&lookup, "PENDING_EVENT_CAPACITY") {
            self.pending_event_capacity = n.max(1);
        }

        if let Some(n) = parse_var::<usize>(&lookup, "MAX_MESSAGE_CHARS") {
            self.max_message_chars = n;
        }

        if let Some(n) = parse_var::<usize>(&lookup, "EVENT_BUS_CAPACITY") {
            self.event_bus_capacity = n.max(1);
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "REQUEST_TIMEOUT_SECS") {
            self.request_timeout = Duration::from_secs(secs);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = lookup(key)?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> ClientConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = ClientConfig::default();
        config.apply_overrides(|key| vars.get(key).cloned());
        config
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.permission_ttl, Duration::from_secs(60));
        assert_eq!(config.pending_event_ttl, Duration::from_secs(5));
        assert!(config.token.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("PARLEY_API_URL", "https://chat.example.org/api/"),
            ("PARLEY_USER_ID", "alice"),
            ("PARLEY_TOKEN", "secret"),
            ("PERMISSION_TTL_SECS", "5"),
            ("PENDING_EVENT_CAPACITY", "0"),
        ]);
        assert_eq!(config.api_url, "https://chat.example.org/api");
        assert_eq!(config.user_id, UserId::new("alice"));
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.permission_ttl, Duration::from_secs(5));
        assert_eq!(config.pending_event_capacity, 1);
    }

    #[test]
    fn test_invalid_value_keeps_default() {
        let config = load(&[("PERMISSION_TIMEOUT_MS", "soon"), ("PARLEY_TOKEN", "")]);
        assert_eq!(config.permission_timeout, Duration::from_millis(5_000));
        assert!(config.token.is_none());
    }
}
