/// Application name
pub const APP_NAME: &str = "Parley";

/// Maximum message content length in characters
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// How long a cached permission decision stays usable, in seconds
pub const PERMISSION_TTL_SECS: u64 = 60;

/// Remote permission check timeout in milliseconds
pub const PERMISSION_TIMEOUT_MS: u64 = 5_000;

/// How long an event for an unknown message is kept before being dropped
pub const PENDING_EVENT_TTL_MS: u64 = 5_000;

/// Maximum number of buffered out-of-order events
pub const PENDING_EVENT_CAPACITY: usize = 256;

/// Interval at which the ingest loop revisits buffered events
pub const PENDING_EVENT_TICK_MS: u64 = 250;

/// Capacity of the UI notification broadcast channel
pub const EVENT_BUS_CAPACITY: usize = 1024;

/// Capacity of the raw push-event channel fed by the transport
pub const RAW_EVENT_CHANNEL_CAPACITY: usize = 512;

/// Reason attached to fail-closed permission decisions
pub const PERMISSION_UNAVAILABLE: &str = "permission check unavailable";

/// Default REST endpoint for local development
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";

/// Default push-event WebSocket endpoint for local development
pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8080/events";
