//! Node configuration.
//!
//! Plain structs with sensible defaults; `from_env` applies `BOARD_*`
//! environment overrides on top.

use std::str::FromStr;
use std::time::Duration;

use board_core::{keys, UNDO_STACK_LIMIT};
use uuid::Uuid;

/// Per-node settings.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique id of this node; stamped on every published event
    pub node_id: String,
    /// Pub/sub channel carrying replication events
    pub events_channel: String,
    /// Store hub URL (`ws://host:port`); None = in-process memory store
    pub hub_url: Option<String>,
    /// Timeout for a single hub request
    pub request_timeout: Duration,
    /// Delay between reconnect attempts while the store is unreachable
    pub reconnect_interval: Duration,
    /// How often the node refreshes its liveness key
    pub heartbeat_interval: Duration,
    /// Expiry of the liveness key
    pub heartbeat_ttl: Duration,
    /// Maximum undo stack length per board
    pub undo_limit: usize,
    /// Events buffered per locally connected client
    pub room_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            events_channel: keys::EVENTS_CHANNEL.to_string(),
            hub_url: None,
            request_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_ttl: Duration::from_secs(30),
            undo_limit: UNDO_STACK_LIMIT,
            room_capacity: 256,
        }
    }
}

impl NodeConfig {
    /// Defaults overridden by `BOARD_NODE_ID`, `BOARD_HUB_URL`,
    /// `BOARD_CHANNEL`, `BOARD_REQUEST_TIMEOUT_MS`, `BOARD_RECONNECT_MS`,
    /// `BOARD_HEARTBEAT_MS` and `BOARD_ROOM_CAPACITY`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            node_id: env_or("BOARD_NODE_ID", defaults.node_id),
            events_channel: env_or("BOARD_CHANNEL", defaults.events_channel),
            hub_url: std::env::var("BOARD_HUB_URL").ok(),
            request_timeout: env_millis("BOARD_REQUEST_TIMEOUT_MS", defaults.request_timeout),
            reconnect_interval: env_millis("BOARD_RECONNECT_MS", defaults.reconnect_interval),
            heartbeat_interval: env_millis("BOARD_HEARTBEAT_MS", defaults.heartbeat_interval),
            heartbeat_ttl: defaults.heartbeat_ttl,
            undo_limit: defaults.undo_limit,
            room_capacity: env_or("BOARD_ROOM_CAPACITY", defaults.room_capacity),
        }
    }

    /// Config with an explicit node id, otherwise defaults.
    pub fn with_node_id(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }
}

/// Parse an environment variable, falling back to `default` when it is unset
/// or malformed.
pub(crate) fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Ignoring malformed {name}={raw:?}");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(name, default.as_millis() as u64))
}
