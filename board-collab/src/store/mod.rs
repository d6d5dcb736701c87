//! Backing stores: shared key-value + ordered lists + pub/sub.
//!
//! Architecture:
//! ```text
//!   ┌──────────────────────┐
//!   │ PersistenceAdapter   │   readiness flag, sentinels
//!   └──────────┬───────────┘
//!              │ dyn Backend
//!      ┌───────┴─────────┐
//!      ▼                 ▼
//! ┌──────────────┐  ┌───────────────┐  WebSocket  ┌─────────────┐
//! │MemoryBackend │  │ RemoteBackend │ ──────────► │  HubServer  │
//! │ (in-process) │  │  (hub client) │             │  RocksStore │
//! └──────────────┘  └───────────────┘             └─────────────┘
//! ```
//!
//! Backends report failures as [`StoreError`]; turning those into
//! "degrade and carry on" is the adapter's job.

pub mod memory;
pub mod remote;
pub mod rocks;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

pub use memory::MemoryBackend;
pub use remote::{RemoteBackend, RemoteConfig};
pub use rocks::{RocksStore, StoreConfig};

/// Receiver side of a channel subscription.
pub type Subscription = broadcast::Receiver<String>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("backing store unavailable")]
    Unavailable,
    #[error("request timed out")]
    Timeout,
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("key {0} holds the wrong kind of value")]
    WrongType(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

impl StoreError {
    /// Errors that mean the store cannot be reached at all.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Unavailable | StoreError::Timeout)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A shared key-value / list / pub-sub store.
///
/// Values and list items are opaque strings (JSON in practice). Lists keep
/// insertion order. A key holds either a value or a list, never both.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Establish the connection. Idempotent.
    async fn connect(&self) -> Result<(), StoreError>;

    fn is_connected(&self) -> bool;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Remove a key of either kind. Returns whether anything was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Append one item. Returns the new list length.
    async fn push(&self, key: &str, item: &str) -> Result<usize, StoreError>;

    /// Append several items in order. Returns the new list length.
    async fn push_all(&self, key: &str, items: &[String]) -> Result<usize, StoreError>;

    async fn get_all(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;

    /// Stop delivery on `channel`. Receivers handed out earlier may close.
    async fn unsubscribe(&self, channel: &str) -> Result<(), StoreError>;
}
