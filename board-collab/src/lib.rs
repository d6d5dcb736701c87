//! # board-collab: multi-node whiteboard replication
//!
//! Several server nodes serve the same boards. Each node keeps a local cache,
//! writes through to a shared store, and announces every mutation as a
//! full-board snapshot on a pub/sub channel.
//!
//! ## Architecture
//!
//! ```text
//!  clients ──► EventRouter ──► ReplicationService ──► PersistenceAdapter ──┐
//!     ▲                               ▲                                    │
//!     │                               │ handle_remote_event          publish│
//!     │                               │                                    ▼
//!     └──── EventRouter ◄─────────────┴───── PersistenceAdapter ◄── store (hub)
//!            (other node)                     (other node, subscribe)
//! ```
//!
//! ## Modules
//!
//! - [`adapter`]: readiness-gated store access that never fails outward
//! - [`replication`]: per-node cache, mutations, remote-event ingestion
//! - [`router`]: client-facing boundary, board and read-only mirror rooms
//! - [`metrics`]: passive node counters
//! - [`store`]: `Backend` trait with memory, hub-client and RocksDB stores
//! - [`hub`] / [`protocol`]: the networked store hub and its wire format
//! - [`broadcast`]: keyed fan-out used by channels and rooms
//! - [`config`]: node settings with environment overrides

pub mod adapter;
pub mod broadcast;
pub mod config;
pub mod hub;
pub mod metrics;
pub mod protocol;
pub mod replication;
pub mod router;
pub mod store;

// Re-exports for convenience
pub use adapter::{MessageHandler, PersistenceAdapter};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use config::NodeConfig;
pub use hub::{HubConfig, HubError, HubServer, HubStats};
pub use metrics::{Metrics, MetricsSnapshot};
pub use protocol::{HubFrame, HubOp, HubReply, HubRequest, ProtocolError};
pub use replication::{RemoteCallback, ReplicationService};
pub use router::{ClientEvents, EventRouter};
pub use store::{
    Backend, MemoryBackend, RemoteBackend, RemoteConfig, RocksStore, StoreConfig, StoreError,
    Subscription,
};
