//! # board-core: shared whiteboard data model
//!
//! Types exchanged between nodes and stored in the backing store:
//!
//! - [`Action`] / [`Tool`]: one drawing operation and its discriminator
//! - [`Command`]: an inbound action addressed to a board
//! - [`ReplicationEvent`]: full-snapshot or clear notification on pub/sub
//! - [`keys`]: backing-store key layout

pub mod action;
pub mod event;
pub mod keys;

pub use action::{decode_actions, encode_actions, Action, Command, Tool};
pub use event::{now_millis, EventType, ReplicationEvent};

/// Maximum number of actions kept on a board's undo stack.
pub const UNDO_STACK_LIMIT: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
