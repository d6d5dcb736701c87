//! Replication events exchanged between nodes over pub/sub.
//!
//! ```text
//! { "type": "update", "board_id": "b1", "node_id": "n1", "timestamp": 1700000000000,
//!   "tool": "pen", "data": [ ...full action list... ], "content": { ...action... } }
//! ```

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::{Action, ModelError, Tool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// `data` carries the complete post-mutation action list.
    Update,
    /// The board was wiped.
    Clear,
}

/// Broadcast on every accepted mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub board_id: String,
    /// Id of the node that accepted the mutation.
    pub node_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Action>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Action>,
}

impl ReplicationEvent {
    /// Full-snapshot update for `board_id`.
    pub fn update(
        board_id: impl Into<String>,
        node_id: impl Into<String>,
        tool: Option<Tool>,
        data: Vec<Action>,
        content: Option<Action>,
    ) -> Self {
        Self {
            kind: EventType::Update,
            board_id: board_id.into(),
            node_id: node_id.into(),
            timestamp: now_millis(),
            tool,
            data: Some(data),
            content,
        }
    }

    pub fn clear(board_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            kind: EventType::Clear,
            board_id: board_id.into(),
            node_id: node_id.into(),
            timestamp: now_millis(),
            tool: Some(Tool::Clear),
            data: None,
            content: None,
        }
    }

    pub fn originated_at(&self, node_id: &str) -> bool {
        self.node_id == node_id
    }

    pub fn to_json(&self) -> Result<String, ModelError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, ModelError> {
        Ok(serde_json::from_str(raw)?)
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
