//! Backing-store key layout.

/// Default pub/sub channel for replication events.
pub const EVENTS_CHANNEL: &str = "board-events";

/// Ordered list of JSON actions for a board.
pub fn actions(board_id: &str) -> String {
    format!("board:{board_id}:actions")
}

/// Ordered list of JSON actions removed by undo.
pub fn undo_stack(board_id: &str) -> String {
    format!("board:{board_id}:undo")
}

/// Read-only mirror id of a board.
pub fn read_only(board_id: &str) -> String {
    format!("board:{board_id}:readonly")
}

/// Reverse mapping from a mirror id to its board.
pub fn read_only_owner(mirror_id: &str) -> String {
    format!("readonly:{mirror_id}:board")
}

/// Node liveness marker (written with a TTL).
pub fn node_alive(node_id: &str) -> String {
    format!("node:{node_id}:alive")
}
