//! Board actions: the unit of drawing history.
//!
//! Wire format (JSON):
//! ```text
//! { "tool": "pen", "username": "alice", "drawId": "17", "d": [..], "c": "#000", ... }
//! ```
//!
//! Tool-specific fields are kept verbatim in [`Action::payload`]. The board id
//! travels next to an action (see [`Command`]) and is never part of it.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::ModelError;

/// Drawing and editing tools.
///
/// Unknown tool strings are preserved in [`Tool::Other`] so that transient
/// client events (cursor moves and the like) round-trip untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Tool {
    Line,
    Pen,
    Rect,
    Circle,
    Eraser,
    RecSelect,
    EraseRec,
    AddImgBg,
    AddTextBox,
    SetTextboxText,
    RemoveTextbox,
    SetTextboxPosition,
    SetTextboxFontSize,
    SetTextboxFontColor,
    Clear,
    Undo,
    Redo,
    Other(String),
}

impl Tool {
    pub fn as_str(&self) -> &str {
        match self {
            Tool::Line => "line",
            Tool::Pen => "pen",
            Tool::Rect => "rect",
            Tool::Circle => "circle",
            Tool::Eraser => "eraser",
            Tool::RecSelect => "recSelect",
            Tool::EraseRec => "eraseRec",
            Tool::AddImgBg => "addImgBG",
            Tool::AddTextBox => "addTextBox",
            Tool::SetTextboxText => "setTextboxText",
            Tool::RemoveTextbox => "removeTextbox",
            Tool::SetTextboxPosition => "setTextboxPosition",
            Tool::SetTextboxFontSize => "setTextboxFontSize",
            Tool::SetTextboxFontColor => "setTextboxFontColor",
            Tool::Clear => "clear",
            Tool::Undo => "undo",
            Tool::Redo => "redo",
            Tool::Other(name) => name,
        }
    }

    /// Whether actions with this tool are appended to the board history.
    pub fn is_drawing(&self) -> bool {
        !matches!(self, Tool::Clear | Tool::Undo | Tool::Redo | Tool::Other(_))
    }
}

impl From<String> for Tool {
    fn from(name: String) -> Self {
        match name.as_str() {
            "line" => Tool::Line,
            "pen" => Tool::Pen,
            "rect" => Tool::Rect,
            "circle" => Tool::Circle,
            "eraser" => Tool::Eraser,
            "recSelect" => Tool::RecSelect,
            "eraseRec" => Tool::EraseRec,
            "addImgBG" => Tool::AddImgBg,
            "addTextBox" => Tool::AddTextBox,
            "setTextboxText" => Tool::SetTextboxText,
            "removeTextbox" => Tool::RemoveTextbox,
            "setTextboxPosition" => Tool::SetTextboxPosition,
            "setTextboxFontSize" => Tool::SetTextboxFontSize,
            "setTextboxFontColor" => Tool::SetTextboxFontColor,
            "clear" => Tool::Clear,
            "undo" => Tool::Undo,
            "redo" => Tool::Redo,
            _ => Tool::Other(name),
        }
    }
}

impl From<&str> for Tool {
    fn from(name: &str) -> Self {
        Tool::from(name.to_string())
    }
}

impl From<Tool> for String {
    fn from(tool: Tool) -> Self {
        match tool {
            Tool::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One atomic drawing/editing operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub tool: Tool,
    /// Owner of the action; undo/redo only ever touch a user's own actions.
    #[serde(default)]
    pub username: String,
    /// Groups the parts of one logical user operation.
    #[serde(
        rename = "drawId",
        default,
        deserialize_with = "draw_id_from_any",
        skip_serializing_if = "Option::is_none"
    )]
    pub draw_id: Option<String>,
    /// Tool-specific fields (`d`, `c`, `th`, ...).
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Action {
    pub fn new(tool: impl Into<Tool>, username: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            username: username.into(),
            draw_id: None,
            payload: Map::new(),
        }
    }

    pub fn with_draw_id(mut self, draw_id: impl Into<String>) -> Self {
        self.draw_id = Some(draw_id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// First element of the `d` payload array. For textbox tools this is the
    /// textbox id.
    pub fn leading_id(&self) -> Option<&Value> {
        self.payload.get("d")?.as_array()?.first()
    }

    /// True when this action is part of the `{draw_id, username}` group.
    pub fn in_group(&self, draw_id: Option<&str>, username: &str) -> bool {
        self.username == username && self.draw_id.as_deref() == draw_id
    }

    pub fn to_json(&self) -> Result<String, ModelError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, ModelError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// An inbound mutation: an action addressed to a board.
///
/// Deserializing splits the board id off the action so it can never end up
/// inside stored history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub board_id: String,
    #[serde(flatten)]
    pub action: Action,
}

impl Command {
    pub fn new(board_id: impl Into<String>, action: Action) -> Self {
        Self {
            board_id: board_id.into(),
            action,
        }
    }

    pub fn undo(board_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self::new(board_id, Action::new(Tool::Undo, username))
    }

    pub fn redo(board_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self::new(board_id, Action::new(Tool::Redo, username))
    }

    pub fn clear(board_id: impl Into<String>) -> Self {
        Self::new(board_id, Action::new(Tool::Clear, ""))
    }

    pub fn from_json(raw: &str) -> Result<Self, ModelError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Decode stored list items, skipping (and logging) malformed ones.
pub fn decode_actions<S: AsRef<str>>(items: &[S]) -> Vec<Action> {
    items
        .iter()
        .filter_map(|raw| match Action::from_json(raw.as_ref()) {
            Ok(action) => Some(action),
            Err(e) => {
                log::warn!("Dropping malformed stored action: {e}");
                None
            }
        })
        .collect()
}

/// Encode actions for list storage. Actions that fail to serialize are skipped.
pub fn encode_actions(actions: &[Action]) -> Vec<String> {
    actions
        .iter()
        .filter_map(|action| match action.to_json() {
            Ok(raw) => Some(raw),
            Err(e) => {
                log::warn!("Skipping unserializable action: {e}");
                None
            }
        })
        .collect()
}

// Clients send draw ids both as strings and as numbers.
fn draw_id_from_any<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}
