//! Conversation messages and their ordered parts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::tool::ToolPart;

/// Who authored a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Role {
    #[default]
    #[strum(serialize = "user", serialize = "human")]
    User,
    #[strum(serialize = "assistant", serialize = "model")]
    Assistant,
    System,
}

impl Role {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One element of a message body, in display order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePart {
    Text { text: String },
    Reasoning { text: String },
    Tool(ToolPart),
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }

    pub fn as_tool(&self) -> Option<&ToolPart> {
        match self {
            MessagePart::Tool(part) => Some(part),
            _ => None,
        }
    }
}

impl From<ToolPart> for MessagePart {
    fn from(part: ToolPart) -> Self {
        MessagePart::Tool(part)
    }
}

/// A conversation message.
///
/// `created_at` (unix millis) is optional on the way in; once a message has
/// been persisted, its stored timestamp wins.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, parts: Vec<MessagePart>) -> Self {
        Self {
            id: id.into(),
            role,
            parts,
            created_at: None,
        }
    }

    /// A user message with a single text part.
    pub fn user_text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, Role::User, vec![MessagePart::text(text)])
    }

    pub fn with_created_at(mut self, millis: i64) -> Self {
        self.created_at = Some(millis);
        self
    }

    pub fn tool_parts(&self) -> impl Iterator<Item = &ToolPart> {
        self.parts.iter().filter_map(MessagePart::as_tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parts_are_tagged_by_type() {
        let msg = Message::new(
            "m1",
            Role::Assistant,
            vec![
                MessagePart::text("Updating A1"),
                ToolPart::input("c1", ToolKind::UpdateCell, json!({"cell": "A1"})).into(),
            ],
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["parts"][0]["type"], "text");
        assert_eq!(value["parts"][1]["type"], "tool");
        assert_eq!(value["parts"][1]["callId"], "c1");
        assert_eq!(value["parts"][1]["tool"], "updateCell");
        assert!(value.get("createdAt").is_none());

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.tool_parts().count(), 1);
    }

    #[test]
    fn test_role_aliases() {
        assert_eq!(Role::from_str("MODEL"), Some(Role::Assistant));
        assert_eq!(Role::from_str("human"), Some(Role::User));
        assert_eq!(Role::from_str("tool"), None);
    }
}
