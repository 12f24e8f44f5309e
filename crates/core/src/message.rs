//! Message and content-block domain types.
//!
//! These are the core value objects that flow through the entire system:
//! the user sends text → the reason-act loop calls the model → the model
//! answers with an ordered list of content blocks → tool results flow back
//! as the next user message. The wire protocol cares about block *order*,
//! so messages carry an ordered `Vec<Block>` rather than flat text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tool::ToolCall;

/// The role of a message sender in a transcript.
///
/// The model wire protocol only knows these two roles; the system prompt
/// travels as a top-level request field, not as a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user (or the tool results sent back on the user's behalf)
    User,
    /// The model
    Assistant,
}

/// Whether a tool result carries a successful payload or an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolResultStatus {
    Ok,
    Error,
}

/// A single content block inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    /// Plain text from the user or the model.
    Text { text: String },

    /// The model requests a tool invocation. The `id` is an opaque string
    /// assigned by the model, unique within the containing message.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// The answer to a prior `ToolUse` with the same `id`.
    ToolResult {
        id: String,
        status: ToolResultStatus,
        payload: serde_json::Value,
    },
}

impl Block {
    /// Build a text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Build a successful tool result.
    pub fn tool_ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::ToolResult {
            id: id.into(),
            status: ToolResultStatus::Ok,
            payload,
        }
    }

    /// Build an error tool result. The message is what the model sees.
    pub fn tool_error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolResult {
            id: id.into(),
            status: ToolResultStatus::Error,
            payload: serde_json::Value::String(message.into()),
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Self::ToolResult { .. })
    }
}

/// A single message in a transcript: a role plus an ordered list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID (ours, not the provider's)
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// Ordered content blocks
    pub content: Vec<Block>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a user message containing a single text block.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: vec![Block::text(text)],
            timestamp: Utc::now(),
        }
    }

    /// Create an assistant message from model-emitted blocks.
    pub fn assistant(content: Vec<Block>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content,
            timestamp: Utc::now(),
        }
    }

    /// Create an assistant message containing a single text block.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::assistant(vec![Block::text(text)])
    }

    /// Create the user message that answers a batch of tool uses.
    ///
    /// The caller is responsible for ordering the results to match the
    /// preceding assistant message; the transcript rejects mismatches.
    pub fn tool_results(results: Vec<Block>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: results,
            timestamp: Utc::now(),
        }
    }

    /// Extract the tool calls requested by this message, in block order.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|block| match block {
                Block::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Concatenate the text blocks of this message.
    pub fn text(&self) -> String {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|block| match block {
                Block::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        parts.join("\n")
    }

    pub fn has_tool_use(&self) -> bool {
        self.content.iter().any(Block::is_tool_use)
    }

    /// True when the message consists solely of tool-result blocks.
    pub fn is_tool_result_message(&self) -> bool {
        !self.content.is_empty() && self.content.iter().all(Block::is_tool_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_text_message() {
        let msg = Message::user_text("Hello, agent!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text(), "Hello, agent!");
        assert!(!msg.has_tool_use());
    }

    #[test]
    fn assistant_tool_calls_in_block_order() {
        let msg = Message::assistant(vec![
            Block::text("Let me check two things."),
            Block::ToolUse {
                id: "tu_1".into(),
                name: "read_file".into(),
                input: serde_json::json!({"path": "a.txt"}),
            },
            Block::ToolUse {
                id: "tu_2".into(),
                name: "list_files".into(),
                input: serde_json::json!({}),
            },
        ]);

        let calls = msg.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "tu_1");
        assert_eq!(calls[1].id, "tu_2");
        assert!(msg.has_tool_use());
    }

    #[test]
    fn tool_result_message_detection() {
        let results = Message::tool_results(vec![
            Block::tool_ok("tu_1", serde_json::json!("contents")),
            Block::tool_error("tu_2", "file not found"),
        ]);
        assert!(results.is_tool_result_message());

        let mixed = Message::tool_results(vec![
            Block::tool_ok("tu_1", serde_json::json!("contents")),
            Block::text("and some text"),
        ]);
        assert!(!mixed.is_tool_result_message());
    }

    #[test]
    fn text_concatenates_only_text_blocks() {
        let msg = Message::assistant(vec![
            Block::text("first"),
            Block::ToolUse {
                id: "tu_1".into(),
                name: "noop".into(),
                input: serde_json::json!({}),
            },
            Block::text("second"),
        ]);
        assert_eq!(msg.text(), "first\nsecond");
    }

    #[test]
    fn block_serialization_roundtrip() {
        let block = Block::ToolUse {
            id: "tu_9".into(),
            name: "write_file".into(),
            input: serde_json::json!({"path": "notes.md", "content": "hi"}),
        };
        let json = serde_json::to_string(&block).unwrap();
        assert!(json.contains(r#""type":"tool_use""#));
        let back: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(back, block);
    }
}
