//! Agent-level streaming events.
//!
//! `AgentStreamEvent` wraps model-level stream progress into higher-level
//! events a caller can forward to clients over SSE or WebSocket:
//! - `text_delta`    — assistant text as it lands
//! - `tool_call`     — a tool is about to run
//! - `tool_result`   — a tool finished
//! - `done`          — the turn is complete
//! - `error`         — the turn failed

use serde::{Deserialize, Serialize};

use crate::loop_runner::TurnStop;

/// Events emitted while a turn runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    /// Assistant text from the current step.
    TextDelta { text: String },

    /// The agent is dispatching a tool call.
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// A tool call finished (ok or error).
    ToolResult {
        id: String,
        ok: bool,
        payload: serde_json::Value,
    },

    /// The turn is complete — final metadata.
    Done {
        final_text: String,
        stop: TurnStop,
        steps: usize,
        tool_calls_made: usize,
    },

    /// The turn failed.
    Error { message: String },
}

impl AgentStreamEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}
