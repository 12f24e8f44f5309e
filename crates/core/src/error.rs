//! Error types for the Deepnest domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; the policy split is:
//! anything the model can act on becomes an error tool-result payload,
//! anything the program cannot recover from is raised to the caller.

use thiserror::Error;

/// The top-level error type for all Deepnest operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Transcript invariant violations (programmer bugs, never shown to the model) ---
    #[error("Transcript invariant violated: {0}")]
    Transcript(#[from] TranscriptError),

    // --- Tool errors that escaped the executor's capture path ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Model provider errors ---
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    // --- Session persistence errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Agent state errors ---
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// The whole turn exceeded its deadline.
    #[error("Turn timed out after {elapsed_ms}ms")]
    TurnTimeout { elapsed_ms: u64 },

    /// The turn was cancelled through the cancellation token.
    #[error("Turn cancelled")]
    Cancelled,

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// An append that would corrupt the transcript.
///
/// Every variant here is a programmer error in the driver, not a condition
/// the model can recover from.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranscriptError {
    #[error("message has no content blocks")]
    EmptyMessage,

    #[error("two consecutive {role} messages")]
    RoleNotAlternating { role: String },

    #[error("user message mixes tool results with other content")]
    MixedToolResultContent,

    #[error("assistant message contains a tool-result block")]
    ToolResultInAssistant,

    #[error("duplicate tool-use id in assistant message: {0}")]
    DuplicateToolUseId(String),

    #[error("tool results answer nothing: previous assistant message has no tool uses")]
    OrphanToolResults,

    #[error("tool-result ids do not match pending tool uses (expected {expected:?}, got {got:?})")]
    ToolResultMismatch {
        expected: Vec<String>,
        got: Vec<String>,
    },
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid input for {tool_name}: {reason}")]
    InvalidInput { tool_name: String, reason: String },

    #[error("Tool execution failed: {tool_name} — {reason}")]
    HandlerFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },

    #[error("Tool cancelled: {tool_name}")]
    Cancelled { tool_name: String },

    #[error("Tool denied: {tool_name} — {reason}")]
    Denied { tool_name: String, reason: String },

    #[error(transparent)]
    State(#[from] StateError),
}

/// Errors from the agent-state accessors.
///
/// These surface to the model as error tool-results; the state itself is
/// left untouched when any of them fires.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("todo {0} does not exist")]
    UnknownTodo(String),

    #[error("duplicate todo id: {0}")]
    DuplicateTodoId(String),

    #[error("todo {blocking} is already in progress")]
    SecondInProgress { blocking: String },

    #[error("todo {id}: cannot transition from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("file not found: {0}")]
    FileNotFound(String),
}

#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Stream interrupted: {0}")]
    Stream(String),
}

impl ModelError {
    /// Whether the driver should retry this request.
    ///
    /// Timeouts, connection drops, rate limits, server errors, and stream
    /// truncation are transient; auth and request-shape problems are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { status_code, .. } => *status_code >= 500 || *status_code == 429,
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Network(_) | Self::Stream(_) => {
                true
            }
            Self::Auth(_) | Self::InvalidRequest(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session load failed: {0}")]
    Load(String),

    #[error("Session busy: {0} is already open")]
    Busy(String),

    #[error("Session storage error: {0}")]
    Storage(String),

    #[error("Invalid session id: {0}")]
    InvalidId(String),
}
