//! # Deepnest Core
//!
//! Domain types, traits, and error definitions for the Deepnest deep-agent
//! runtime. This crate has **zero framework dependencies** — it defines the
//! domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem is defined as a trait here. Implementations live in their
//! respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod message;
pub mod model;
pub mod session;
pub mod state;
pub mod tool;
pub mod transcript;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ModelError, Result, SessionError, StateError, ToolError, TranscriptError};
pub use message::{Block, Message, Role, ToolResultStatus};
pub use model::{BlockAssembler, ModelClient, ModelRequest, ModelResponse, StopReason, StreamEvent, Usage};
pub use session::{LockTable, SessionLease, SessionRecord, SessionStore, SESSION_SCHEMA_VERSION};
pub use state::{AgentState, StateCell, Todo, TodoStatus, VirtualFile};
pub use tool::{EffectClass, ToolCall, ToolContext, ToolDescriptor, ToolHandler, ToolRegistry, ToolSchema};
pub use transcript::Transcript;
