//! Tool descriptors and the registry — the abstraction over agent capabilities.
//!
//! A tool is an explicit record: name, doc string, JSON Schema for its
//! input, an effect class, and an async handler. Input validation against
//! the schema is a gate that runs before dispatch; a failure becomes an
//! error tool-result surfaced to the model, never a raised error.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::state::StateCell;

/// A request to execute a tool, extracted from an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Opaque call id assigned by the model; correlates use and result.
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub input: serde_json::Value,
}

/// What a tool touches, which decides whether it needs the state lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectClass {
    /// No side effects at all
    Pure,
    /// Mutates the session's agent state; runs under the writer lease
    State,
    /// Talks to the outside world; holds no lease
    External,
}

/// The tool metadata sent to the model so it knows what it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Everything a handler may need beyond its validated input.
#[derive(Clone)]
pub struct ToolContext {
    /// Handle to the owning agent's state
    pub state: StateCell,

    /// Session id, when the agent is session-backed
    pub session_id: Option<String>,

    /// Cooperative cancellation; handlers check this at I/O boundaries
    pub cancel: CancellationToken,
}

/// The async body of a tool.
///
/// Returning `Err` is captured by the executor into an error tool-result;
/// it never aborts the batch.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<serde_json::Value, ToolError>;
}

/// A registered tool: metadata plus its handler.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub effect: EffectClass,
    /// True for tools that host a nested agent. A delegating tool spends
    /// its life waiting on its children's tool calls, so it holds no
    /// permit from the process-wide in-flight cap (its children do) and
    /// is bounded by the nested turn deadline instead of the per-handler
    /// timeout.
    pub delegating: bool,
    handler: Arc<dyn ToolHandler>,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
        effect: EffectClass,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            effect,
            delegating: false,
            handler: Arc::new(handler),
        }
    }

    /// Mark this tool as hosting nested agent work.
    pub fn delegating(mut self) -> Self {
        self.delegating = true;
        self
    }

    /// Invoke the handler. Input is assumed to have passed [`validate_input`].
    pub async fn invoke(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        self.handler.call(input, ctx).await
    }

    pub fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("effect", &self.effect)
            .finish()
    }
}

/// Validate a tool input against the descriptor's JSON Schema.
///
/// Validation is synchronous and runs before dispatch. The error text is
/// the payload the model sees, so it lists every violated constraint.
pub fn validate_input(
    tool_name: &str,
    schema: &serde_json::Value,
    input: &serde_json::Value,
) -> Result<(), ToolError> {
    let validator = jsonschema::validator_for(schema).map_err(|e| ToolError::InvalidInput {
        tool_name: tool_name.to_string(),
        reason: format!("schema does not compile: {e}"),
    })?;

    let messages: Vec<String> = validator.iter_errors(input).map(|e| e.to_string()).collect();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(ToolError::InvalidInput {
            tool_name: tool_name.to_string(),
            reason: messages.join("; "),
        })
    }
}

/// A registry of available tools.
///
/// The agent loop uses this to build the tool list for the model request
/// and to look up handlers when the model requests calls. Registering a
/// name twice replaces the earlier entry, which is how a sub-agent
/// registry shadows the lead's.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a list of descriptors.
    pub fn from_descriptors(descriptors: Vec<ToolDescriptor>) -> Self {
        let mut registry = Self::new();
        for descriptor in descriptors {
            registry.register(descriptor);
        }
        registry
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, descriptor: ToolDescriptor) {
        self.tools.insert(descriptor.name.clone(), descriptor);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// All tool schemas, sorted by name for a stable request shape.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(ToolDescriptor::schema).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Cloned descriptors, used when deriving a sub-agent registry.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.values().cloned().collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
