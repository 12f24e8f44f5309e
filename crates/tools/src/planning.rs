//! Planning tools — the agent's TODO list.
//!
//! Three state-effect tools: `write_todos` replaces (or merges into) the
//! list wholesale, `read_todos` returns it, and `update_todo_status` moves
//! a single item through its lifecycle. All validation failures come back
//! as error tool-results so the model can correct itself; the list is
//! never left half-written.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use deepnest_core::error::ToolError;
use deepnest_core::state::{Todo, TodoStatus};
use deepnest_core::tool::{EffectClass, ToolContext, ToolDescriptor, ToolHandler};

const STATUS_VALUES: [&str; 4] = ["pending", "in_progress", "completed", "cancelled"];

/// Summarize a todo list the way the model likes to read it back.
fn summarize(todos: &[Todo]) -> String {
    let count = |status: TodoStatus| todos.iter().filter(|t| t.status == status).count();
    format!(
        "TODO list updated. Total: {} (pending: {}, in progress: {}, completed: {}, cancelled: {})",
        todos.len(),
        count(TodoStatus::Pending),
        count(TodoStatus::InProgress),
        count(TodoStatus::Completed),
        count(TodoStatus::Cancelled),
    )
}

// --- write_todos ---

struct WriteTodos;

#[derive(Deserialize)]
struct WriteTodosInput {
    todos: Vec<Todo>,
    #[serde(default)]
    merge: bool,
}

#[async_trait]
impl ToolHandler for WriteTodos {
    async fn call(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let input: WriteTodosInput =
            serde_json::from_value(input).map_err(|e| ToolError::InvalidInput {
                tool_name: "write_todos".into(),
                reason: e.to_string(),
            })?;

        if input.merge {
            ctx.state.merge_todos(input.todos).await?;
        } else {
            ctx.state.replace_todos(input.todos).await?;
        }

        let todos = ctx.state.todos().await;
        debug!(count = todos.len(), merged = input.merge, "Todo list written");
        Ok(serde_json::Value::String(summarize(&todos)))
    }
}

/// Descriptor for the `write_todos` tool.
pub fn write_todos() -> ToolDescriptor {
    ToolDescriptor::new(
        "write_todos",
        "Create or update the TODO list that tracks your plan. Replaces the \
         whole list unless `merge` is true, in which case items are upserted \
         by id. At most one item may be in_progress.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "content": { "type": "string" },
                            "status": { "type": "string", "enum": STATUS_VALUES }
                        },
                        "required": ["id", "content", "status"]
                    }
                },
                "merge": {
                    "type": "boolean",
                    "description": "Upsert into the existing list instead of replacing it"
                }
            },
            "required": ["todos"]
        }),
        EffectClass::State,
        WriteTodos,
    )
}

// --- read_todos ---

struct ReadTodos;

#[async_trait]
impl ToolHandler for ReadTodos {
    async fn call(
        &self,
        _input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let todos = ctx.state.todos().await;
        if todos.is_empty() {
            return Ok(serde_json::Value::String("No TODOs yet.".into()));
        }
        serde_json::to_value(&todos).map_err(|e| ToolError::HandlerFailed {
            tool_name: "read_todos".into(),
            reason: e.to_string(),
        })
    }
}

/// Descriptor for the `read_todos` tool.
pub fn read_todos() -> ToolDescriptor {
    ToolDescriptor::new(
        "read_todos",
        "Read the current TODO list.",
        serde_json::json!({
            "type": "object",
            "properties": {}
        }),
        EffectClass::State,
        ReadTodos,
    )
}

// --- update_todo_status ---

struct UpdateTodoStatus;

#[derive(Deserialize)]
struct UpdateTodoStatusInput {
    id: String,
    status: TodoStatus,
}

#[async_trait]
impl ToolHandler for UpdateTodoStatus {
    async fn call(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let input: UpdateTodoStatusInput =
            serde_json::from_value(input).map_err(|e| ToolError::InvalidInput {
                tool_name: "update_todo_status".into(),
                reason: e.to_string(),
            })?;

        let updated = ctx.state.transition_todo(&input.id, input.status).await?;
        Ok(serde_json::Value::String(format!(
            "Todo {} is now {}",
            updated.id,
            updated.status.as_str()
        )))
    }
}

/// Descriptor for the `update_todo_status` tool.
pub fn update_todo_status() -> ToolDescriptor {
    ToolDescriptor::new(
        "update_todo_status",
        "Move one TODO through its lifecycle. Allowed transitions: \
         pending→in_progress, pending→cancelled, in_progress→completed, \
         in_progress→cancelled.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "status": { "type": "string", "enum": STATUS_VALUES }
            },
            "required": ["id", "status"]
        }),
        EffectClass::State,
        UpdateTodoStatus,
    )
}
