//! Virtual-filesystem tools.
//!
//! The "filesystem" is a session-scoped, in-memory path→content map on the
//! agent state; nothing touches disk. Paths are opaque strings with no
//! hierarchy beyond prefix matching for listings.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use deepnest_core::error::ToolError;
use deepnest_core::tool::{EffectClass, ToolContext, ToolDescriptor, ToolHandler};

// --- write_file ---

struct WriteFile;

#[derive(Deserialize)]
struct WriteFileInput {
    path: String,
    content: String,
}

#[async_trait]
impl ToolHandler for WriteFile {
    async fn call(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let input: WriteFileInput =
            serde_json::from_value(input).map_err(|e| ToolError::InvalidInput {
                tool_name: "write_file".into(),
                reason: e.to_string(),
            })?;

        let bytes = input.content.len();
        ctx.state.write_file(&input.path, input.content).await;
        debug!(path = %input.path, bytes, "Virtual file written");
        Ok(serde_json::Value::String(format!(
            "Wrote {bytes} bytes to {}",
            input.path
        )))
    }
}

/// Descriptor for the `write_file` tool.
pub fn write_file() -> ToolDescriptor {
    ToolDescriptor::new(
        "write_file",
        "Write a file to the shared scratch filesystem, replacing any \
         existing content at that path.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        }),
        EffectClass::State,
        WriteFile,
    )
}

// --- read_file ---

struct ReadFile;

#[derive(Deserialize)]
struct ReadFileInput {
    path: String,
}

#[async_trait]
impl ToolHandler for ReadFile {
    async fn call(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let input: ReadFileInput =
            serde_json::from_value(input).map_err(|e| ToolError::InvalidInput {
                tool_name: "read_file".into(),
                reason: e.to_string(),
            })?;

        let content = ctx.state.read_file(&input.path).await?;
        Ok(serde_json::Value::String(content))
    }
}

/// Descriptor for the `read_file` tool.
pub fn read_file() -> ToolDescriptor {
    ToolDescriptor::new(
        "read_file",
        "Read a file from the shared scratch filesystem.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" }
            },
            "required": ["path"]
        }),
        EffectClass::State,
        ReadFile,
    )
}

// --- list_files ---

struct ListFiles;

#[derive(Deserialize)]
struct ListFilesInput {
    #[serde(default)]
    prefix: Option<String>,
}

#[async_trait]
impl ToolHandler for ListFiles {
    async fn call(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let input: ListFilesInput =
            serde_json::from_value(input).map_err(|e| ToolError::InvalidInput {
                tool_name: "list_files".into(),
                reason: e.to_string(),
            })?;

        let paths = ctx.state.list_files(input.prefix.as_deref()).await;
        serde_json::to_value(&paths).map_err(|e| ToolError::HandlerFailed {
            tool_name: "list_files".into(),
            reason: e.to_string(),
        })
    }
}

/// Descriptor for the `list_files` tool.
pub fn list_files() -> ToolDescriptor {
    ToolDescriptor::new(
        "list_files",
        "List paths in the shared scratch filesystem, optionally filtered \
         by prefix.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "prefix": { "type": "string" }
            }
        }),
        EffectClass::State,
        ListFiles,
    )
}
