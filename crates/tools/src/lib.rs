//! Built-in tool implementations for Deepnest agents.
//!
//! Two families ship by default: planning tools that maintain the agent's
//! TODO list, and virtual-filesystem tools backed by the session-scoped
//! in-memory file map. Both are pure state mutations — nothing here talks
//! to the network or the real filesystem.

pub mod files;
pub mod planning;

use deepnest_core::tool::ToolDescriptor;

/// The planning tool set: `write_todos`, `read_todos`, `update_todo_status`.
pub fn planning_tools() -> Vec<ToolDescriptor> {
    vec![
        planning::write_todos(),
        planning::read_todos(),
        planning::update_todo_status(),
    ]
}

/// The virtual-filesystem tool set: `write_file`, `read_file`, `list_files`.
pub fn file_tools() -> Vec<ToolDescriptor> {
    vec![files::write_file(), files::read_file(), files::list_files()]
}

/// Everything a deep agent gets out of the box.
pub fn default_tools() -> Vec<ToolDescriptor> {
    let mut tools = planning_tools();
    tools.extend(file_tools());
    tools
}
