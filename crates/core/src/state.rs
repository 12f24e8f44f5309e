//! Session-scoped agent state: todos, virtual files, and scratch slots.
//!
//! All three slices stay JSON-serializable so the session store can
//! round-trip them. Mutation goes through [`StateCell`], which provides a
//! single linearization point plus a writer lease that the tool executor
//! holds for the whole duration of a state-effect handler.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::StateError;

/// Lifecycle of a tracked planning item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TodoStatus {
    /// The permitted transition table. Everything else is rejected.
    pub fn can_transition_to(self, next: TodoStatus) -> bool {
        matches!(
            (self, next),
            (TodoStatus::Pending, TodoStatus::InProgress)
                | (TodoStatus::Pending, TodoStatus::Cancelled)
                | (TodoStatus::InProgress, TodoStatus::Completed)
                | (TodoStatus::InProgress, TodoStatus::Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A single planning item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
}

/// An in-memory file visible to tools within one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualFile {
    pub content: String,
    /// The turn counter value when this path was last written.
    pub last_write_turn: u64,
}

/// The serializable state bag shared by all tools of one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub todos: Vec<Todo>,

    #[serde(default)]
    pub files: HashMap<String, VirtualFile>,

    /// Free-form key→JSON slot map for domain use.
    #[serde(default)]
    pub scratch: serde_json::Map<String, serde_json::Value>,

    /// Monotonic batch counter, bumped by the driver before each tool batch.
    #[serde(default)]
    pub turn: u64,
}

impl AgentState {
    /// Validate a whole todo list: unique ids, at most one in progress.
    pub fn validate_todos(todos: &[Todo]) -> Result<(), StateError> {
        let mut in_progress: Option<&str> = None;
        for (i, todo) in todos.iter().enumerate() {
            if todos[..i].iter().any(|t| t.id == todo.id) {
                return Err(StateError::DuplicateTodoId(todo.id.clone()));
            }
            if todo.status == TodoStatus::InProgress {
                if let Some(other) = in_progress {
                    return Err(StateError::SecondInProgress {
                        blocking: other.to_string(),
                    });
                }
                in_progress = Some(&todo.id);
            }
        }
        Ok(())
    }
}

/// Shared handle to an [`AgentState`].
///
/// `data` is the linearization point for individual reads and writes.
/// `lease` is the single-writer permission the executor acquires around a
/// whole state-effect handler, so that two such handlers in one batch never
/// interleave their operations.
#[derive(Clone)]
pub struct StateCell {
    data: Arc<Mutex<AgentState>>,
    lease: Arc<Mutex<()>>,
}

impl StateCell {
    pub fn new(state: AgentState) -> Self {
        Self {
            data: Arc::new(Mutex::new(state)),
            lease: Arc::new(Mutex::new(())),
        }
    }

    /// Acquire the writer lease. Held for the duration of one state-effect
    /// tool handler; released between batches so nested agents can run.
    pub async fn acquire_lease(&self) -> OwnedMutexGuard<()> {
        self.lease.clone().lock_owned().await
    }

    /// Clone the full state.
    pub async fn snapshot(&self) -> AgentState {
        self.data.lock().await.clone()
    }

    /// Replace the full state (session restore).
    pub async fn restore(&self, state: AgentState) {
        *self.data.lock().await = state;
    }

    /// Advance the batch counter; used to stamp file writes.
    pub async fn bump_turn(&self) -> u64 {
        let mut guard = self.data.lock().await;
        guard.turn += 1;
        guard.turn
    }

    // --- Todos ---

    pub async fn todos(&self) -> Vec<Todo> {
        self.data.lock().await.todos.clone()
    }

    /// Replace the todo list wholesale after validating its invariants.
    pub async fn replace_todos(&self, todos: Vec<Todo>) -> Result<(), StateError> {
        AgentState::validate_todos(&todos)?;
        self.data.lock().await.todos = todos;
        Ok(())
    }

    /// Upsert items by id into the existing list, then validate.
    ///
    /// The merged list is only committed when it passes validation.
    pub async fn merge_todos(&self, incoming: Vec<Todo>) -> Result<(), StateError> {
        let mut guard = self.data.lock().await;
        let mut merged = guard.todos.clone();
        for todo in incoming {
            match merged.iter_mut().find(|t| t.id == todo.id) {
                Some(existing) => *existing = todo,
                None => merged.push(todo),
            }
        }
        AgentState::validate_todos(&merged)?;
        guard.todos = merged;
        Ok(())
    }

    /// Transition a single todo, enforcing the transition table and the
    /// single-in-progress rule. Returns the updated item.
    pub async fn transition_todo(&self, id: &str, next: TodoStatus) -> Result<Todo, StateError> {
        let mut guard = self.data.lock().await;

        if next == TodoStatus::InProgress
            && let Some(other) = guard
                .todos
                .iter()
                .find(|t| t.status == TodoStatus::InProgress && t.id != id)
        {
            return Err(StateError::SecondInProgress {
                blocking: other.id.clone(),
            });
        }

        let todo = guard
            .todos
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| StateError::UnknownTodo(id.to_string()))?;

        if !todo.status.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                id: id.to_string(),
                from: todo.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }

        todo.status = next;
        Ok(todo.clone())
    }

    // --- Virtual files ---

    pub async fn write_file(&self, path: impl Into<String>, content: impl Into<String>) {
        let mut guard = self.data.lock().await;
        let turn = guard.turn;
        guard.files.insert(
            path.into(),
            VirtualFile {
                content: content.into(),
                last_write_turn: turn,
            },
        );
    }

    pub async fn read_file(&self, path: &str) -> Result<String, StateError> {
        self.data
            .lock()
            .await
            .files
            .get(path)
            .map(|f| f.content.clone())
            .ok_or_else(|| StateError::FileNotFound(path.to_string()))
    }

    /// Paths matching the prefix (all paths when `None`), sorted.
    pub async fn list_files(&self, prefix: Option<&str>) -> Vec<String> {
        let guard = self.data.lock().await;
        let mut paths: Vec<String> = guard
            .files
            .keys()
            .filter(|p| prefix.is_none_or(|pre| p.starts_with(pre)))
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    pub async fn files_snapshot(&self) -> HashMap<String, VirtualFile> {
        self.data.lock().await.files.clone()
    }

    /// Merge a file map into this state, last writer wins per path.
    pub async fn merge_files(&self, incoming: HashMap<String, VirtualFile>) {
        let mut guard = self.data.lock().await;
        for (path, file) in incoming {
            guard.files.insert(path, file);
        }
    }

    // --- Scratch ---

    pub async fn scratch_get(&self, key: &str) -> Option<serde_json::Value> {
        self.data.lock().await.scratch.get(key).cloned()
    }

    pub async fn scratch_set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.data.lock().await.scratch.insert(key.into(), value);
    }
}
