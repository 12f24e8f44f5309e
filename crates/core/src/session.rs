//! Session persistence trait and record types.
//!
//! A session is the unit of durability: the transcript plus the agent
//! state, addressed by an opaque id. Store implementations live in the
//! `deepnest-session` crate; this module defines the contract and the
//! in-process lock table that gives concurrent openers fail-fast
//! `SessionBusy` semantics.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::message::Message;
use crate::state::AgentState;

/// Version of the persisted envelope. Bumped on breaking layout changes;
/// loaders reject records from a newer version than they understand.
pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// The persisted form of one session.
///
/// Unknown fields are ignored on load so older binaries can read records
/// written by newer ones within the same schema version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub schema_version: u32,

    pub session_id: String,

    pub messages: Vec<Message>,

    pub state: AgentState,

    pub created_at: DateTime<Utc>,

    pub last_touched_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Build a fresh record stamped with the current schema version.
    pub fn new(session_id: impl Into<String>, messages: Vec<Message>, state: AgentState) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SESSION_SCHEMA_VERSION,
            session_id: session_id.into(),
            messages,
            state,
            created_at: now,
            last_touched_at: now,
        }
    }

    /// Carry forward creation time from a prior record and re-stamp touch time.
    pub fn touched_from(mut self, previous: &SessionRecord) -> Self {
        self.created_at = previous.created_at;
        self.last_touched_at = Utc::now();
        self
    }
}

/// Storage backend for sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// A human-readable name for this store (e.g., "file", "in_memory").
    fn name(&self) -> &str;

    /// Persist a record, replacing any existing record for the same id.
    async fn save(&self, record: &SessionRecord) -> Result<(), SessionError>;

    /// Load the record for an id, `None` when the session does not exist.
    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, SessionError>;

    /// Delete a session. Deleting a missing session is not an error.
    async fn delete(&self, session_id: &str) -> Result<(), SessionError>;

    /// List known session ids.
    async fn list(&self) -> Result<Vec<String>, SessionError>;

    /// Claim exclusive in-process access to a session id.
    ///
    /// A second concurrent claim fails fast with [`SessionError::Busy`];
    /// the lease is released when the guard drops.
    fn acquire(&self, session_id: &str) -> Result<SessionLease, SessionError>;
}

/// Tracks which session ids are currently open in this process.
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    open: Arc<Mutex<HashSet<String>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, session_id: &str) -> Result<SessionLease, SessionError> {
        let mut open = self
            .open
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !open.insert(session_id.to_string()) {
            return Err(SessionError::Busy(session_id.to_string()));
        }
        Ok(SessionLease {
            session_id: session_id.to_string(),
            open: Arc::clone(&self.open),
        })
    }
}

/// Exclusive claim on a session id; released on drop.
#[derive(Debug)]
pub struct SessionLease {
    session_id: String,
    open: Arc<Mutex<HashSet<String>>>,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let mut open = self
            .open
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        open.remove(&self.session_id);
    }
}
