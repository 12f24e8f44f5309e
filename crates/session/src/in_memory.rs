//! In-memory session store — for tests and ephemeral agents.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use deepnest_core::error::SessionError;
use deepnest_core::session::{LockTable, SessionLease, SessionRecord, SessionStore};

/// A session store that keeps records in a process-local map.
#[derive(Default)]
pub struct InMemorySessionStore {
    records: RwLock<HashMap<String, SessionRecord>>,
    locks: LockTable,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn save(&self, record: &SessionRecord) -> Result<(), SessionError> {
        self.records
            .write()
            .await
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, SessionError> {
        Ok(self.records.read().await.get(session_id).cloned())
    }

    async fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        self.records.write().await.remove(session_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, SessionError> {
        let mut ids: Vec<String> = self.records.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn acquire(&self, session_id: &str) -> Result<SessionLease, SessionError> {
        self.locks.acquire(session_id)
    }
}
