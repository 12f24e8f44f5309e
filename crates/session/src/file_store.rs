//! File-based session store — one JSON record per session id.
//!
//! Records live as pretty-printed JSON under a storage directory, which
//! keeps them human-inspectable and trivially backed up. Entries are
//! written whole on every save; reads parse and re-validate the envelope.
//!
//! Concurrent opens of the same session id within one process fail fast
//! with `SessionError::Busy` through the shared lock table. Cross-process
//! locking is out of scope; run one process per storage directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use deepnest_core::error::SessionError;
use deepnest_core::session::{
    LockTable, SessionLease, SessionRecord, SessionStore, SESSION_SCHEMA_VERSION,
};

/// A session store backed by one JSON file per session.
pub struct FileSessionStore {
    dir: PathBuf,
    locks: LockTable,
}

impl FileSessionStore {
    /// Create a store rooted at the given directory.
    ///
    /// The directory is created on first save, not here.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: LockTable::new(),
        }
    }

    fn record_path(&self, session_id: &str) -> Result<PathBuf, SessionError> {
        // Session ids are opaque strings, but they become file names here,
        // so anything that would escape the storage dir is rejected.
        if session_id.is_empty()
            || session_id.contains(['/', '\\'])
            || session_id.contains("..")
        {
            return Err(SessionError::InvalidId(session_id.to_string()));
        }
        Ok(self.dir.join(format!("{session_id}.json")))
    }

    fn parse_record(path: &Path, raw: &str) -> Result<SessionRecord, SessionError> {
        let record: SessionRecord = serde_json::from_str(raw).map_err(|e| {
            SessionError::Load(format!("{}: {e}", path.display()))
        })?;
        if record.schema_version > SESSION_SCHEMA_VERSION {
            return Err(SessionError::Load(format!(
                "{}: schema version {} is newer than supported version {}",
                path.display(),
                record.schema_version,
                SESSION_SCHEMA_VERSION
            )));
        }
        Ok(record)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn save(&self, record: &SessionRecord) -> Result<(), SessionError> {
        let path = self.record_path(&record.session_id)?;

        std::fs::create_dir_all(&self.dir).map_err(|e| {
            SessionError::Storage(format!("failed to create session directory: {e}"))
        })?;

        let json = serde_json::to_string_pretty(record)
            .map_err(|e| SessionError::Storage(format!("failed to serialize session: {e}")))?;

        std::fs::write(&path, json)
            .map_err(|e| SessionError::Storage(format!("failed to write session file: {e}")))?;

        debug!(session_id = %record.session_id, path = %path.display(), "Session saved");
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, SessionError> {
        let path = self.record_path(session_id)?;
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SessionError::Storage(format!(
                    "failed to read session file: {e}"
                )));
            }
        };

        let record = Self::parse_record(&path, &raw)?;
        debug!(session_id, messages = record.messages.len(), "Session loaded");
        Ok(Some(record))
    }

    async fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        let path = self.record_path(session_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::Storage(format!(
                "failed to delete session file: {e}"
            ))),
        }
    }

    async fn list(&self) -> Result<Vec<String>, SessionError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SessionError::Storage(format!(
                    "failed to list session directory: {e}"
                )));
            }
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| SessionError::Storage(format!("failed to read entry: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => ids.push(stem.to_string()),
                None => warn!(path = %path.display(), "Skipping session file with odd name"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn acquire(&self, session_id: &str) -> Result<SessionLease, SessionError> {
        self.locks.acquire(session_id)
    }
}
