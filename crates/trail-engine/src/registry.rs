//! Append-only session registry (sessions.jsonl).
//!
//! Starting a session appends its record; ending it appends a superseding
//! copy with `ended_at` set. Nothing is ever rewritten, and the last record
//! per `session_id` is the current state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use tracing::info;

use trail_types::session::SessionRecord;

use crate::error::RegistryError;
use crate::storage::{append_json_line, read_json_lines};

pub struct SessionRegistry {
    path: PathBuf,
    // Serializes read-check-append within this process.
    guard: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a new session. Rejects a `session_id` whose latest record is
    /// still active; a previously ended session may be opened again.
    pub fn open(
        &self,
        session_id: &str,
        transcript_path: &Path,
        source: &str,
    ) -> Result<SessionRecord, RegistryError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = self.find(session_id)? {
            if existing.is_active() {
                return Err(RegistryError::AlreadyActive {
                    session_id: session_id.to_string(),
                });
            }
        }

        let record = SessionRecord::new(session_id, transcript_path, source);
        append_json_line(&self.path, &record)?;
        info!(session_id, source, "Session registered");
        Ok(record)
    }

    /// Mark the session ended by appending its superseding record.
    pub fn close(&self, session_id: &str) -> Result<SessionRecord, RegistryError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self
            .find(session_id)?
            .ok_or_else(|| RegistryError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        if !current.is_active() {
            return Err(RegistryError::AlreadyClosed {
                session_id: session_id.to_string(),
            });
        }

        let closed = current.closed_at(Utc::now());
        append_json_line(&self.path, &closed)?;
        info!(session_id, "Session closed");
        Ok(closed)
    }

    /// Current record for one session.
    pub fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, RegistryError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        self.find(session_id)
    }

    /// Current record of every session, in order of first registration.
    pub fn latest(&self) -> Result<Vec<SessionRecord>, RegistryError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);

        let mut order: Vec<SessionRecord> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for record in self.history()? {
            match index.get(&record.session_id) {
                Some(&i) => order[i] = record,
                None => {
                    index.insert(record.session_id.clone(), order.len());
                    order.push(record);
                }
            }
        }
        Ok(order)
    }

    /// Sessions whose latest record has no `ended_at`.
    pub fn active(&self) -> Result<Vec<SessionRecord>, RegistryError> {
        Ok(self
            .latest()?
            .into_iter()
            .filter(SessionRecord::is_active)
            .collect())
    }

    fn find(&self, session_id: &str) -> Result<Option<SessionRecord>, RegistryError> {
        Ok(self
            .history()?
            .into_iter()
            .filter(|r| r.session_id == session_id)
            .last())
    }

    fn history(&self) -> Result<Vec<SessionRecord>, RegistryError> {
        read_json_lines(&self.path).map_err(RegistryError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, SessionRegistry) {
        let tmp = tempfile::tempdir().unwrap();
        let reg = SessionRegistry::new(tmp.path().join("sessions.jsonl"));
        (tmp, reg)
    }

    #[test]
    fn open_then_close() {
        let (_tmp, reg) = registry();
        let rec = reg.open("s1", Path::new("/t/s1.jsonl"), "startup").unwrap();
        assert!(rec.is_active());
        assert_eq!(reg.active().unwrap().len(), 1);

        let closed = reg.close("s1").unwrap();
        assert!(closed.ended_at.is_some());
        assert_eq!(closed.started_at, rec.started_at);
        assert_eq!(closed.transcript_path, PathBuf::from("/t/s1.jsonl"));
        assert!(reg.active().unwrap().is_empty());

        // History is appended, not rewritten.
        let raw = std::fs::read_to_string(reg.path()).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[test]
    fn duplicate_start_is_rejected() {
        let (_tmp, reg) = registry();
        reg.open("s1", Path::new("/t/a.jsonl"), "startup").unwrap();
        let err = reg.open("s1", Path::new("/t/b.jsonl"), "resume").unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyActive { .. }));

        let active = reg.active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].transcript_path, PathBuf::from("/t/a.jsonl"));
        assert_eq!(std::fs::read_to_string(reg.path()).unwrap().lines().count(), 1);
    }

    #[test]
    fn ended_session_can_be_reopened() {
        let (_tmp, reg) = registry();
        reg.open("s1", Path::new("/t/a.jsonl"), "startup").unwrap();
        reg.close("s1").unwrap();
        let again = reg.open("s1", Path::new("/t/a.jsonl"), "resume").unwrap();
        assert_eq!(again.source, "resume");
        assert_eq!(reg.get("s1").unwrap().unwrap().source, "resume");
        assert_eq!(reg.active().unwrap().len(), 1);
    }

    #[test]
    fn close_errors() {
        let (_tmp, reg) = registry();
        assert!(matches!(
            reg.close("nope").unwrap_err(),
            RegistryError::UnknownSession { .. }
        ));
        reg.open("s1", Path::new("/t"), "").unwrap();
        reg.close("s1").unwrap();
        assert!(matches!(
            reg.close("s1").unwrap_err(),
            RegistryError::AlreadyClosed { .. }
        ));
    }

    #[test]
    fn latest_keeps_registration_order_and_skips_garbage() {
        let (_tmp, reg) = registry();
        reg.open("a", Path::new("/t/a"), "").unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(reg.path())
            .and_then(|mut f| std::io::Write::write_all(&mut f, b"garbage\n"))
            .unwrap();
        reg.open("b", Path::new("/t/b"), "").unwrap();
        reg.close("a").unwrap();

        let latest = reg.latest().unwrap();
        let ids: Vec<_> = latest.iter().map(|r| r.session_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(!latest[0].is_active());
        assert!(latest[1].is_active());
    }

    #[test]
    fn missing_registry_reads_empty() {
        let (_tmp, reg) = registry();
        assert!(reg.latest().unwrap().is_empty());
        assert!(reg.get("x").unwrap().is_none());
    }
}
