//! Upload Session Store
//!
//! Keeps active sessions with:
//! - Lookup by session id
//! - A resume index keyed by `(client_id, file_name)`
//! - The paused set, kept apart from the sessions themselves
//!
//! Every container is concurrent; no operation here holds a store-wide lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};

use super::types::{UploadError, UploadSession};

/// Outcome of a resume lookup
#[derive(Debug)]
pub enum ResumeLookup {
    /// A live session for the same file and size
    Resumable(Arc<UploadSession>),

    /// The resume key is taken by a session that cannot be resumed (size changed)
    /// or points at one that is gone
    Stale(Option<Arc<UploadSession>>),

    /// Nothing indexed under this key
    Absent,
}

/// Outcome of inserting a freshly created session
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted,

    /// A concurrent start for the same key won; resume that one instead
    Raced(Arc<UploadSession>),
}

// ============================================================================
// Session Manager
// ============================================================================

/// Concurrent store of in-progress upload sessions
#[derive(Clone, Default)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

#[derive(Default)]
struct SessionManagerInner {
    /// Active sessions indexed by ID
    sessions: DashMap<String, Arc<UploadSession>>,

    /// Session IDs indexed by `(client_id, file_name)`
    resume_index: DashMap<(String, String), String>,

    /// IDs of paused sessions
    paused: DashSet<String>,
}

impl SessionManager {
    /// Create an empty session store
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<UploadSession>> {
        self.inner.sessions.get(session_id).map(|s| Arc::clone(&s))
    }

    /// Get a session or fail with `SessionNotFound`
    pub fn require(&self, session_id: &str) -> Result<Arc<UploadSession>, UploadError> {
        self.get(session_id)
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    // ========================================================================
    // Resume Index
    // ========================================================================

    /// Find a session to resume for this client and file
    pub fn lookup_for_resume(
        &self,
        client_id: &str,
        file_name: &str,
        file_size: u64,
    ) -> ResumeLookup {
        let key = (client_id.to_string(), file_name.to_string());
        let Some(session_id) = self.inner.resume_index.get(&key).map(|id| id.clone()) else {
            return ResumeLookup::Absent;
        };

        match self.get(&session_id) {
            Some(session) if session.file_size == file_size => ResumeLookup::Resumable(session),
            Some(session) => ResumeLookup::Stale(Some(session)),
            None => {
                self.inner
                    .resume_index
                    .remove_if(&key, |_, id| *id == session_id);
                ResumeLookup::Stale(None)
            }
        }
    }

    /// Insert a new session unless another start for the same key got there first
    pub fn insert_new(&self, session: Arc<UploadSession>) -> InsertOutcome {
        let key = (session.client_id.clone(), session.file_name.clone());

        match self.inner.resume_index.entry(key) {
            Entry::Occupied(mut occupied) => {
                let existing = self.get(occupied.get());
                match existing {
                    Some(existing) if existing.file_size == session.file_size => {
                        InsertOutcome::Raced(existing)
                    }
                    _ => {
                        self.inner
                            .sessions
                            .insert(session.session_id.clone(), Arc::clone(&session));
                        occupied.insert(session.session_id.clone());
                        self.log_created(&session);
                        InsertOutcome::Inserted
                    }
                }
            }
            Entry::Vacant(vacant) => {
                self.inner
                    .sessions
                    .insert(session.session_id.clone(), Arc::clone(&session));
                vacant.insert(session.session_id.clone());
                self.log_created(&session);
                InsertOutcome::Inserted
            }
        }
    }

    fn log_created(&self, session: &UploadSession) {
        tracing::info!(
            session_id = %session.session_id,
            client_id = %session.client_id,
            file_name = %session.file_name,
            file_size = session.file_size,
            chunks = session.total_chunks,
            "Created upload session"
        );
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Remove a session from every index and close it.
    ///
    /// Returns the removed session, or `None` if it was already gone.
    pub fn remove(&self, session_id: &str) -> Option<Arc<UploadSession>> {
        let (_, session) = self.inner.sessions.remove(session_id)?;

        let key = (session.client_id.clone(), session.file_name.clone());
        self.inner
            .resume_index
            .remove_if(&key, |_, id| id == session_id);
        self.inner.paused.remove(session_id);
        session.mark_closed();

        Some(session)
    }

    pub fn pause(&self, session_id: &str) {
        self.inner.paused.insert(session_id.to_string());
    }

    pub fn unpause(&self, session_id: &str) {
        self.inner.paused.remove(session_id);
    }

    pub fn is_paused(&self, session_id: &str) -> bool {
        self.inner.paused.contains(session_id)
    }

    /// Sessions whose last activity is older than `cutoff`
    pub fn inactive_since(&self, cutoff: DateTime<Utc>) -> Vec<Arc<UploadSession>> {
        self.inner
            .sessions
            .iter()
            .filter(|entry| entry.value().last_activity() < cutoff)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::paths::StagingLayout;
    use crate::upload::types::StartUploadRequest;

    fn session(id: &str, client: &str, name: &str, size: u64) -> Arc<UploadSession> {
        let request = StartUploadRequest {
            file_name: name.to_string(),
            file_size: size,
            content_type: "text/plain".to_string(),
            client_id: Some(client.to_string()),
        };
        let dirs = StagingLayout::new("/tmp/raw", "/tmp/out").session_dirs(client, id);
        Arc::new(UploadSession::new(
            id.to_string(),
            client.to_string(),
            &request,
            4,
            dirs,
        ))
    }

    #[test]
    fn test_insert_and_lookup() {
        let store = SessionManager::new();
        let s = session("s1", "c1", "a.txt", 10);

        assert!(matches!(store.insert_new(s), InsertOutcome::Inserted));
        assert_eq!(store.len(), 1);
        assert!(store.require("s1").is_ok());
        assert!(matches!(
            store.require("nope"),
            Err(UploadError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_resume_lookup_matches_size() {
        let store = SessionManager::new();
        store.insert_new(session("s1", "c1", "a.txt", 10));

        assert!(matches!(
            store.lookup_for_resume("c1", "a.txt", 10),
            ResumeLookup::Resumable(_)
        ));
        assert!(matches!(
            store.lookup_for_resume("c1", "a.txt", 11),
            ResumeLookup::Stale(Some(_))
        ));
        assert!(matches!(
            store.lookup_for_resume("c2", "a.txt", 10),
            ResumeLookup::Absent
        ));
    }

    #[test]
    fn test_concurrent_start_loses_race() {
        let store = SessionManager::new();
        store.insert_new(session("s1", "c1", "a.txt", 10));

        match store.insert_new(session("s2", "c1", "a.txt", 10)) {
            InsertOutcome::Raced(existing) => assert_eq!(existing.session_id, "s1"),
            InsertOutcome::Inserted => panic!("second start should resume the first"),
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_clears_indexes() {
        let store = SessionManager::new();
        store.insert_new(session("s1", "c1", "a.txt", 10));
        store.pause("s1");

        let removed = store.remove("s1").unwrap();
        assert!(removed.is_closed());
        assert!(!store.is_paused("s1"));
        assert!(store.is_empty());
        assert!(matches!(
            store.lookup_for_resume("c1", "a.txt", 10),
            ResumeLookup::Absent
        ));
        assert!(store.remove("s1").is_none());
    }

    #[test]
    fn test_remove_keeps_newer_index_entry() {
        let store = SessionManager::new();
        store.insert_new(session("old", "c1", "a.txt", 10));
        // Size changed: the new session takes over the resume key
        store.insert_new(session("new", "c1", "a.txt", 20));

        store.remove("old");
        assert!(matches!(
            store.lookup_for_resume("c1", "a.txt", 20),
            ResumeLookup::Resumable(s) if s.session_id == "new"
        ));
    }

    #[test]
    fn test_inactive_since() {
        let store = SessionManager::new();
        let s = session("s1", "c1", "a.txt", 10);
        store.insert_new(Arc::clone(&s));
        store.insert_new(session("s2", "c1", "b.txt", 10));

        s.set_last_activity(Utc::now() - chrono::Duration::hours(48));
        let cutoff = Utc::now() - chrono::Duration::hours(24);

        let expired = store.inactive_since(cutoff);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].session_id, "s1");
    }
}
