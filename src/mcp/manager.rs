//! Session table shared by the RPC dispatcher and the SSE handler.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::config::SseConfig;
use crate::mcp::router::ProjectRouter;
use crate::mcp::session::Session;
use crate::metrics::{Metrics, SessionSnapshot};

/// Why a request's `PROJECT_PATH` header was refused for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProjectPathMismatch {
    #[error("Invalid PROJECT_PATH")]
    Invalid,
    #[error("PROJECT_PATH does not match session-bound project")]
    Mismatch,
}

/// Owns every live session, keyed by session id.
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    router: Arc<dyn ProjectRouter>,
    config: SseConfig,
    metrics: Arc<Metrics>,
}

impl SessionManager {
    pub fn new(router: Arc<dyn ProjectRouter>, config: SseConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            sessions: DashMap::new(),
            router,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &SseConfig {
        &self.config
    }

    /// Create a session bound to `project_path` under a fresh id.
    pub fn create_session(&self, project_path: &str) -> Arc<Session> {
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(
            id.clone(),
            project_path,
            self.config.queue_size,
            self.config.history_size,
        ));
        self.sessions.insert(id, session.clone());
        self.metrics.record_session_created();
        debug!(
            "Session created: id={}, projectPath={}",
            session.id(),
            session.project_path()
        );
        session
    }

    /// Look up a session. Absent or blank ids find nothing.
    pub fn get_session(&self, session_id: Option<&str>) -> Option<Arc<Session>> {
        let id = session_id.filter(|id| !id.trim().is_empty())?;
        self.sessions.get(id).map(|e| e.value().clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Remove and close a session.
    pub fn remove_session(&self, session_id: Option<&str>) -> Option<Arc<Session>> {
        let id = session_id.filter(|id| !id.trim().is_empty())?;
        let (_, session) = self.sessions.remove(id)?;
        session.close();
        self.metrics.record_sessions_removed(1, false);
        debug!("Session removed: id={}", session.id());
        Some(session)
    }

    /// Remove `session` only if the table still maps its id to this instance.
    pub fn remove_if_same(&self, session: &Arc<Session>, expired: bool) -> bool {
        let removed = self
            .sessions
            .remove_if(session.id(), |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if removed {
            session.close();
            self.metrics.record_sessions_removed(1, expired);
        }
        removed
    }

    /// Close and drop every session.
    pub fn clear_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0;
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.close();
                removed += 1;
            }
        }
        self.metrics.record_sessions_removed(removed, false);
        if removed > 0 {
            debug!("All sessions cleared: count={}", removed);
        }
    }

    /// Close and drop every session idle for longer than `timeout`.
    ///
    /// Works one shard at a time, so lookups and inserts on other shards keep
    /// flowing while the sweep runs.
    pub fn cleanup_expired_sessions(&self, timeout: Duration) -> usize {
        let mut removed = 0;
        self.sessions.retain(|_, session| {
            if session.is_expired(timeout) {
                session.close();
                removed += 1;
                false
            } else {
                true
            }
        });
        self.metrics.record_sessions_removed(removed, true);
        removed
    }

    /// Push a payload to a session's queue. Returns `false` if the session
    /// does not exist or is closed.
    pub fn offer(&self, session_id: &str, payload: impl Into<String>) -> bool {
        match self.get_session(Some(session_id)) {
            Some(session) => session.offer_event(payload),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let mut snapshot = SessionSnapshot::default();
        for entry in self.sessions.iter() {
            let session = entry.value();
            snapshot.total += 1;
            if session.is_initialized() {
                snapshot.initialized += 1;
            }
            if session.stream_attached() {
                snapshot.stream_attached += 1;
            }
            if session.is_closed() {
                snapshot.closed += 1;
            }
            snapshot.queued_events += session.queue_len();
            snapshot.dropped_events += session.dropped_count();
        }
        snapshot
    }

    /// Check a request's `PROJECT_PATH` header against the session binding.
    /// An absent header always passes.
    pub fn validate_project_path_header(
        &self,
        project_path_header: Option<&str>,
        session: &Session,
    ) -> Result<(), ProjectPathMismatch> {
        let Some(header) = project_path_header else {
            return Ok(());
        };
        let normalized = self
            .router
            .normalize_project_path(header)
            .ok_or(ProjectPathMismatch::Invalid)?;
        if normalized != session.project_path() {
            return Err(ProjectPathMismatch::Mismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::router::WorkspaceRegistry;
    use crate::mcp::session::now_ms;

    fn manager() -> SessionManager {
        let registry = Arc::new(WorkspaceRegistry::new());
        SessionManager::new(registry, SseConfig::default(), Metrics::new())
    }

    #[test]
    fn test_create_and_get() {
        let m = manager();
        let s = m.create_session("/work/a");
        assert_eq!(m.len(), 1);

        let found = m.get_session(Some(s.id())).unwrap();
        assert!(Arc::ptr_eq(&found, &s));
        assert!(m.get_session(None).is_none());
        assert!(m.get_session(Some("")).is_none());
        assert!(m.get_session(Some("missing")).is_none());
    }

    #[test]
    fn test_session_ids_unique() {
        let m = manager();
        let a = m.create_session("/work/a");
        let b = m.create_session("/work/a");
        assert_ne!(a.id(), b.id());
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn test_remove_closes_session() {
        let m = manager();
        let s = m.create_session("/work/a");
        assert!(s.attach_stream());

        let removed = m.remove_session(Some(s.id())).unwrap();
        assert!(removed.is_closed());
        assert!(!removed.stream_attached());
        assert!(m.is_empty());
        assert!(m.remove_session(Some(s.id())).is_none());
        assert!(m.remove_session(None).is_none());
    }

    #[test]
    fn test_remove_if_same_ignores_other_instance() {
        let m = manager();
        let s = m.create_session("/work/a");
        let impostor = Arc::new(Session::new(s.id(), "/work/a", 1, 1));

        assert!(!m.remove_if_same(&impostor, true));
        assert!(m.contains(s.id()));
        assert!(m.remove_if_same(&s, true));
        assert!(!m.contains(s.id()));
        assert!(s.is_closed());
    }

    #[test]
    fn test_clear_all() {
        let m = manager();
        let sessions: Vec<_> = (0..5).map(|_| m.create_session("/work/a")).collect();
        m.clear_all();
        assert!(m.is_empty());
        assert!(sessions.iter().all(|s| s.is_closed()));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let m = manager();
        let fresh = m.create_session("/work/a");
        let stale_a = m.create_session("/work/a");
        let stale_b = m.create_session("/work/b");
        let borderline = m.create_session("/work/b");

        let now = now_ms();
        stale_a.set_last_activity_ms(now - 10_000);
        stale_b.set_last_activity_ms(now - 60_000);
        borderline.set_last_activity_ms(now - 2_000);

        let removed = m.cleanup_expired_sessions(Duration::from_secs(5));
        assert_eq!(removed, 2);
        assert!(m.contains(fresh.id()));
        assert!(m.contains(borderline.id()));
        assert!(!m.contains(stale_a.id()));
        assert!(!m.contains(stale_b.id()));
        assert!(stale_a.is_closed() && stale_b.is_closed());
        assert!(!fresh.is_closed());
    }

    #[test]
    fn test_offer_by_id() {
        let m = manager();
        let s = m.create_session("/work/a");
        assert!(m.offer(s.id(), "{}"));
        assert_eq!(s.queue_len(), 1);
        assert!(!m.offer("missing", "{}"));
    }

    #[test]
    fn test_snapshot() {
        let m = manager();
        let a = m.create_session("/work/a");
        let _b = m.create_session("/work/a");
        a.mark_initialized();
        a.attach_stream();
        a.offer_event("{}");

        let snap = m.snapshot();
        assert_eq!(snap.total, 2);
        assert_eq!(snap.initialized, 1);
        assert_eq!(snap.stream_attached, 1);
        assert_eq!(snap.queued_events, 1);
        assert_eq!(snap.closed, 0);
    }

    #[test]
    fn test_validate_project_path_header() {
        let m = manager();
        let s = m.create_session("/work/a");

        assert_eq!(m.validate_project_path_header(None, &s), Ok(()));
        assert_eq!(m.validate_project_path_header(Some("/work/a/"), &s), Ok(()));
        assert_eq!(
            m.validate_project_path_header(Some("   "), &s),
            Err(ProjectPathMismatch::Invalid)
        );
        let err = m
            .validate_project_path_header(Some("/work/b"), &s)
            .unwrap_err();
        assert_eq!(err.to_string(), "PROJECT_PATH does not match session-bound project");
    }
}
