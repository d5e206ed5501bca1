use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{TimeDelta, Utc};

use crate::error::AppError;
use crate::models::Session;
use crate::traits::SessionStore;

/// Process-local SessionStore for dry runs and single-shot CLI invocations.
///
/// Enforces the same rules as the database store: no overwriting an existing
/// id, no checkpoints after a terminal state, no assignment changes.
#[derive(Debug, Clone)]
pub struct MemorySessionStore {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    retention: TimeDelta,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(TimeDelta::days(30))
    }
}

impl MemorySessionStore {
    pub fn new(retention: TimeDelta) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            retention,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_expired(&self, session: &Session) -> bool {
        session.started_at + self.retention <= Utc::now()
    }
}

impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &Session) -> Result<(), AppError> {
        let mut sessions = self.lock();
        if let Some(existing) = sessions.get(&session.session_id)
            && !self.is_expired(existing)
        {
            return Err(AppError::SessionConflict(session.session_id.clone()));
        }
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn checkpoint(&self, session: &Session) -> Result<(), AppError> {
        let mut sessions = self.lock();
        let stored = sessions.get_mut(&session.session_id).ok_or_else(|| {
            AppError::StoreError(format!("Session {} not found", session.session_id))
        })?;

        if stored.is_terminal() {
            return Err(AppError::StoreError(format!(
                "Session {} is already {}",
                session.session_id, stored.status
            )));
        }
        if stored.assigned_areas != session.assigned_areas {
            return Err(AppError::StoreError(format!(
                "Session {} area assignment cannot change",
                session.session_id
            )));
        }

        *stored = session.clone();
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>, AppError> {
        Ok(self
            .lock()
            .get(session_id)
            .filter(|s| !self.is_expired(s))
            .cloned())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Session>, AppError> {
        let sessions = self.lock();
        let mut live: Vec<Session> = sessions
            .values()
            .filter(|s| !self.is_expired(s))
            .cloned()
            .collect();
        live.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        live.truncate(limit);
        Ok(live)
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        let mut sessions = self.lock();
        let before = sessions.len();
        let retention = self.retention;
        let now = Utc::now();
        sessions.retain(|_, s| s.started_at + retention > now);
        Ok((before - sessions.len()) as u64)
    }
}
