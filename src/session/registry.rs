// ============================================================================
// Scoped Session Registry
// ============================================================================
//
// Maps context keys to sessions. At most one session exists per key; it is
// created on first request and removed on release. The registry is an
// ordinary service object: build one at startup and share it.
//
// ============================================================================

use super::context::{ContextKey, SessionContext};
use super::operation::Operation;
use super::routing::{Session, SessionOptions};
use super::state::SessionState;
use crate::connection::Engines;
use crate::core::Result;
use crate::result::QueryResult;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::MutexGuard;
use tracing::{Level, event};

/// Shared handle to a registered session.
///
/// Clones refer to the same session. Calls are serialized by the session's
/// own lock, so one unit of work never runs two operations on it at once.
#[derive(Clone)]
pub struct ScopedSession {
    key: ContextKey,
    inner: Arc<tokio::sync::Mutex<Session>>,
}

impl ScopedSession {
    fn new(session: Session) -> Self {
        Self {
            key: session.key().clone(),
            inner: Arc::new(tokio::sync::Mutex::new(session)),
        }
    }

    pub fn key(&self) -> &ContextKey {
        &self.key
    }

    /// Whether both handles point at the same session instance.
    pub fn ptr_eq(&self, other: &ScopedSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Lock the session for a sequence of calls.
    pub async fn lock(&self) -> MutexGuard<'_, Session> {
        self.inner.lock().await
    }

    pub async fn add(&self, operation: impl Into<Operation>) -> Result<()> {
        self.inner.lock().await.add(operation)
    }

    pub async fn execute(&self, operation: impl Into<Operation>) -> Result<QueryResult> {
        self.inner.lock().await.execute(operation).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.inner.lock().await.flush().await
    }

    pub async fn commit(&self) -> Result<()> {
        self.inner.lock().await.commit().await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.inner.lock().await.rollback().await
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.lock().await.close().await
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state()
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.lock().await.pending_len()
    }
}

impl std::fmt::Debug for ScopedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedSession").field("key", &self.key).finish()
    }
}

pub struct SessionRegistry {
    engines: Arc<Engines>,
    options: SessionOptions,
    sessions: Mutex<HashMap<ContextKey, ScopedSession>>,
    created: AtomicU64,
}

impl SessionRegistry {
    pub fn new(engines: Arc<Engines>) -> Self {
        Self::with_options(engines, SessionOptions::default())
    }

    pub fn with_options(engines: Arc<Engines>, options: SessionOptions) -> Self {
        Self {
            engines,
            options,
            sessions: Mutex::new(HashMap::new()),
            created: AtomicU64::new(0),
        }
    }

    pub fn engines(&self) -> &Arc<Engines> {
        &self.engines
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    /// The session for `key`, created if absent.
    ///
    /// Lookup and insert happen under one lock, so concurrent callers with
    /// the same key always get the same instance.
    pub fn get_or_create(&self, key: &ContextKey) -> Result<ScopedSession> {
        let mut sessions = self.sessions.lock()?;
        if let Some(session) = sessions.get(key) {
            return Ok(session.clone());
        }

        let session = ScopedSession::new(Session::new(
            key.clone(),
            Arc::clone(&self.engines),
            self.options,
        ));
        sessions.insert(key.clone(), session.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        event!(Level::DEBUG, key = %key, "session created");

        Ok(session)
    }

    /// The session of the current unit of work.
    pub fn current(&self) -> Result<ScopedSession> {
        let key = SessionContext::get()?;
        self.get_or_create(&key)
    }

    pub fn contains(&self, key: &ContextKey) -> bool {
        self.sessions
            .lock()
            .map(|sessions| sessions.contains_key(key))
            .unwrap_or(false)
    }

    /// Remove the session for `key` and close it.
    ///
    /// Releasing a key that has no session does nothing.
    pub async fn release(&self, key: &ContextKey) -> Result<()> {
        let Some(session) = self.discard(key) else {
            event!(Level::DEBUG, key = %key, "release of unknown session ignored");
            return Ok(());
        };

        session.close().await?;
        event!(Level::DEBUG, key = %key, "session released");
        Ok(())
    }

    /// Number of sessions currently registered.
    pub fn active_sessions(&self) -> usize {
        self.sessions
            .lock()
            .map(|sessions| sessions.len())
            .unwrap_or(0)
    }

    /// Number of sessions ever created.
    pub fn sessions_created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    /// Drop the entry without closing the session. Its connections roll back
    /// when the last handle goes away.
    pub(crate) fn discard(&self, key: &ContextKey) -> Option<ScopedSession> {
        match self.sessions.lock() {
            Ok(mut sessions) => sessions.remove(key),
            Err(poisoned) => poisoned.into_inner().remove(key),
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("engines", &self.engines)
            .field("active_sessions", &self.active_sessions())
            .finish()
    }
}

/// Removes a registry entry when a unit of work is dropped before it could
/// release its session.
pub(crate) struct ReleaseGuard<'a> {
    registry: &'a SessionRegistry,
    key: ContextKey,
    armed: bool,
}

impl<'a> ReleaseGuard<'a> {
    pub(crate) fn new(registry: &'a SessionRegistry, key: ContextKey) -> Self {
        Self {
            registry,
            key,
            armed: true,
        }
    }

    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.registry.discard(&self.key).is_some() {
            event!(Level::WARN, key = %self.key, "unit of work dropped before release; session discarded");
        }
    }
}
