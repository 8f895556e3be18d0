// ============================================================================
// Routing Session
// ============================================================================
//
// A unit-of-work session bound to one context key. Each operation is
// classified and sent to the writer or the reader pool; buffered operations
// are flushed to the writer before the next statement or at commit.
//
// Connections are checked out lazily, at most one per role, and held until
// commit, rollback or close. The writer connection opens a transaction on
// checkout; the reader runs in autocommit.
//
// ============================================================================

use super::context::ContextKey;
use super::operation::Operation;
use super::state::{SessionEvent, SessionState, route};
use crate::connection::pool::PooledConnection;
use crate::connection::{EngineRole, Engines};
use crate::core::{DbError, Result};
use crate::result::QueryResult;
use std::sync::Arc;
use tracing::{Level, event};

/// Where reads go once the session has written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadRouting {
    /// Reads outside a flush always go to the reader, even after a write in
    /// the same transaction.
    #[default]
    Replica,

    /// Once a writer transaction is open, reads follow it to the writer
    /// until commit or rollback.
    PrimaryAfterWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Flush pending operations before executing the next statement.
    pub autoflush: bool,
    pub read_routing: ReadRouting,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            autoflush: true,
            read_routing: ReadRouting::Replica,
        }
    }
}

impl SessionOptions {
    pub fn autoflush(mut self, enabled: bool) -> Self {
        self.autoflush = enabled;
        self
    }

    pub fn read_routing(mut self, routing: ReadRouting) -> Self {
        self.read_routing = routing;
        self
    }
}

pub struct Session {
    key: ContextKey,
    engines: Arc<Engines>,
    options: SessionOptions,
    state: SessionState,
    pending: Vec<Operation>,
    writer: Option<PooledConnection>,
    reader: Option<PooledConnection>,
}

impl Session {
    pub fn new(key: ContextKey, engines: Arc<Engines>, options: SessionOptions) -> Self {
        Self {
            key,
            engines,
            options,
            state: SessionState::Idle,
            pending: Vec::new(),
            writer: None,
            reader: None,
        }
    }

    pub fn key(&self) -> &ContextKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether a connection from `role`'s pool is currently held.
    pub fn holds_connection(&self, role: EngineRole) -> bool {
        match role {
            EngineRole::Writer => self.writer.is_some(),
            EngineRole::Reader => self.reader.is_some(),
        }
    }

    /// The pool `operation` would go to if dispatched now.
    pub fn route_for(&self, operation: &Operation) -> EngineRole {
        let role = route(self.state, operation.classify());
        match (role, self.options.read_routing) {
            (EngineRole::Reader, ReadRouting::PrimaryAfterWrite) if self.writer.is_some() => {
                EngineRole::Writer
            }
            _ => role,
        }
    }

    /// Buffer an operation for the next flush.
    pub fn add(&mut self, operation: impl Into<Operation>) -> Result<()> {
        self.ensure_open()?;
        // Recovery needs the writer; leave it to the next async call.
        if self.state == SessionState::Flushing {
            return Err(DbError::FlushInterrupted(self.key.to_string()));
        }
        self.autobegin()?;
        self.pending.push(operation.into());
        Ok(())
    }

    /// Execute one statement and return its result.
    ///
    /// With autoflush on and operations pending, the pending operations and
    /// this statement are sent together inside one flush, so the statement
    /// sees them on the writer.
    pub async fn execute(&mut self, operation: impl Into<Operation>) -> Result<QueryResult> {
        let operation = operation.into();
        self.ensure_open()?;
        self.recover_interrupted().await?;
        self.autobegin()?;

        if self.options.autoflush && !self.pending.is_empty() {
            self.transition(SessionEvent::FlushStart)?;
            let result = match self.send_pending().await {
                Ok(()) => self.dispatch(&operation).await,
                Err(err) => Err(err),
            };
            return match result {
                Ok(result) => {
                    self.transition(SessionEvent::FlushEnd)?;
                    Ok(result)
                }
                Err(err) => {
                    self.abort().await;
                    Err(err)
                }
            };
        }

        self.dispatch(&operation).await
    }

    /// Send every pending operation to the writer.
    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.recover_interrupted().await?;
        if self.pending.is_empty() {
            return Ok(());
        }

        self.transition(SessionEvent::FlushStart)?;
        match self.send_pending().await {
            Ok(()) => self.transition(SessionEvent::FlushEnd),
            Err(err) => {
                self.abort().await;
                Err(err)
            }
        }
    }

    /// Flush, commit the writer transaction and give both connections back.
    ///
    /// On failure the transaction is rolled back and the error is returned
    /// as the driver reported it.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.recover_interrupted().await?;
        if self.state == SessionState::Idle {
            return Ok(());
        }

        if let Err(err) = self.flush_and_commit().await {
            event!(Level::WARN, key = %self.key, error = %err, "session commit failed");
            self.abort().await;
            return Err(err);
        }

        if let Err(err) = self.release_connections().await {
            event!(Level::WARN, key = %self.key, error = %err, "connection release after commit failed");
        }
        self.transition(SessionEvent::Finish)?;
        event!(Level::DEBUG, key = %self.key, "session committed");
        Ok(())
    }

    /// Discard pending operations and roll back. Safe to call repeatedly.
    pub async fn rollback(&mut self) -> Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }
        self.rollback_inner().await
    }

    /// Roll back if needed and refuse every later operation.
    pub async fn close(&mut self) -> Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }
        let result = self.rollback_inner().await;
        self.transition(SessionEvent::Close)?;
        event!(Level::DEBUG, key = %self.key, "session closed");
        result
    }

    async fn flush_and_commit(&mut self) -> Result<()> {
        self.transition(SessionEvent::FlushStart)?;
        self.send_pending().await?;
        if let Some(writer) = self.writer.as_mut() {
            writer.commit().await?;
        }
        Ok(())
    }

    /// A flush whose future was dropped leaves the session `Flushing`, with
    /// the pending buffer already taken and the writer transaction open.
    /// Roll that transaction back before anything else runs.
    async fn recover_interrupted(&mut self) -> Result<()> {
        if self.state != SessionState::Flushing {
            return Ok(());
        }
        event!(Level::WARN, key = %self.key, "flush was interrupted; rolling back");
        self.abort().await;
        Err(DbError::FlushInterrupted(self.key.to_string()))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.is_closed() {
            return Err(DbError::SessionClosed(self.key.to_string()));
        }
        Ok(())
    }

    fn autobegin(&mut self) -> Result<()> {
        if self.state == SessionState::Idle {
            self.transition(SessionEvent::Begin)?;
        }
        Ok(())
    }

    fn transition(&mut self, event: SessionEvent) -> Result<()> {
        self.state = self.state.transition(event)?;
        Ok(())
    }

    async fn send_pending(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        event!(Level::DEBUG, key = %self.key, count = pending.len(), "flushing pending operations");
        for operation in &pending {
            self.dispatch(operation).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, operation: &Operation) -> Result<QueryResult> {
        let role = self.route_for(operation);
        event!(Level::TRACE, key = %self.key, role = %role, state = %self.state, "dispatch");
        let connection = self.bind(role).await?;
        connection.execute(operation).await
    }

    /// The connection for `role`, checked out on first use.
    async fn bind(&mut self, role: EngineRole) -> Result<&mut PooledConnection> {
        let slot = match role {
            EngineRole::Writer => &mut self.writer,
            EngineRole::Reader => &mut self.reader,
        };

        if slot.is_none() {
            let mut connection = self.engines.acquire_connection(role).await?;
            if role == EngineRole::Writer {
                if let Err(err) = connection.begin().await {
                    if let Err(release_err) = connection.release().await {
                        event!(Level::WARN, error = %release_err, "release after failed begin");
                    }
                    return Err(err);
                }
            }
            event!(Level::DEBUG, key = %self.key, role = %role, connection = connection.id(), "connection bound");
            *slot = Some(connection);
        }

        slot.as_mut()
            .ok_or_else(|| DbError::ExecutionError(format!("no {} connection bound", role)))
    }

    /// Rollback on a failure path. The triggering error wins; cleanup errors
    /// are only logged.
    async fn abort(&mut self) {
        if let Err(err) = self.rollback_inner().await {
            event!(Level::WARN, key = %self.key, error = %err, "rollback after failure failed");
        }
    }

    async fn rollback_inner(&mut self) -> Result<()> {
        self.pending.clear();
        let mut first_error = None;

        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.rollback().await {
                first_error.get_or_insert(err);
            }
            if let Err(err) = writer.release().await {
                first_error.get_or_insert(err);
            }
        }
        if let Some(reader) = self.reader.take() {
            if let Err(err) = reader.release().await {
                first_error.get_or_insert(err);
            }
        }

        self.transition(SessionEvent::Finish)?;
        event!(Level::DEBUG, key = %self.key, "session rolled back");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn release_connections(&mut self) -> Result<()> {
        let mut first_error = None;
        for connection in [self.writer.take(), self.reader.take()].into_iter().flatten() {
            if let Err(err) = connection.release().await {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("writer", &self.writer.as_ref().map(|c| c.id()))
            .field("reader", &self.reader.as_ref().map(|c| c.id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::{DatabaseConfig, EngineConfig, Endpoint};
    use crate::driver::MemoryDriver;
    use crate::driver::memory::JournalEvent;
    use std::time::Duration;

    struct Fixture {
        primary: MemoryDriver,
        replica: MemoryDriver,
        engines: Arc<Engines>,
    }

    fn fixture() -> Fixture {
        let primary = MemoryDriver::new("primary");
        let replica = MemoryDriver::new("replica");
        let config = DatabaseConfig::single(EngineConfig::new(Endpoint::new("localhost", "app")));
        let engines = Engines::with_drivers(
            &config,
            Arc::new(primary.clone()),
            Arc::new(replica.clone()),
        )
        .unwrap();
        Fixture {
            primary,
            replica,
            engines: Arc::new(engines),
        }
    }

    fn session(fx: &Fixture, options: SessionOptions) -> Session {
        Session::new(ContextKey::from("test"), Arc::clone(&fx.engines), options)
    }

    #[tokio::test]
    async fn test_read_goes_to_reader_write_to_writer() {
        let fx = fixture();
        let mut session = session(&fx, SessionOptions::default());

        session.execute("SELECT * FROM users").await.unwrap();
        session.execute("UPDATE users SET name = 'x'").await.unwrap();

        assert_eq!(fx.replica.statements(), vec!["SELECT * FROM users"]);
        assert_eq!(fx.primary.statements(), vec!["UPDATE users SET name = 'x'"]);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_autoflush_sends_triggering_read_to_writer() {
        let fx = fixture();
        let mut session = session(&fx, SessionOptions::default());

        session.add("INSERT INTO users VALUES (1)").unwrap();
        session.execute("SELECT * FROM users").await.unwrap();

        assert_eq!(
            fx.primary.statements(),
            vec!["INSERT INTO users VALUES (1)", "SELECT * FROM users"]
        );
        assert!(fx.replica.statements().is_empty());
        assert_eq!(session.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_without_autoflush_read_stays_on_reader() {
        let fx = fixture();
        let mut session = session(&fx, SessionOptions::default().autoflush(false));

        session.add("INSERT INTO users VALUES (1)").unwrap();
        session.execute("SELECT * FROM users").await.unwrap();

        assert_eq!(fx.replica.statements(), vec!["SELECT * FROM users"]);
        assert_eq!(session.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_primary_after_write_routing() {
        let fx = fixture();
        let mut session = session(
            &fx,
            SessionOptions::default().read_routing(ReadRouting::PrimaryAfterWrite),
        );

        session.execute("SELECT 1").await.unwrap();
        session.execute("DELETE FROM sessions").await.unwrap();
        session.execute("SELECT 2").await.unwrap();

        assert_eq!(fx.replica.statements(), vec!["SELECT 1"]);
        assert_eq!(fx.primary.statements(), vec!["DELETE FROM sessions", "SELECT 2"]);
    }

    #[tokio::test]
    async fn test_commit_releases_connections() {
        let fx = fixture();
        let mut session = session(&fx, SessionOptions::default());

        session.execute("SELECT 1").await.unwrap();
        session.add("INSERT INTO t VALUES (1)").unwrap();
        session.commit().await.unwrap();

        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.holds_connection(EngineRole::Writer));
        assert!(!session.holds_connection(EngineRole::Reader));
        assert_eq!(fx.primary.committed(), vec!["INSERT INTO t VALUES (1)"]);
        assert_eq!(fx.engines.writer().stats().checked_out, 0);
    }

    #[tokio::test]
    async fn test_read_only_commit_never_touches_writer() {
        let fx = fixture();
        let mut session = session(&fx, SessionOptions::default());

        session.execute("SELECT 1").await.unwrap();
        session.commit().await.unwrap();

        assert_eq!(fx.primary.connections_opened(), 0);
        assert_eq!(fx.replica.count(&JournalEvent::Commit), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_rolls_back() {
        let fx = fixture();
        fx.primary
            .fail_statements_containing("bad", "null value in column violates not-null constraint");
        let mut session = session(&fx, SessionOptions::default());

        session.add("INSERT INTO good VALUES (1)").unwrap();
        session.add("INSERT INTO bad VALUES (NULL)").unwrap();
        let err = session.flush().await.unwrap_err();

        assert!(matches!(err, DbError::ConstraintViolation(_)));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(fx.primary.committed().is_empty());
        assert_eq!(fx.primary.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_rollback_is_idempotent() {
        let fx = fixture();
        let mut session = session(&fx, SessionOptions::default());

        session.add("INSERT INTO t VALUES (1)").unwrap();
        session.rollback().await.unwrap();
        session.rollback().await.unwrap();

        assert_eq!(session.pending_len(), 0);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(fx.primary.statements().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_flush_rolls_back_before_commit() {
        let fx = fixture();
        let mut session = session(&fx, SessionOptions::default());

        session.add("INSERT INTO users VALUES (1)").unwrap();
        fx.primary.set_execute_delay(Duration::from_millis(200));
        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), session.execute("SELECT 1")).await;
        assert!(timed_out.is_err());
        assert_eq!(session.state(), SessionState::Flushing);
        fx.primary.set_execute_delay(Duration::ZERO);

        assert!(matches!(
            session.commit().await,
            Err(DbError::FlushInterrupted(_))
        ));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.holds_connection(EngineRole::Writer));
        assert_eq!(fx.primary.rollbacks(), 1);
        assert_eq!(fx.primary.commits(), 0);
        assert!(fx.primary.committed().is_empty());

        let read = Operation::new("SELECT 1");
        assert_eq!(session.route_for(&read), EngineRole::Reader);
        session.execute(read).await.unwrap();
        assert_eq!(fx.replica.statements(), vec!["SELECT 1"]);
    }

    #[tokio::test]
    async fn test_cancelled_flush_is_reported_by_next_execute() {
        let fx = fixture();
        let mut session = session(&fx, SessionOptions::default());

        session.add("INSERT INTO users VALUES (1)").unwrap();
        fx.primary.set_execute_delay(Duration::from_millis(200));
        let _ = tokio::time::timeout(Duration::from_millis(20), session.flush()).await;
        fx.primary.set_execute_delay(Duration::ZERO);

        assert!(matches!(
            session.add("INSERT INTO users VALUES (2)"),
            Err(DbError::FlushInterrupted(_))
        ));
        assert!(matches!(
            session.execute("SELECT * FROM users").await,
            Err(DbError::FlushInterrupted(_))
        ));
        assert_eq!(session.pending_len(), 0);
        assert_eq!(fx.primary.rollbacks(), 1);

        session.execute("INSERT INTO users VALUES (3)").await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(fx.primary.committed(), vec!["INSERT INTO users VALUES (3)"]);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_operations() {
        let fx = fixture();
        let mut session = session(&fx, SessionOptions::default());

        session.close().await.unwrap();
        session.close().await.unwrap();

        assert!(matches!(
            session.execute("SELECT 1").await,
            Err(DbError::SessionClosed(_))
        ));
        assert!(matches!(session.add("SELECT 1"), Err(DbError::SessionClosed(_))));
        assert!(matches!(session.commit().await, Err(DbError::SessionClosed(_))));
    }
}
