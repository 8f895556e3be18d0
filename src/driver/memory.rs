// ============================================================================
// In-memory recording driver
// ============================================================================
//
// Stands in for a database endpoint during development and tests. Every
// connection writes to a shared journal, statements run inside a transaction
// are only "committed" when COMMIT succeeds, and faults can be injected to
// exercise failure paths (broken pings, constraint violations on commit,
// slow statements).
//
// ============================================================================

use super::{Driver, DriverConnection};
use crate::connection::config::Endpoint;
use crate::core::{DbError, Result};
use crate::result::QueryResult;
use crate::session::{Operation, OperationKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEvent {
    Connect,
    Execute(String),
    Begin,
    Commit,
    Rollback,
    Ping,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub connection: u64,
    pub event: JournalEvent,
}

#[derive(Default)]
struct Faults {
    failing_pings: usize,
    commit_errors: Vec<String>,
    statement_errors: Vec<(String, String)>,
    refuse_connections: bool,
    execute_delay: Option<Duration>,
}

struct MemoryState {
    name: String,
    next_id: AtomicU64,
    open: AtomicUsize,
    journal: Mutex<Vec<JournalEntry>>,
    committed: Mutex<Vec<String>>,
    stubs: Mutex<Vec<(String, QueryResult)>>,
    faults: Mutex<Faults>,
}

impl MemoryState {
    fn record(&self, connection: u64, event: JournalEvent) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(JournalEntry { connection, event });
        }
    }
}

/// Driver whose "database" is a journal in memory.
///
/// Clones share the same journal, so a test can keep one handle while the
/// pool owns another.
#[derive(Clone)]
pub struct MemoryDriver {
    state: Arc<MemoryState>,
}

impl MemoryDriver {
    pub fn new(name: &str) -> Self {
        Self {
            state: Arc::new(MemoryState {
                name: name.to_string(),
                next_id: AtomicU64::new(1),
                open: AtomicUsize::new(0),
                journal: Mutex::new(Vec::new()),
                committed: Mutex::new(Vec::new()),
                stubs: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
            }),
        }
    }

    pub fn endpoint_name(&self) -> &str {
        &self.state.name
    }

    /// Return `result` for any statement starting with `sql_prefix`
    /// (case-insensitive). Unstubbed reads return an empty result.
    pub fn stub_query(&self, sql_prefix: &str, result: QueryResult) {
        if let Ok(mut stubs) = self.state.stubs.lock() {
            stubs.push((sql_prefix.to_lowercase(), result));
        }
    }

    /// The next `count` pings fail.
    pub fn fail_pings(&self, count: usize) {
        if let Ok(mut faults) = self.state.faults.lock() {
            faults.failing_pings = count;
        }
    }

    /// The next COMMIT fails with a constraint violation.
    pub fn fail_next_commit(&self, message: &str) {
        if let Ok(mut faults) = self.state.faults.lock() {
            faults.commit_errors.push(message.to_string());
        }
    }

    /// Every statement containing `pattern` fails with a constraint violation.
    pub fn fail_statements_containing(&self, pattern: &str, message: &str) {
        if let Ok(mut faults) = self.state.faults.lock() {
            faults
                .statement_errors
                .push((pattern.to_string(), message.to_string()));
        }
    }

    pub fn refuse_connections(&self, refuse: bool) {
        if let Ok(mut faults) = self.state.faults.lock() {
            faults.refuse_connections = refuse;
        }
    }

    /// Every statement sleeps this long before completing.
    pub fn set_execute_delay(&self, delay: Duration) {
        if let Ok(mut faults) = self.state.faults.lock() {
            faults.execute_delay = Some(delay);
        }
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state
            .journal
            .lock()
            .map(|journal| journal.clone())
            .unwrap_or_default()
    }

    /// SQL of every statement executed, in order, committed or not.
    pub fn statements(&self) -> Vec<String> {
        self.journal()
            .into_iter()
            .filter_map(|entry| match entry.event {
                JournalEvent::Execute(sql) => Some(sql),
                _ => None,
            })
            .collect()
    }

    /// SQL of statements that are durable: autocommitted, or part of a
    /// transaction that committed.
    pub fn committed(&self) -> Vec<String> {
        self.state
            .committed
            .lock()
            .map(|committed| committed.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, event: &JournalEvent) -> usize {
        self.journal()
            .iter()
            .filter(|entry| &entry.event == event)
            .count()
    }

    pub fn commits(&self) -> usize {
        self.count(&JournalEvent::Commit)
    }

    pub fn rollbacks(&self) -> usize {
        self.count(&JournalEvent::Rollback)
    }

    pub fn connections_opened(&self) -> usize {
        self.count(&JournalEvent::Connect)
    }

    /// Connections neither closed nor dropped.
    pub fn open_connections(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn DriverConnection>> {
        let refused = self.state.faults.lock()?.refuse_connections;
        if refused {
            return Err(DbError::DriverError(format!(
                "connection refused by {}",
                endpoint.address()
            )));
        }

        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        self.state.open.fetch_add(1, Ordering::SeqCst);
        self.state.record(id, JournalEvent::Connect);

        Ok(Box::new(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
            transaction: None,
            closed: false,
        }))
    }
}

struct MemoryConnection {
    id: u64,
    state: Arc<MemoryState>,
    /// Statements buffered by the open transaction, if any.
    transaction: Option<Vec<String>>,
    closed: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(DbError::DriverError("connection is closed".into()));
        }
        Ok(())
    }

    fn stubbed(&self, sql: &str) -> Option<QueryResult> {
        let lowered = sql.trim_start().to_lowercase();
        let stubs = self.state.stubs.lock().ok()?;
        stubs
            .iter()
            .find(|(prefix, _)| lowered.starts_with(prefix.as_str()))
            .map(|(_, result)| result.clone())
    }
}

#[async_trait]
impl DriverConnection for MemoryConnection {
    async fn execute(&mut self, operation: &Operation) -> Result<QueryResult> {
        self.ensure_open()?;
        let sql = operation.sql().to_string();
        self.state.record(self.id, JournalEvent::Execute(sql.clone()));

        let (delay, failure) = {
            let faults = self.state.faults.lock()?;
            let failure = faults
                .statement_errors
                .iter()
                .find(|(pattern, _)| sql.contains(pattern.as_str()))
                .map(|(_, message)| message.clone());
            (faults.execute_delay, failure)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = failure {
            return Err(DbError::ConstraintViolation(message));
        }

        let result = match self.stubbed(&sql) {
            Some(result) => result,
            None if operation.classify() == OperationKind::Read => QueryResult::empty(),
            None => QueryResult::affected(1),
        };

        match self.transaction.as_mut() {
            Some(buffer) => buffer.push(sql),
            None => self.state.committed.lock()?.push(sql),
        }

        Ok(result)
    }

    async fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.transaction.is_some() {
            return Err(DbError::ExecutionError("Transaction already active".into()));
        }
        self.state.record(self.id, JournalEvent::Begin);
        self.transaction = Some(Vec::new());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let buffer = self
            .transaction
            .take()
            .ok_or_else(|| DbError::ExecutionError("No active transaction".into()))?;
        self.state.record(self.id, JournalEvent::Commit);

        let failure = {
            let mut faults = self.state.faults.lock()?;
            if faults.commit_errors.is_empty() {
                None
            } else {
                Some(faults.commit_errors.remove(0))
            }
        };

        // A failed commit aborts the transaction, like a server-side
        // deferred constraint would.
        if let Some(message) = failure {
            return Err(DbError::ConstraintViolation(message));
        }

        self.state.committed.lock()?.extend(buffer);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.state.record(self.id, JournalEvent::Rollback);
        self.transaction = None;
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.state.record(self.id, JournalEvent::Ping);
        let mut faults = self.state.faults.lock()?;
        if faults.failing_pings > 0 {
            faults.failing_pings -= 1;
            return Err(DbError::DriverError("server closed the connection".into()));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.state.record(self.id, JournalEvent::Close);
        self.transaction = None;
        self.closed = true;
        self.state.open.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_in_transaction(&self) -> bool {
        self.transaction.is_some()
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.state.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
