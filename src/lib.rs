// ============================================================================
// routedb Library
// ============================================================================
//
// Request-scoped database sessions for async services. Each unit of work
// (a request, a job, a script run) gets one session; the session sends reads
// to a reader pool and writes to a writer pool, and wrappers decide when it
// commits.
//
// ============================================================================

pub mod connection;
pub mod core;
pub mod driver;
pub mod result;
pub mod session;
pub mod settings;
pub mod web;

// Re-export main types for convenience
pub use core::{DbError, Result, Value};
pub use result::{QueryResult, Row};

// Re-export pool API
pub use connection::{
    EngineRole, Engines,
    config::{DatabaseConfig, EngineConfig, Endpoint},
    pool::{EnginePool, PoolStats, PooledConnection},
};

// Re-export drivers
pub use driver::{Driver, DriverConnection, MemoryDriver, PostgresDriver};

// Re-export session API
pub use session::{
    ContextKey, ContextToken, Operation, OperationKind, ReadRouting, ScopedSession, Session,
    SessionContext, SessionOptions, SessionRegistry, SessionState, Transactional,
    standalone_session, transactional,
};

pub use settings::{Environment, Settings};
