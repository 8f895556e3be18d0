use crate::connection::EngineRole;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// A session was requested but no context key is set for this unit of work.
    #[error("No active session context")]
    NoActiveContext,

    #[error("Session context used outside of a context scope")]
    ContextScopeMissing,

    #[error("Context token mismatch: expected '{expected}', found '{found}'")]
    ContextMismatch { expected: String, found: String },

    #[error("Pool exhausted: no {role} connection available within {waited:?}")]
    PoolExhausted { role: EngineRole, waited: Duration },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Driver error: {0}")]
    DriverError(String),

    #[error("Session '{0}' is closed")]
    SessionClosed(String),

    #[error("Invalid session transition: {0}")]
    InvalidTransition(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A flush was cancelled part way; the transaction has been rolled back.
    #[error("Session '{0}' was interrupted during a flush and rolled back")]
    FlushInterrupted(String),

    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),
}

impl DbError {
    /// Errors a caller may reasonably retry. Nothing in this crate retries on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_pool_exhaustion_is_transient() {
        let exhausted = DbError::PoolExhausted {
            role: EngineRole::Writer,
            waited: Duration::from_millis(5),
        };
        assert!(exhausted.is_transient());
        assert!(!DbError::NoActiveContext.is_transient());
        assert!(!DbError::ConstraintViolation("users_email_key".into()).is_transient());
    }

    #[test]
    fn test_pool_exhausted_message_names_role() {
        let err = DbError::PoolExhausted {
            role: EngineRole::Reader,
            waited: Duration::from_secs(1),
        };
        assert!(err.to_string().contains("reader"));
    }
}
