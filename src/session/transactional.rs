// ============================================================================
// Unit-of-work wrappers
// ============================================================================
//
// Two ways to run a piece of work against a session:
//
// - `Transactional` joins the session of the current unit of work (a request,
//   usually). It rolls back on failure and leaves the session registered;
//   whoever opened the context releases it.
// - `standalone_session` opens its own context and session, commits on
//   success, rolls back on failure and always releases. Scripts and
//   background jobs use this.
//
// Both hand the caller's error back untouched and re-raise panics after
// cleaning up.
//
// ============================================================================

use super::context::{ContextKey, SessionContext};
use super::registry::{ReleaseGuard, ScopedSession, SessionRegistry};
use crate::core::DbError;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{Instrument, Level, event, info_span};

/// Wrapper for work inside an existing unit of work.
///
/// ```ignore
/// Transactional::new(&registry)
///     .commit_on_success(true)
///     .run(|session| async move {
///         session.execute(Operation::new("UPDATE users SET active = $1").bind(false)).await?;
///         Ok::<_, DbError>(())
///     })
///     .await?;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Transactional<'a> {
    registry: &'a SessionRegistry,
    commit_on_success: bool,
}

impl<'a> Transactional<'a> {
    pub fn new(registry: &'a SessionRegistry) -> Self {
        Self {
            registry,
            commit_on_success: false,
        }
    }

    /// Commit the ambient session when the work succeeds. Off by default:
    /// the owner of the unit of work decides when to commit.
    pub fn commit_on_success(mut self, commit: bool) -> Self {
        self.commit_on_success = commit;
        self
    }

    /// Run `op` with the current unit of work's session.
    ///
    /// Fails with `NoActiveContext` before running anything if no context is
    /// set. On error or panic the session is rolled back and the error or
    /// panic is passed on unchanged.
    pub async fn run<F, Fut, T, E>(self, op: F) -> Result<T, E>
    where
        F: FnOnce(ScopedSession) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        let session = self.registry.current()?;
        let span = info_span!("session.transactional", key = %session.key());

        async move {
            let outcome = AssertUnwindSafe(async { op(session.clone()).await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(value)) => {
                    if self.commit_on_success {
                        // A failed commit has already rolled back.
                        if let Err(err) = session.commit().await {
                            return Err(E::from(err));
                        }
                    }
                    Ok(value)
                }
                Ok(Err(err)) => {
                    rollback_quietly(&session).await;
                    Err(err)
                }
                Err(panic) => {
                    rollback_quietly(&session).await;
                    std::panic::resume_unwind(panic)
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Shorthand for `Transactional::new(registry).run(op)`.
pub async fn transactional<F, Fut, T, E>(registry: &SessionRegistry, op: F) -> Result<T, E>
where
    F: FnOnce(ScopedSession) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<DbError>,
{
    Transactional::new(registry).run(op).await
}

/// Run `op` in a session of its own.
///
/// A fresh context key is installed for the duration of the call, so code
/// inside may also reach the session through `registry.current()`. On `Ok`
/// the session is committed; a commit failure is returned as the error. On
/// `Err` or panic it is rolled back. In every case the session is released
/// and the previous context is back in place when this returns.
///
/// ```
/// # use std::sync::Arc;
/// # use routedb::*;
/// # tokio_test::block_on(async {
/// let driver = MemoryDriver::new("primary");
/// let config = DatabaseConfig::single(EngineConfig::new(Endpoint::new("localhost", "app")));
/// let engines = Engines::from_config(&config, Arc::new(driver.clone()))?;
/// let registry = SessionRegistry::new(Arc::new(engines));
///
/// standalone_session(&registry, |session| async move {
///     session.add("INSERT INTO users (email) VALUES ('a@b.c')").await?;
///     Ok::<_, DbError>(())
/// })
/// .await?;
///
/// assert_eq!(driver.committed().len(), 1);
/// assert_eq!(registry.active_sessions(), 0);
/// # Ok::<(), DbError>(())
/// # }).unwrap();
/// ```
pub async fn standalone_session<F, Fut, T, E>(registry: &SessionRegistry, op: F) -> Result<T, E>
where
    F: FnOnce(ScopedSession) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<DbError>,
{
    let key = ContextKey::generate();
    let span = info_span!("session.standalone", key = %key);

    SessionContext::run(key.clone(), run_standalone(registry, key, op))
        .instrument(span)
        .await
}

async fn run_standalone<F, Fut, T, E>(registry: &SessionRegistry, key: ContextKey, op: F) -> Result<T, E>
where
    F: FnOnce(ScopedSession) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<DbError>,
{
    let guard = ReleaseGuard::new(registry, key.clone());
    let session = registry.get_or_create(&key)?;

    let outcome = AssertUnwindSafe(async { op(session.clone()).await })
        .catch_unwind()
        .await;

    let outcome = match outcome {
        Ok(Ok(value)) => Ok(session.commit().await.map(|()| value).map_err(E::from)),
        Ok(Err(err)) => {
            rollback_quietly(&session).await;
            Ok(Err(err))
        }
        Err(panic) => {
            rollback_quietly(&session).await;
            Err(panic)
        }
    };

    drop(session);
    if let Err(err) = registry.release(&key).await {
        event!(Level::WARN, key = %key, error = %err, "standalone session release failed");
    }
    guard.disarm();

    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

async fn rollback_quietly(session: &ScopedSession) {
    if let Err(err) = session.rollback().await {
        event!(Level::WARN, key = %session.key(), error = %err, "rollback after failure failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Engines;
    use crate::connection::config::{DatabaseConfig, EngineConfig, Endpoint};
    use crate::driver::MemoryDriver;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn registry(driver: &MemoryDriver) -> SessionRegistry {
        let config = DatabaseConfig::single(EngineConfig::new(Endpoint::new("localhost", "app")));
        let engines = Engines::from_config(&config, Arc::new(driver.clone())).unwrap();
        SessionRegistry::new(Arc::new(engines))
    }

    #[tokio::test]
    async fn test_standalone_commits_and_releases() {
        let driver = MemoryDriver::new("db");
        let registry = registry(&driver);

        let value = standalone_session(&registry, |session| async move {
            session.add("INSERT INTO users VALUES (1)").await?;
            Ok::<_, DbError>(7)
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(driver.committed(), vec!["INSERT INTO users VALUES (1)"]);
        assert_eq!(registry.active_sessions(), 0);
        assert!(SessionContext::current().is_none());
    }

    #[tokio::test]
    async fn test_ambient_without_context_fails_fast() {
        let driver = MemoryDriver::new("db");
        let registry = registry(&driver);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let result = transactional(&registry, move |_session| async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, DbError>(())
        })
        .await;

        assert!(matches!(result, Err(DbError::NoActiveContext)));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_ambient_does_not_commit_by_default() {
        let driver = MemoryDriver::new("db");
        let registry = registry(&driver);

        SessionContext::run(ContextKey::from("req"), async {
            transactional(&registry, |session| async move {
                session.execute("INSERT INTO t VALUES (1)").await?;
                Ok::<_, DbError>(())
            })
            .await
            .unwrap();
        })
        .await;

        assert!(driver.committed().is_empty());
        assert_eq!(registry.active_sessions(), 1);
    }
}
