// ============================================================================
// Session context: the unit-of-work key for the current task
// ============================================================================
//
// The key lives in a tokio task-local. A frame is opened per unit of work
// (request, job, script run) with `scope` or `run`; code running inside the
// frame reads the key with `get`. Tasks spawned from inside a frame start
// with no frame at all, so sibling units of work can never see each other's
// key. Use `propagate` when a unit of work deliberately fans out.
//
// ============================================================================

use crate::core::{DbError, Result};
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT_KEY: RefCell<Option<ContextKey>>;
}

/// Opaque identifier of one unit of work. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextKey(Arc<str>);

impl ContextKey {
    /// A fresh random key. Keys are never reused across units of work.
    pub fn generate() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextKey {
    fn from(key: &str) -> Self {
        Self(Arc::from(key))
    }
}

impl From<String> for ContextKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

/// Returned by `SessionContext::set`; hand it back to `reset`.
#[must_use = "pass the token to SessionContext::reset"]
#[derive(Debug)]
pub struct ContextToken {
    key: ContextKey,
    previous: Option<ContextKey>,
}

impl ContextToken {
    pub fn key(&self) -> &ContextKey {
        &self.key
    }
}

/// Accessors for the task-local context key.
pub struct SessionContext;

impl SessionContext {
    /// Run `fut` inside a new, empty context frame.
    pub async fn scope<F: Future>(fut: F) -> F::Output {
        CURRENT_KEY.scope(RefCell::new(None), fut).await
    }

    /// Run `fut` inside a new frame with `key` installed.
    pub async fn run<F: Future>(key: ContextKey, fut: F) -> F::Output {
        CURRENT_KEY.scope(RefCell::new(Some(key)), fut).await
    }

    /// Install `key` in the current frame.
    pub fn set(key: ContextKey) -> Result<ContextToken> {
        let previous = CURRENT_KEY
            .try_with(|cell| cell.replace(Some(key.clone())))
            .map_err(|_| DbError::ContextScopeMissing)?;
        Ok(ContextToken { key, previous })
    }

    /// The key of the current unit of work.
    pub fn get() -> Result<ContextKey> {
        Self::current().ok_or(DbError::NoActiveContext)
    }

    /// Like `get`, but `None` instead of an error.
    pub fn current() -> Option<ContextKey> {
        CURRENT_KEY
            .try_with(|cell| cell.borrow().clone())
            .ok()
            .flatten()
    }

    /// Restore whatever was installed before the matching `set`.
    ///
    /// Fails if another key has been installed since, which means set/reset
    /// calls were interleaved.
    pub fn reset(token: ContextToken) -> Result<()> {
        CURRENT_KEY
            .try_with(|cell| {
                let mut slot = cell.borrow_mut();
                match slot.as_ref() {
                    Some(current) if *current == token.key => {
                        *slot = token.previous;
                        Ok(())
                    }
                    other => Err(DbError::ContextMismatch {
                        expected: token.key.to_string(),
                        found: other
                            .map(|key| key.to_string())
                            .unwrap_or_else(|| "<none>".to_string()),
                    }),
                }
            })
            .map_err(|_| DbError::ContextScopeMissing)?
    }

    /// Wrap `fut` so it runs under the current key, for handing work to
    /// `tokio::spawn` that belongs to the same unit of work.
    pub fn propagate<F: Future>(fut: F) -> Result<impl Future<Output = F::Output>> {
        let key = Self::get()?;
        Ok(Self::run(key, fut))
    }

    /// Whether a context frame is open on this task.
    pub fn is_scoped() -> bool {
        CURRENT_KEY.try_with(|_| ()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_context_outside_scope() {
        assert!(!SessionContext::is_scoped());
        assert!(matches!(SessionContext::get(), Err(DbError::NoActiveContext)));
        assert!(matches!(
            SessionContext::set(ContextKey::from("a")),
            Err(DbError::ContextScopeMissing)
        ));
    }

    #[tokio::test]
    async fn test_set_get_reset() {
        SessionContext::scope(async {
            assert!(matches!(SessionContext::get(), Err(DbError::NoActiveContext)));

            let token = SessionContext::set(ContextKey::from("request-1")).unwrap();
            assert_eq!(SessionContext::get().unwrap().as_str(), "request-1");

            SessionContext::reset(token).unwrap();
            assert!(SessionContext::current().is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn test_nested_set_restores_previous() {
        SessionContext::run(ContextKey::from("outer"), async {
            let token = SessionContext::set(ContextKey::from("inner")).unwrap();
            assert_eq!(SessionContext::get().unwrap().as_str(), "inner");
            SessionContext::reset(token).unwrap();
            assert_eq!(SessionContext::get().unwrap().as_str(), "outer");
        })
        .await;
    }

    #[tokio::test]
    async fn test_interleaved_reset_is_rejected() {
        SessionContext::scope(async {
            let first = SessionContext::set(ContextKey::from("first")).unwrap();
            let _second = SessionContext::set(ContextKey::from("second")).unwrap();

            let err = SessionContext::reset(first).unwrap_err();
            assert!(matches!(err, DbError::ContextMismatch { .. }));
        })
        .await;
    }

    #[tokio::test]
    async fn test_spawned_task_does_not_inherit_key() {
        SessionContext::run(ContextKey::from("parent"), async {
            let child = tokio::spawn(async { SessionContext::current() })
                .await
                .unwrap();
            assert!(child.is_none());

            let propagated = tokio::spawn(
                SessionContext::propagate(async { SessionContext::current() }).unwrap(),
            )
            .await
            .unwrap();
            assert_eq!(propagated.unwrap().as_str(), "parent");
        })
        .await;
    }

    #[tokio::test]
    async fn test_concurrent_frames_are_isolated() {
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                tokio::spawn(SessionContext::run(
                    ContextKey::from(format!("task-{}", i)),
                    async move {
                        tokio::task::yield_now().await;
                        (i, SessionContext::get().unwrap())
                    },
                ))
            })
            .collect();

        for task in tasks {
            let (i, key) = task.await.unwrap();
            assert_eq!(key.as_str(), format!("task-{}", i));
        }
    }

    #[test]
    fn test_generated_keys_are_unique() {
        assert_ne!(ContextKey::generate(), ContextKey::generate());
    }
}
