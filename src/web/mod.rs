//! Request scope for axum services.
//!
//! `session_scope` gives every request its own unit of work: a fresh context
//! key for the duration of the handler and a session that is released when
//! the response is ready. Handlers reach the session through the `DbSession`
//! extractor, `SessionRegistry::current`, or `Transactional`.
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/users", post(create_user))
//!     .layer(middleware::from_fn_with_state(registry.clone(), session_scope))
//!     .with_state(registry);
//! ```

use crate::core::DbError;
use crate::session::registry::ReleaseGuard;
use crate::session::{ContextKey, ScopedSession, SessionContext, SessionRegistry};
use axum::Json;
use axum::async_trait;
use axum::extract::{FromRef, FromRequestParts, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use http::request::Parts;
use serde::Serialize;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Middleware: run the request inside its own session context.
///
/// Install with `axum::middleware::from_fn_with_state`. The session is
/// released after the handler returns, whether it succeeded or not, and
/// also when the request future is dropped.
pub async fn session_scope(
    State(registry): State<Arc<SessionRegistry>>,
    request: Request,
    next: Next,
) -> Response {
    let key = ContextKey::generate();
    let span = info_span!(
        "request.session",
        key = %key,
        method = %request.method(),
        path = %request.uri().path()
    );

    async {
        let guard = ReleaseGuard::new(&registry, key.clone());
        let response = SessionContext::run(key.clone(), next.run(request)).await;

        if let Err(err) = registry.release(&key).await {
            event!(Level::WARN, error = %err, "request session release failed");
        }
        guard.disarm();

        event!(Level::DEBUG, status = %response.status(), "request finished");
        response
    }
    .instrument(span)
    .await
}

/// Extractor for the session of the current request.
///
/// Requires `session_scope` on the route; without it extraction fails with
/// a 500.
pub struct DbSession(pub ScopedSession);

impl Deref for DbSession {
    type Target = ScopedSession;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for DbSession
where
    Arc<SessionRegistry>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = WebError;

    async fn from_request_parts(
        _parts: &mut Parts,
        state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let registry = Arc::<SessionRegistry>::from_ref(state);
        Ok(DbSession(registry.current()?))
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug)]
pub enum WebError {
    Database(DbError),
    Input(String),
    NotFound(String),
}

impl From<DbError> for WebError {
    fn from(err: DbError) -> Self {
        WebError::Database(err)
    }
}

impl WebError {
    pub fn status(&self) -> StatusCode {
        match self {
            WebError::Database(DbError::ConstraintViolation(_)) => StatusCode::CONFLICT,
            WebError::Database(DbError::PoolExhausted { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            WebError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            WebError::Input(_) => StatusCode::UNPROCESSABLE_ENTITY,
            WebError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, code) = match self {
            WebError::Database(DbError::ConstraintViolation(msg)) => (msg, "conflict"),
            WebError::Database(err @ DbError::PoolExhausted { .. }) => {
                (err.to_string(), "unavailable")
            }
            WebError::Database(err) => {
                event!(Level::ERROR, error = %err, "database error");
                (err.to_string(), "database_error")
            }
            WebError::Input(msg) => (msg, "input_error"),
            WebError::NotFound(msg) => (msg, "not_found"),
        };

        let body = Json(ErrorResponse {
            error: message,
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, WebError>;
