use super::{EngineRole, config::EngineConfig};
use crate::core::{DbError, Result};
use crate::driver::{Driver, DriverConnection};
use crate::result::QueryResult;
use crate::session::Operation;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Connection pool for one engine role
///
/// Keeps up to `pool_size` idle connections and allows `max_overflow` more
/// to be checked out under load. Checkouts beyond that wait for up to
/// `pool_timeout` and then fail with `PoolExhausted`.
///
/// Similar to the queue pool in SQLAlchemy or deadpool's managed pools.
pub struct EnginePool {
    role: EngineRole,
    config: EngineConfig,
    driver: Arc<dyn Driver>,
    /// Idle connections, oldest first
    idle: Mutex<VecDeque<IdleConnection>>,
    /// One permit per allowed checkout
    permits: Arc<Semaphore>,
    /// Physical connections currently open (idle + checked out)
    open: AtomicUsize,
    /// Bumped by `dispose`; connections from older generations are closed
    generation: AtomicU64,
    next_id: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct ConnectionMeta {
    id: u64,
    created_at: Instant,
    generation: u64,
}

impl ConnectionMeta {
    fn is_expired(&self, recycle: Option<Duration>) -> bool {
        match recycle {
            Some(lifetime) => self.created_at.elapsed() >= lifetime,
            None => false,
        }
    }
}

struct IdleConnection {
    connection: Box<dyn DriverConnection>,
    meta: ConnectionMeta,
}

impl EnginePool {
    /// Create a pool. No connection is opened until the first checkout.
    pub fn new(role: EngineRole, config: EngineConfig, driver: Arc<dyn Driver>) -> Result<Self> {
        config.validate().map_err(DbError::ConfigError)?;

        let permits = Arc::new(Semaphore::new(config.capacity()));

        Ok(Self {
            role,
            config,
            driver,
            idle: Mutex::new(VecDeque::new()),
            permits,
            open: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn role(&self) -> EngineRole {
        self.role
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get a connection from the pool
    ///
    /// Waits up to `pool_timeout` for capacity. Idle connections that are
    /// stale, recycled, or fail their pre-ping are replaced without the
    /// caller noticing.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        let timeout = self.config.pool_timeout;
        let permit =
            match tokio::time::timeout(timeout, Arc::clone(&self.permits).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    return Err(DbError::ExecutionError(format!(
                        "{} pool is shut down",
                        self.role
                    )));
                }
                Err(_) => {
                    warn!(
                        "{} pool exhausted: {} connections checked out, waited {:?}",
                        self.role,
                        self.config.capacity(),
                        timeout
                    );
                    return Err(DbError::PoolExhausted {
                        role: self.role,
                        waited: timeout,
                    });
                }
            };

        let (connection, meta) = self.checkout().await?;

        Ok(PooledConnection {
            connection: Some(connection),
            meta,
            pool: Arc::clone(self),
            permit: Some(permit),
        })
    }

    async fn checkout(&self) -> Result<(Box<dyn DriverConnection>, ConnectionMeta)> {
        while let Some(IdleConnection {
            mut connection,
            meta,
        }) = self.pop_idle()
        {
            if meta.generation != self.generation.load(Ordering::SeqCst) {
                debug!("Closing {} connection #{} from a disposed generation", self.role, meta.id);
                self.close_connection(connection, meta).await;
                continue;
            }

            if meta.is_expired(self.config.recycle) {
                debug!("Recycling {} connection #{}", self.role, meta.id);
                self.close_connection(connection, meta).await;
                continue;
            }

            if self.config.pre_ping {
                if let Err(err) = connection.ping().await {
                    debug!(
                        "{} connection #{} failed pre-ping, replacing: {}",
                        self.role, meta.id, err
                    );
                    self.close_connection(connection, meta).await;
                    continue;
                }
            }

            return Ok((connection, meta));
        }

        self.open_connection().await
    }

    fn pop_idle(&self) -> Option<IdleConnection> {
        self.idle().pop_front()
    }

    async fn open_connection(&self) -> Result<(Box<dyn DriverConnection>, ConnectionMeta)> {
        let connection = self.driver.connect(&self.config.endpoint).await?;

        let meta = ConnectionMeta {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            created_at: Instant::now(),
            generation: self.generation.load(Ordering::SeqCst),
        };
        self.open.fetch_add(1, Ordering::SeqCst);

        debug!(
            "Opened {} connection #{} to {} ({})",
            self.role,
            meta.id,
            self.config.endpoint.address(),
            self.driver.name()
        );

        Ok((connection, meta))
    }

    async fn close_connection(&self, mut connection: Box<dyn DriverConnection>, meta: ConnectionMeta) {
        if let Err(err) = connection.close().await {
            debug!("Error closing {} connection #{}: {}", self.role, meta.id, err);
        }
        self.open.fetch_sub(1, Ordering::SeqCst);
    }

    /// The idle queue. Every critical section leaves it consistent, so a
    /// poisoned lock is recovered.
    fn idle(&self) -> MutexGuard<'_, VecDeque<IdleConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return a connection to the idle set.
    ///
    /// An open transaction is rolled back first; if that fails the connection
    /// is closed instead. Overflow and disposed-generation connections are
    /// closed as well.
    async fn checkin(&self, mut connection: Box<dyn DriverConnection>, meta: ConnectionMeta) -> Result<()> {
        if connection.is_in_transaction() {
            if let Err(err) = connection.rollback().await {
                warn!(
                    "Discarding {} connection #{}: rollback on checkin failed: {}",
                    self.role, meta.id, err
                );
                self.close_connection(connection, meta).await;
                return Err(err);
            }
        }

        if meta.generation != self.generation.load(Ordering::SeqCst) {
            self.close_connection(connection, meta).await;
            return Ok(());
        }

        let overflow = {
            let mut idle = self.idle();
            if idle.len() < self.config.pool_size {
                idle.push_back(IdleConnection { connection, meta });
                None
            } else {
                Some(connection)
            }
        };

        if let Some(connection) = overflow {
            debug!("Closing overflow {} connection #{}", self.role, meta.id);
            self.close_connection(connection, meta).await;
        }

        Ok(())
    }

    /// Close every idle connection. Connections checked out right now are
    /// closed when they come back.
    pub async fn dispose(&self) -> Result<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);

        let drained: Vec<IdleConnection> = self.idle().drain(..).collect();
        let count = drained.len();
        for IdleConnection { connection, meta } in drained {
            self.close_connection(connection, meta).await;
        }

        info!("Disposed {} pool: closed {} idle connection(s)", self.role, count);
        Ok(())
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let idle = self.idle().len();

        PoolStats {
            role: self.role,
            open_connections: self.open.load(Ordering::SeqCst),
            idle_connections: idle,
            checked_out: self
                .config
                .capacity()
                .saturating_sub(self.permits.available_permits()),
            pool_size: self.config.pool_size,
            max_overflow: self.config.max_overflow,
        }
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub role: EngineRole,
    pub open_connections: usize,
    pub idle_connections: usize,
    pub checked_out: usize,
    pub pool_size: usize,
    pub max_overflow: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} pool: {} checked out, {} idle, {} open (size {}, overflow {})",
            self.role,
            self.checked_out,
            self.idle_connections,
            self.open_connections,
            self.pool_size,
            self.max_overflow
        )
    }
}

/// RAII guard for pooled connections
///
/// Prefer `release().await`. A guard dropped without it (a cancelled task,
/// an early return) still rolls back and checks in, on a task spawned onto
/// the current runtime.
pub struct PooledConnection {
    connection: Option<Box<dyn DriverConnection>>,
    meta: ConnectionMeta,
    pool: Arc<EnginePool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn role(&self) -> EngineRole {
        self.pool.role
    }

    fn connection(&mut self) -> Result<&mut Box<dyn DriverConnection>> {
        self.connection
            .as_mut()
            .ok_or_else(|| DbError::ExecutionError("Connection already returned to pool".into()))
    }

    pub async fn execute(&mut self, operation: &Operation) -> Result<QueryResult> {
        if self.pool.config.echo {
            info!(
                target: "routedb::echo",
                "[{} #{}] {} {:?}",
                self.pool.role,
                self.meta.id,
                operation.sql(),
                operation.params()
            );
        }
        self.connection()?.execute(operation).await
    }

    pub async fn begin(&mut self) -> Result<()> {
        self.connection()?.begin().await
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.connection()?.commit().await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.connection()?.rollback().await
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.connection()?.ping().await
    }

    pub fn is_in_transaction(&self) -> bool {
        self.connection
            .as_ref()
            .map(|connection| connection.is_in_transaction())
            .unwrap_or(false)
    }

    /// Return the connection to the pool, rolling back any open transaction.
    pub async fn release(mut self) -> Result<()> {
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };
        let result = self.pool.checkin(connection, self.meta).await;
        drop(self.permit.take());
        result
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.meta.id)
            .field("role", &self.pool.role)
            .field("in_transaction", &self.is_in_transaction())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        let pool = Arc::clone(&self.pool);
        let meta = self.meta;
        let permit = self.permit.take();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = pool.checkin(connection, meta).await {
                        warn!("Deferred checkin of {} connection #{} failed: {}", pool.role, meta.id, err);
                    }
                    drop(permit);
                });
            }
            Err(_) => {
                warn!(
                    "{} connection #{} dropped outside a runtime; discarding it",
                    pool.role, meta.id
                );
                drop(connection);
                pool.open.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}
