pub mod config;
pub mod pool;

use crate::core::{DbError, Result};
use crate::driver::Driver;
use config::DatabaseConfig;
use pool::{EnginePool, PoolStats, PooledConnection};
use std::fmt;
use std::sync::Arc;

/// Which pool a connection comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineRole {
    Writer,
    Reader,
}

impl fmt::Display for EngineRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineRole::Writer => write!(f, "writer"),
            EngineRole::Reader => write!(f, "reader"),
        }
    }
}

/// The writer and reader pools, built once at startup and shared by every
/// session.
///
/// Both pools may point at the same database; routing still holds, only the
/// pool accounting differs.
#[derive(Clone)]
pub struct Engines {
    writer: Arc<EnginePool>,
    reader: Arc<EnginePool>,
}

impl Engines {
    pub fn new(writer: EnginePool, reader: EnginePool) -> Result<Self> {
        if writer.role() != EngineRole::Writer || reader.role() != EngineRole::Reader {
            return Err(DbError::ConfigError(format!(
                "expected writer and reader pools, got {} and {}",
                writer.role(),
                reader.role()
            )));
        }

        Ok(Self {
            writer: Arc::new(writer),
            reader: Arc::new(reader),
        })
    }

    /// Build both pools from config. One driver serves both roles.
    pub fn from_config(config: &DatabaseConfig, driver: Arc<dyn Driver>) -> Result<Self> {
        let writer = EnginePool::new(EngineRole::Writer, config.writer.clone(), Arc::clone(&driver))?;
        let reader = EnginePool::new(EngineRole::Reader, config.reader.clone(), driver)?;
        Self::new(writer, reader)
    }

    /// Build the pools with a separate driver per role.
    pub fn with_drivers(
        config: &DatabaseConfig,
        writer_driver: Arc<dyn Driver>,
        reader_driver: Arc<dyn Driver>,
    ) -> Result<Self> {
        let writer = EnginePool::new(EngineRole::Writer, config.writer.clone(), writer_driver)?;
        let reader = EnginePool::new(EngineRole::Reader, config.reader.clone(), reader_driver)?;
        Self::new(writer, reader)
    }

    pub fn pool(&self, role: EngineRole) -> &Arc<EnginePool> {
        match role {
            EngineRole::Writer => &self.writer,
            EngineRole::Reader => &self.reader,
        }
    }

    pub fn writer(&self) -> &Arc<EnginePool> {
        &self.writer
    }

    pub fn reader(&self) -> &Arc<EnginePool> {
        &self.reader
    }

    pub async fn acquire_connection(&self, role: EngineRole) -> Result<PooledConnection> {
        self.pool(role).acquire().await
    }

    /// Close idle connections in both pools. Both are attempted; the first
    /// error is returned.
    pub async fn dispose(&self) -> Result<()> {
        let writer = self.writer.dispose().await;
        let reader = self.reader.dispose().await;
        writer.and(reader)
    }

    pub fn stats(&self) -> [PoolStats; 2] {
        [self.writer.stats(), self.reader.stats()]
    }
}

impl fmt::Debug for Engines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engines")
            .field("writer", &self.writer.config().endpoint.address())
            .field("reader", &self.reader.config().endpoint.address())
            .finish()
    }
}
