pub mod memory;
pub mod postgres;

use crate::connection::config::Endpoint;
use crate::core::Result;
use crate::result::QueryResult;
use crate::session::Operation;
use async_trait::async_trait;

pub use memory::MemoryDriver;
pub use postgres::PostgresDriver;

/// Opens physical connections to a database endpoint.
///
/// Pools own a driver and call `connect` whenever they need a fresh
/// connection. Implement this to plug in another database.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn DriverConnection>>;
}

/// One physical connection.
#[async_trait]
pub trait DriverConnection: Send {
    async fn execute(&mut self, operation: &Operation) -> Result<QueryResult>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Cheap liveness check run before a pooled connection is reused.
    async fn ping(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    fn is_in_transaction(&self) -> bool;
}
