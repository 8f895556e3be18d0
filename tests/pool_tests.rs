/// Engine pool tests
///
/// Tests for checkout limits, overflow, pre-ping, recycling and disposal
/// Run with: cargo test --test pool_tests

mod common;

use common::{engine_config, settle};
use routedb::driver::memory::JournalEvent;
use routedb::{
    DatabaseConfig, DbError, EngineConfig, EnginePool, EngineRole, Engines, MemoryDriver,
    Operation,
};
use std::sync::Arc;
use std::time::Duration;

fn pool(driver: &MemoryDriver, config: EngineConfig) -> Arc<EnginePool> {
    Arc::new(EnginePool::new(EngineRole::Writer, config, Arc::new(driver.clone())).unwrap())
}

#[tokio::test]
async fn test_exhaustion_fails_after_timeout() {
    let driver = MemoryDriver::new("primary");
    let pool = pool(
        &driver,
        engine_config()
            .pool_size(1)
            .max_overflow(0)
            .pool_timeout(Duration::from_millis(50)),
    );

    let _held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();

    match err {
        DbError::PoolExhausted { role, waited } => {
            assert_eq!(role, EngineRole::Writer);
            assert_eq!(waited, Duration::from_millis(50));
        }
        other => panic!("expected PoolExhausted, got {:?}", other),
    }
    assert!(pool.acquire().await.unwrap_err().is_transient());
}

#[tokio::test]
async fn test_waiter_receives_released_connection() {
    let driver = MemoryDriver::new("primary");
    let pool = pool(
        &driver,
        engine_config()
            .pool_size(1)
            .max_overflow(0)
            .pool_timeout(Duration::from_secs(1)),
    );

    let held = pool.acquire().await.unwrap();
    let held_id = held.id();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire().await.map(|conn| conn.id()) })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    held.release().await.unwrap();

    assert_eq!(waiter.await.unwrap().unwrap(), held_id);
    assert_eq!(driver.connections_opened(), 1);
}

#[tokio::test]
async fn test_overflow_connections_closed_on_checkin() {
    let driver = MemoryDriver::new("primary");
    let pool = pool(&driver, engine_config().pool_size(1).max_overflow(1));

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    assert_eq!(pool.stats().open_connections, 2);

    first.release().await.unwrap();
    second.release().await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.idle_connections, 1);
    assert_eq!(stats.open_connections, 1);
    assert_eq!(driver.count(&JournalEvent::Close), 1);
    assert_eq!(driver.open_connections(), 1);
}

#[tokio::test]
async fn test_failed_pre_ping_is_replaced_transparently() {
    let driver = MemoryDriver::new("primary");
    let pool = pool(&driver, engine_config());

    let conn = pool.acquire().await.unwrap();
    let stale_id = conn.id();
    conn.release().await.unwrap();

    driver.fail_pings(1);
    let mut conn = pool.acquire().await.unwrap();

    assert_ne!(conn.id(), stale_id);
    conn.execute(&Operation::new("SELECT 1")).await.unwrap();
    assert_eq!(driver.connections_opened(), 2);
    assert_eq!(driver.open_connections(), 1);
}

#[tokio::test]
async fn test_pre_ping_can_be_disabled() {
    let driver = MemoryDriver::new("primary");
    let pool = pool(&driver, engine_config().pre_ping(false));

    pool.acquire().await.unwrap().release().await.unwrap();
    pool.acquire().await.unwrap().release().await.unwrap();

    assert_eq!(driver.count(&JournalEvent::Ping), 0);
    assert_eq!(driver.connections_opened(), 1);
}

#[tokio::test]
async fn test_expired_connection_is_recycled() {
    let driver = MemoryDriver::new("primary");
    let pool = pool(
        &driver,
        engine_config().recycle(Some(Duration::from_millis(20))),
    );

    pool.acquire().await.unwrap().release().await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    pool.acquire().await.unwrap().release().await.unwrap();

    assert_eq!(driver.connections_opened(), 2);
    assert_eq!(driver.count(&JournalEvent::Close), 1);
}

#[tokio::test]
async fn test_dispose_closes_idle_and_returning_connections() {
    let driver = MemoryDriver::new("primary");
    let pool = pool(&driver, engine_config());

    let idle = pool.acquire().await.unwrap();
    let busy = pool.acquire().await.unwrap();
    idle.release().await.unwrap();

    pool.dispose().await.unwrap();
    assert_eq!(driver.open_connections(), 1);

    busy.release().await.unwrap();
    assert_eq!(driver.open_connections(), 0);
    assert_eq!(pool.stats().open_connections, 0);

    // The pool still works after disposal.
    pool.acquire().await.unwrap().release().await.unwrap();
    assert_eq!(driver.connections_opened(), 3);
}

#[tokio::test]
async fn test_dropped_connection_is_rolled_back_before_reuse() {
    let driver = MemoryDriver::new("primary");
    let pool = pool(&driver, engine_config());

    let mut conn = pool.acquire().await.unwrap();
    conn.begin().await.unwrap();
    conn.execute(&Operation::new("INSERT INTO t VALUES (1)"))
        .await
        .unwrap();
    drop(conn);
    settle().await;

    assert_eq!(driver.rollbacks(), 1);
    assert!(driver.committed().is_empty());
    assert_eq!(pool.stats().idle_connections, 1);

    let conn = pool.acquire().await.unwrap();
    assert!(!conn.is_in_transaction());
}

#[tokio::test]
async fn test_connect_failure_surfaces_and_frees_capacity() {
    let driver = MemoryDriver::new("primary");
    let pool = pool(&driver, engine_config().pool_size(1).max_overflow(0));

    driver.refuse_connections(true);
    assert!(matches!(
        pool.acquire().await,
        Err(DbError::DriverError(_))
    ));

    driver.refuse_connections(false);
    let conn = pool.acquire().await.unwrap();
    assert_eq!(pool.stats().checked_out, 1);
    conn.release().await.unwrap();
}

#[tokio::test]
async fn test_engines_dispose_both_pools() {
    let primary = MemoryDriver::new("primary");
    let replica = MemoryDriver::new("replica");
    let engines = Engines::with_drivers(
        &DatabaseConfig::single(engine_config()),
        Arc::new(primary.clone()),
        Arc::new(replica.clone()),
    )
    .unwrap();

    for role in [EngineRole::Writer, EngineRole::Reader] {
        engines
            .acquire_connection(role)
            .await
            .unwrap()
            .release()
            .await
            .unwrap();
    }
    engines.dispose().await.unwrap();

    assert_eq!(primary.open_connections(), 0);
    assert_eq!(replica.open_connections(), 0);
    let [writer, reader] = engines.stats();
    assert_eq!(writer.idle_connections, 0);
    assert_eq!(reader.idle_connections, 0);
}
