#![allow(dead_code)]

use routedb::{
    DatabaseConfig, EngineConfig, Endpoint, Engines, MemoryDriver, SessionOptions, SessionRegistry,
};
use std::sync::Arc;
use std::time::Duration;

/// Writer and reader backed by separate in-memory drivers, so every test can
/// see which pool a statement reached.
pub struct Harness {
    pub primary: MemoryDriver,
    pub replica: MemoryDriver,
    pub engines: Arc<Engines>,
    pub registry: Arc<SessionRegistry>,
}

pub fn engine_config() -> EngineConfig {
    EngineConfig::new(Endpoint::new("localhost", "app"))
        .pool_size(2)
        .max_overflow(1)
        .pool_timeout(Duration::from_millis(200))
}

pub fn harness() -> Harness {
    harness_with(engine_config(), SessionOptions::default())
}

pub fn harness_with(config: EngineConfig, options: SessionOptions) -> Harness {
    let primary = MemoryDriver::new("primary");
    let replica = MemoryDriver::new("replica");
    let engines = Arc::new(
        Engines::with_drivers(
            &DatabaseConfig::single(config),
            Arc::new(primary.clone()),
            Arc::new(replica.clone()),
        )
        .unwrap(),
    );
    let registry = Arc::new(SessionRegistry::with_options(Arc::clone(&engines), options));

    Harness {
        primary,
        replica,
        engines,
        registry,
    }
}

/// Let deferred checkins from dropped connections finish.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
