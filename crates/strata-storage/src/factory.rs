//! Build a store from configuration

use crate::backend::StoreOptions;
use crate::backend::cache::CacheStore;
use crate::backend::memory::MemoryStore;
use crate::backend::native::NativeStore;
use crate::backend::redb::RedbStore;
use crate::layered::LayeredStore;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use strata_common::{EngineConfig, Result, SharedClock, StoreConfig};
use tracing::info;

fn open_engine(engine: &EngineConfig, options: StoreOptions) -> Result<Arc<dyn Store>> {
    Ok(match engine {
        EngineConfig::Native(c) => Arc::new(NativeStore::open(c.clone(), options)?),
        EngineConfig::Redb(c) => Arc::new(RedbStore::open(c.clone(), options)?),
        EngineConfig::Memory(c) => Arc::new(MemoryStore::open(c, options)?),
        EngineConfig::Cache(c) => Arc::new(CacheStore::open(c, options)?),
    })
}

/// Open the store described by `config`
///
/// A configured cache tier is composed in front of the durable tier; the
/// layered store then reports stats for both.
pub fn open_store(config: &StoreConfig, clock: SharedClock) -> Result<Arc<dyn Store>> {
    config.validate()?;
    let stats_interval =
        (config.stats_interval_ms > 0).then(|| Duration::from_millis(config.stats_interval_ms));
    let options = |name: String, stats_interval: Option<Duration>| StoreOptions {
        name,
        codec: config.codec,
        pool: config.pool.clone(),
        stats_interval,
        clock: Arc::clone(&clock),
    };

    let Some(cache) = &config.cache else {
        info!("Opening {} store {}", config.durable.kind(), config.name);
        return open_engine(&config.durable, options(config.name.clone(), stats_interval));
    };

    info!(
        "Opening layered store {} ({} over {})",
        config.name,
        cache.kind(),
        config.durable.kind()
    );
    let durable = open_engine(&config.durable, options(format!("{}-durable", config.name), None))?;
    let cache = open_engine(cache, options(format!("{}-cache", config.name), None))?;
    let layered = LayeredStore::new(&config.name, cache, durable, &config.fill, stats_interval)?;
    Ok(Arc::new(layered))
}
