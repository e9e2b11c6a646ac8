//! Configuration types for Strata
//!
//! A [`StoreConfig`] describes one store instance: a durable engine, an
//! optional cache engine layered in front of it, and the tuning of the fill
//! pipeline and worker pool. Configurations are loaded from TOML.

use crate::codec::Codec;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration for one store
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store name, used as the `store` label on exported metrics
    pub name: String,
    /// Binary format for keys and values
    pub codec: Codec,
    /// Durable tier (or the only tier when `cache` is absent)
    pub durable: EngineConfig,
    /// Optional cache tier composed in front of `durable`
    pub cache: Option<EngineConfig>,
    /// Cache fill pipeline tuning
    pub fill: FillConfig,
    /// Worker pool used for batched reads
    pub pool: PoolConfig,
    /// Interval between engine statistics reports (0 disables reporting)
    pub stats_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "strata".to_string(),
            codec: Codec::default(),
            durable: EngineConfig::Memory(MemoryConfig::default()),
            cache: None,
            fill: FillConfig::default(),
            pool: PoolConfig::default(),
            stats_interval_ms: 60_000,
        }
    }
}

impl StoreConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::Configuration(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::configuration("store name must not be empty"));
        }
        self.durable.validate()?;
        if let Some(cache) = &self.cache {
            if matches!(self.durable, EngineConfig::Cache(_)) {
                return Err(Error::configuration(
                    "a cache engine cannot be the durable tier of a layered store",
                ));
            }
            cache.validate()?;
        }
        self.fill.validate()?;
        self.pool.validate()
    }

    /// Check if this configuration composes a cache tier
    #[must_use]
    pub fn is_layered(&self) -> bool {
        self.cache.is_some()
    }
}

/// Engine selection, tagged by `kind` in TOML
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EngineConfig {
    /// In-house WAL + ordered index engine
    Native(NativeConfig),
    /// redb embedded database
    Redb(RedbConfig),
    /// Sharded in-memory maps
    Memory(MemoryConfig),
    /// Bounded adaptive replacement cache
    Cache(CacheConfig),
}

impl EngineConfig {
    /// Short engine name
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Native(_) => "native",
            Self::Redb(_) => "redb",
            Self::Memory(_) => "memory",
            Self::Cache(_) => "cache",
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Native(c) => {
                if c.data_dir.as_os_str().is_empty() {
                    return Err(Error::configuration("native engine needs a data_dir"));
                }
                if c.write_buffer_size == 0 {
                    return Err(Error::configuration("native write_buffer_size must be > 0"));
                }
                Ok(())
            }
            Self::Redb(c) => {
                if c.path.as_os_str().is_empty() {
                    return Err(Error::configuration("redb engine needs a path"));
                }
                Ok(())
            }
            Self::Memory(c) => {
                if c.shards == 0 {
                    return Err(Error::configuration("memory shards must be > 0"));
                }
                Ok(())
            }
            Self::Cache(c) => {
                if c.capacity == 0 {
                    return Err(Error::configuration("cache capacity must be > 0"));
                }
                Ok(())
            }
        }
    }
}

/// In-house engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
    /// Directory holding the WAL and snapshots
    pub data_dir: PathBuf,
    /// fsync after every WAL append
    pub sync_on_write: bool,
    /// WAL size that triggers a snapshot
    pub wal_max_size_bytes: u64,
    /// WAL write buffer size
    pub write_buffer_size: usize,
    /// Mutations between snapshots
    pub snapshot_threshold: u64,
    /// Snapshots kept on disk
    pub snapshot_retention: usize,
    /// Start the background compaction thread on open
    pub background_compaction: bool,
    /// Compaction check interval
    pub compaction_interval_ms: u64,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./strata"),
            sync_on_write: true,
            wal_max_size_bytes: 64 * 1024 * 1024, // 64MB
            write_buffer_size: 64 * 1024,         // 64KB
            snapshot_threshold: 10_000,
            snapshot_retention: 2,
            background_compaction: true,
            compaction_interval_ms: 60_000,
        }
    }
}

impl NativeConfig {
    /// Create config with data directory
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

/// redb engine configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedbConfig {
    /// Database file
    pub path: PathBuf,
}

/// In-memory engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Number of independently locked shards
    pub shards: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { shards: 64 }
    }
}

/// Cache engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached keys
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 100_000 }
    }
}

/// Cache fill pipeline configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FillConfig {
    /// Flush accumulated fill requests at this many keys
    pub batch_size: usize,
    /// Flush accumulated fill requests after this long (0 fills synchronously)
    pub interval_ms: u64,
    /// Queue capacity as a multiple of `batch_size`
    pub queue_factor: usize,
}

impl Default for FillConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            interval_ms: 10,
            queue_factor: 10,
        }
    }
}

impl FillConfig {
    /// Bounded queue capacity
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.batch_size.saturating_mul(self.queue_factor)
    }

    /// Check if fills run inline with the foreground call
    #[must_use]
    pub fn is_synchronous(&self) -> bool {
        self.interval_ms == 0
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::configuration("fill batch_size must be > 0"));
        }
        if self.queue_factor == 0 {
            return Err(Error::configuration("fill queue_factor must be > 0"));
        }
        Ok(())
    }
}

/// Worker pool configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker threads
    pub workers: usize,
    /// Keys per dispatched batch
    pub batch_size: usize,
    /// Keys remembered as absent by disk-backed engines (0 disables)
    pub missing_keys: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(4, |n| n.get()),
            batch_size: 16,
            missing_keys: 10_000,
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::configuration("pool workers must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(Error::configuration("pool batch_size must be > 0"));
        }
        Ok(())
    }
}
