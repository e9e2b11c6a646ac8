//! Strata Common - Shared types and utilities
//!
//! This crate provides the key / field-group model and its merge algebra,
//! the binary codec, error definitions, configuration and the injected clock
//! used by every Strata store.

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use codec::{Codec, Scratch, ScratchPool};
pub use config::{
    CacheConfig, EngineConfig, FillConfig, MemoryConfig, NativeConfig, PoolConfig, RedbConfig,
    StoreConfig,
};
pub use error::{Error, Result};
pub use types::*;
