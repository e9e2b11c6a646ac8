//! Strata Storage - Field-group stores
//!
//! This crate implements the storage engines behind the [`Store`] trait:
//! - In-house engine (write-ahead log + in-memory index + snapshots)
//! - redb-backed engine
//! - Sharded in-memory engine
//! - Bounded ARC cache engine
//! - Layered cache-over-durable composition with asynchronous cache fill
//!
//! Batched reads fan out over a bounded worker pool; backups share one
//! stream format across engines.

pub mod backend;
pub mod backup;
pub mod engine;
pub mod factory;
pub mod layered;
pub mod parallel;
pub mod reporter;
pub mod store;

#[cfg(test)]
mod conformance;

// Re-exports
pub use backend::StoreOptions;
pub use backend::cache::CacheStore;
pub use backend::memory::MemoryStore;
pub use backend::native::NativeStore;
pub use backend::redb::RedbStore;
pub use backup::{BackupHeader, BackupReader, BackupWriter};
pub use engine::{Engine, EngineStats};
pub use factory::open_store;
pub use layered::LayeredStore;
pub use parallel::WorkerPool;
pub use reporter::StatsReporter;
pub use store::{Store, StoreStats, teardown_allowed};
