//! In-house storage engine
//!
//! Log-structured engine for encoded records:
//! - **WAL**: append-only log for durability and crash recovery
//! - **Index**: in-memory ordered map with periodic snapshots
//! - **Background compaction**: folds the WAL into snapshots
//!
//! # Write Path
//! 1. Append one batch record to the WAL (fsync if configured)
//! 2. Apply the batch to the index
//!
//! # Recovery
//! 1. Load latest snapshot into the index
//! 2. Replay WAL records after the snapshot LSN
//!
//! # Compaction
//! A snapshot drops expired records, then the WAL is truncated to the
//! records the snapshot does not cover.

mod index;
mod types;
mod wal;

pub use index::{Index, IndexConfig};
pub use types::{SnapshotHeader, WalOp};
pub use wal::{Wal, WalConfig};

use bytes::Bytes;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use strata_common::{Error, NativeConfig, Result, SharedClock};
use tracing::{debug, error, info, warn};

const WAL_FILE: &str = "strata.wal";
const SNAPSHOT_DIR: &str = "snapshots";

fn wal_config(config: &NativeConfig) -> WalConfig {
    WalConfig {
        sync_on_write: config.sync_on_write,
        max_size_bytes: config.wal_max_size_bytes,
        write_buffer_size: config.write_buffer_size,
    }
}

fn index_config(config: &NativeConfig) -> IndexConfig {
    IndexConfig {
        snapshot_dir: config.data_dir.join(SNAPSHOT_DIR),
        snapshot_threshold: config.snapshot_threshold,
        snapshot_retention: config.snapshot_retention,
    }
}

/// Snapshot the index and truncate the WAL behind it
fn spawn_failed(e: std::io::Error) -> Error {
    Error::storage(format!("failed to start compaction thread: {e}"))
}

fn compact(wal: &Wal, index: &Index, now: i64) -> Result<PathBuf> {
    let path = index.write_snapshot(now)?;
    let snapshot_lsn = index.last_snapshot_lsn();
    info!("Wrote snapshot at LSN {}", snapshot_lsn);

    if snapshot_lsn > 0 {
        if let Err(e) = wal.truncate_before(snapshot_lsn + 1) {
            warn!("Failed to truncate WAL: {}", e);
        }
    }
    Ok(path)
}

/// WAL + index engine
pub struct Engine {
    wal: Arc<Wal>,
    index: Arc<Index>,
    config: NativeConfig,
    clock: SharedClock,
    /// Serializes snapshots
    compaction_lock: Arc<Mutex<()>>,
    /// Shutdown flag for the background thread
    shutdown: Arc<AtomicBool>,
    compaction_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Engine {
    /// Create a new, empty engine
    pub fn create(config: NativeConfig, clock: SharedClock) -> Result<Self> {
        let index_config = index_config(&config);
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| Error::Storage(format!("failed to create data dir: {}", e)))?;
        std::fs::create_dir_all(&index_config.snapshot_dir)
            .map_err(|e| Error::Storage(format!("failed to create snapshot dir: {}", e)))?;

        let wal = Wal::create(config.data_dir.join(WAL_FILE), wal_config(&config))?;
        let index = Index::new(index_config);

        let engine = Self::assemble(wal, index, config, clock)?;
        info!("Created new engine at {:?}", engine.config.data_dir);
        Ok(engine)
    }

    /// Open an existing engine: load the latest snapshot, replay the WAL
    pub fn open(config: NativeConfig, clock: SharedClock) -> Result<Self> {
        let wal = Wal::open(config.data_dir.join(WAL_FILE), wal_config(&config))?;
        let index = Index::load_snapshot(index_config(&config))?;
        let snapshot_lsn = index.last_snapshot_lsn();
        wal.advance_to(snapshot_lsn);

        info!("Replaying WAL from LSN {}", snapshot_lsn + 1);
        let mut replayed = 0u64;
        wal.replay(snapshot_lsn + 1, |lsn, op| {
            index.apply(op, lsn);
            replayed += 1;
            Ok(())
        })?;
        info!("Replayed {} WAL records", replayed);

        let engine = Self::assemble(wal, index, config, clock)?;
        info!(
            "Opened engine at {:?} ({} entries)",
            engine.config.data_dir,
            engine.index.len()
        );
        Ok(engine)
    }

    /// Open the engine if its files exist, otherwise create it
    pub fn open_or_create(config: NativeConfig, clock: SharedClock) -> Result<Self> {
        if config.data_dir.join(WAL_FILE).exists() || config.data_dir.join(SNAPSHOT_DIR).exists() {
            Self::open(config, clock)
        } else {
            Self::create(config, clock)
        }
    }

    fn assemble(wal: Wal, index: Index, config: NativeConfig, clock: SharedClock) -> Result<Self> {
        let engine = Self {
            wal: Arc::new(wal),
            index: Arc::new(index),
            config,
            clock,
            compaction_lock: Arc::new(Mutex::new(())),
            shutdown: Arc::new(AtomicBool::new(false)),
            compaction_handle: Mutex::new(None),
        };
        if engine.config.background_compaction {
            engine.start_compaction()?;
        }
        Ok(engine)
    }

    /// Get an encoded value by encoded key
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.index.get(key)
    }

    /// Log and apply a batch atomically, returning its LSN
    pub fn apply(&self, ops: Vec<WalOp>) -> Result<u64> {
        if ops.is_empty() {
            return Ok(self.wal.current_lsn());
        }
        let op = WalOp::Batch { ops };
        let lsn = self.wal.append(&op)?;
        let count = op.len();
        self.index.apply(op, lsn);
        debug!("apply: {} ops, lsn={}", count, lsn);
        Ok(lsn)
    }

    /// Records written after `since` that are still alive
    pub fn entries_since(&self, since: u64) -> Vec<(Bytes, Bytes)> {
        self.index.entries_since(since, self.clock.now())
    }

    /// Force a snapshot to disk
    pub fn snapshot(&self) -> Result<PathBuf> {
        let _lock = self.compaction_lock.lock();
        compact(&self.wal, &self.index, self.clock.now())
    }

    /// Check if compaction is needed
    pub fn needs_compaction(&self) -> bool {
        self.index.needs_snapshot() || self.wal.needs_compaction()
    }

    /// Start the background compaction thread; no-op if already running
    pub fn start_compaction(&self) -> Result<()> {
        let mut slot = self.compaction_handle.lock();
        if slot.is_some() {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::Release);

        let wal = Arc::clone(&self.wal);
        let index = Arc::clone(&self.index);
        let clock = Arc::clone(&self.clock);
        let lock = Arc::clone(&self.compaction_lock);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = Duration::from_millis(self.config.compaction_interval_ms.max(1));

        let spawned = thread::Builder::new()
            .name("strata-compaction".to_string())
            .spawn(move || {
                info!("Background compaction thread started");
                while !shutdown.load(Ordering::Acquire) {
                    thread::park_timeout(interval);
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    if index.needs_snapshot() || wal.needs_compaction() {
                        debug!("Starting background compaction");
                        let _guard = lock.lock();
                        match compact(&wal, &index, clock.now()) {
                            Ok(path) => info!("Background snapshot completed: {:?}", path),
                            Err(e) => error!("Background snapshot failed: {}", e),
                        }
                    }
                }
                info!("Background compaction thread stopped");
            });

        *slot = Some(spawned.map_err(spawn_failed)?);
        Ok(())
    }

    /// Stop the background compaction thread and wait for it
    pub fn stop_compaction(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.compaction_handle.lock().take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }

    /// Check if the background compaction thread is running
    pub fn compaction_running(&self) -> bool {
        self.compaction_handle.lock().is_some()
    }

    /// Stop background work and sync the WAL
    pub fn shutdown(&self) {
        self.stop_compaction();
        if let Err(e) = self.wal.sync() {
            error!("Failed to sync WAL on shutdown: {}", e);
        }
    }

    /// Drop all records and remove files from disk
    pub fn destroy(&self) -> Result<()> {
        self.stop_compaction();
        self.index.clear();
        std::fs::remove_dir_all(&self.config.data_dir)
            .map_err(|e| Error::Storage(format!("failed to remove data dir: {}", e)))
    }

    /// Sync WAL to disk
    pub fn sync(&self) -> Result<()> {
        self.wal.sync()
    }

    /// Last assigned LSN
    pub fn current_lsn(&self) -> u64 {
        self.wal.current_lsn()
    }

    /// Data directory
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Get statistics
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            entry_count: self.index.len(),
            raw_bytes: self.index.raw_bytes(),
            wal_size: self.wal.size(),
            wal_lsn: self.wal.current_lsn(),
            index_lsn: self.index.current_lsn(),
            last_snapshot_lsn: self.index.last_snapshot_lsn(),
            compaction_running: self.compaction_running(),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_compaction();
    }
}

/// Engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Number of records in the index
    pub entry_count: u64,
    /// Sum of key and value sizes
    pub raw_bytes: u64,
    /// WAL size in bytes
    pub wal_size: u64,
    /// Current WAL LSN
    pub wal_lsn: u64,
    /// Current index LSN
    pub index_lsn: u64,
    /// Last snapshot LSN
    pub last_snapshot_lsn: u64,
    /// Background compaction state
    pub compaction_running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::ManualClock;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> NativeConfig {
        NativeConfig {
            data_dir: dir.to_path_buf(),
            sync_on_write: false, // Faster tests
            wal_max_size_bytes: 1024 * 1024,
            write_buffer_size: 4096,
            snapshot_threshold: 100,
            snapshot_retention: 2,
            background_compaction: false, // Manual for tests
            compaction_interval_ms: 10,
        }
    }

    fn clock(now: i64) -> SharedClock {
        Arc::new(ManualClock::new(now))
    }

    fn put(i: u64) -> WalOp {
        WalOp::Put {
            key: format!("key_{i}").into_bytes(),
            value: format!("value_{i}").into_bytes(),
            expiry: 0,
        }
    }

    #[test]
    fn test_engine_apply_and_get() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(test_config(dir.path()), clock(0)).unwrap();

        let lsn = engine.apply(vec![put(1), put(2)]).unwrap();
        assert_eq!(lsn, 1);
        assert_eq!(engine.get(b"key_2").unwrap().as_ref(), b"value_2");

        engine
            .apply(vec![WalOp::Delete {
                key: b"key_1".to_vec(),
            }])
            .unwrap();
        assert!(engine.get(b"key_1").is_none());
        assert_eq!(engine.stats().entry_count, 1);
    }

    #[test]
    fn test_engine_recovery() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());

        {
            let engine = Engine::create(config.clone(), clock(0)).unwrap();
            for i in 1..=50 {
                engine.apply(vec![put(i)]).unwrap();
            }
            engine.sync().unwrap();
        }

        let engine = Engine::open(config, clock(0)).unwrap();
        assert_eq!(engine.stats().entry_count, 50);
        assert_eq!(engine.current_lsn(), 50);
        for i in 1..=50 {
            assert_eq!(
                engine.get(format!("key_{i}").as_bytes()).unwrap(),
                Bytes::from(format!("value_{i}"))
            );
        }
    }

    #[test]
    fn test_engine_snapshot_and_recovery() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());

        {
            let engine = Engine::create(config.clone(), clock(0)).unwrap();
            for i in 1..=100 {
                engine.apply(vec![put(i)]).unwrap();
            }
            engine.snapshot().unwrap();
            for i in 101..=150 {
                engine.apply(vec![put(i)]).unwrap();
            }
            engine.sync().unwrap();
        }

        let engine = Engine::open_or_create(config, clock(0)).unwrap();
        assert_eq!(engine.stats().entry_count, 150);
        assert_eq!(engine.stats().last_snapshot_lsn, 100);
        assert_eq!(engine.get(b"key_50").unwrap().as_ref(), b"value_50");
        assert_eq!(engine.get(b"key_125").unwrap().as_ref(), b"value_125");
        assert_eq!(engine.apply(vec![put(151)]).unwrap(), 151);
    }

    #[test]
    fn test_engine_lsn_survives_empty_wal() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let engine = Engine::create(config.clone(), clock(0)).unwrap();
            for i in 1..=10 {
                engine.apply(vec![put(i)]).unwrap();
            }
            engine.snapshot().unwrap();
            assert_eq!(engine.stats().wal_size, 0);
        }
        let engine = Engine::open(config, clock(0)).unwrap();
        assert_eq!(engine.apply(vec![put(11)]).unwrap(), 11);
    }

    #[test]
    fn test_compaction_spawn_failure_is_storage_error() {
        let err = spawn_failed(std::io::Error::other("no threads"));
        assert!(matches!(err, Error::Storage(ref msg) if msg.contains("no threads")));
    }

    #[test]
    fn test_engine_background_compaction() {
        let dir = tempdir().unwrap();
        let config = NativeConfig {
            snapshot_threshold: 5,
            ..test_config(dir.path())
        };
        let engine = Engine::create(config, clock(0)).unwrap();
        assert!(!engine.compaction_running());
        engine.start_compaction().unwrap();
        engine.start_compaction().unwrap();
        assert!(engine.compaction_running());

        for i in 1..=10 {
            engine.apply(vec![put(i)]).unwrap();
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while engine.stats().last_snapshot_lsn == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(engine.stats().last_snapshot_lsn > 0);

        engine.stop_compaction();
        assert!(!engine.compaction_running());
    }

    #[test]
    fn test_engine_destroy() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("db");
        let engine = Engine::create(test_config(&data_dir), clock(0)).unwrap();
        engine.apply(vec![put(1)]).unwrap();
        engine.destroy().unwrap();
        assert!(!data_dir.exists());
        assert!(engine.get(b"key_1").is_none());
    }
}
