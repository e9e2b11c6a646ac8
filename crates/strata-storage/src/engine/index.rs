//! In-memory ordered index with snapshot persistence
//!
//! A `BTreeMap` over encoded keys, with:
//! - Per-record LSN (drives incremental backup)
//! - Per-record expiry (expired records are dropped when a snapshot is taken)
//! - Checksummed snapshots written atomically, with retention

use super::types::{SnapshotHeader, WalOp};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::{Error, Liveness, Result};
use tracing::debug;

/// Index configuration
#[derive(Clone, Debug)]
pub struct IndexConfig {
    /// Snapshot directory
    pub snapshot_dir: PathBuf,
    /// Minimum mutations between snapshots
    pub snapshot_threshold: u64,
    /// Keep this many snapshots
    pub snapshot_retention: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from("."),
            snapshot_threshold: 10000,
            snapshot_retention: 2,
        }
    }
}

/// Value stored in the index
#[derive(Clone, Debug)]
struct StoredValue {
    data: Bytes,
    lsn: u64,
    expiry: i64,
}

/// Snapshot body: (key, value, lsn, expiry)
type SnapshotEntries = Vec<(Vec<u8>, Vec<u8>, u64, i64)>;

/// In-memory ordered index
pub struct Index {
    tree: RwLock<BTreeMap<Bytes, StoredValue>>,
    /// Highest applied LSN
    lsn: AtomicU64,
    /// Sum of key and value sizes
    raw_bytes: AtomicU64,
    mutations_since_snapshot: AtomicU64,
    last_snapshot_lsn: AtomicU64,
    config: IndexConfig,
}

impl Index {
    /// Create a new empty index
    pub fn new(config: IndexConfig) -> Self {
        Self {
            tree: RwLock::new(BTreeMap::new()),
            lsn: AtomicU64::new(0),
            raw_bytes: AtomicU64::new(0),
            mutations_since_snapshot: AtomicU64::new(0),
            last_snapshot_lsn: AtomicU64::new(0),
            config,
        }
    }

    /// Load the index from the latest snapshot, or start empty
    pub fn load_snapshot(config: IndexConfig) -> Result<Self> {
        let Some(path) = latest_snapshot(&config.snapshot_dir)? else {
            return Ok(Self::new(config));
        };

        let (tree, header) = read_snapshot(&path)?;
        let raw_bytes = tree
            .iter()
            .map(|(k, v)| (k.len() + v.data.len()) as u64)
            .sum();
        debug!(
            "Loaded snapshot {:?} with {} entries at LSN {}",
            path, header.entry_count, header.lsn
        );
        Ok(Self {
            tree: RwLock::new(tree),
            lsn: AtomicU64::new(header.lsn),
            raw_bytes: AtomicU64::new(raw_bytes),
            mutations_since_snapshot: AtomicU64::new(0),
            last_snapshot_lsn: AtomicU64::new(header.lsn),
            config,
        })
    }

    /// Get a value by encoded key
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.tree.read().get(key).map(|v| v.data.clone())
    }

    /// Apply a logged operation
    pub fn apply(&self, op: WalOp, lsn: u64) {
        let mut tree = self.tree.write();
        self.apply_locked(&mut tree, op, lsn);
        self.update_lsn(lsn);
    }

    fn apply_locked(&self, tree: &mut BTreeMap<Bytes, StoredValue>, op: WalOp, lsn: u64) {
        match op {
            WalOp::Put { key, value, expiry } => {
                let key_len = key.len() as u64;
                let value_len = value.len() as u64;
                let value = StoredValue {
                    data: value.into(),
                    lsn,
                    expiry,
                };
                match tree.insert(key.into(), value) {
                    Some(old) => {
                        self.raw_bytes
                            .fetch_sub(old.data.len() as u64, Ordering::Relaxed);
                        self.raw_bytes.fetch_add(value_len, Ordering::Relaxed);
                    }
                    None => {
                        self.raw_bytes
                            .fetch_add(key_len + value_len, Ordering::Relaxed);
                    }
                }
                self.mutations_since_snapshot.fetch_add(1, Ordering::Relaxed);
            }
            WalOp::Delete { key } => {
                if let Some(old) = tree.remove(key.as_slice()) {
                    self.raw_bytes
                        .fetch_sub((key.len() + old.data.len()) as u64, Ordering::Relaxed);
                }
                self.mutations_since_snapshot.fetch_add(1, Ordering::Relaxed);
            }
            WalOp::Batch { ops } => {
                for op in ops {
                    self.apply_locked(tree, op, lsn);
                }
            }
        }
    }

    /// Records written after `since`, as (encoded key, encoded value)
    pub fn entries_since(&self, since: u64, now: i64) -> Vec<(Bytes, Bytes)> {
        self.tree
            .read()
            .iter()
            .filter(|(_, v)| v.lsn > since && Liveness::of(v.expiry, now).is_alive())
            .map(|(k, v)| (k.clone(), v.data.clone()))
            .collect()
    }

    /// Drop every record
    pub fn clear(&self) {
        self.tree.write().clear();
        self.raw_bytes.store(0, Ordering::Relaxed);
    }

    /// Write a snapshot, dropping records expired at `now`
    pub fn write_snapshot(&self, now: i64) -> Result<PathBuf> {
        let (lsn, entries, expired) = {
            let mut tree = self.tree.write();
            let expired: Vec<Bytes> = tree
                .iter()
                .filter(|(_, v)| !Liveness::of(v.expiry, now).is_alive())
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired {
                if let Some(old) = tree.remove(key) {
                    self.raw_bytes
                        .fetch_sub((key.len() + old.data.len()) as u64, Ordering::Relaxed);
                }
            }
            let entries: SnapshotEntries = tree
                .iter()
                .map(|(k, v)| (k.to_vec(), v.data.to_vec(), v.lsn, v.expiry))
                .collect();
            (self.lsn.load(Ordering::SeqCst), entries, expired.len())
        };

        let entry_count = entries.len() as u64;
        let data = bincode::serialize(&entries)
            .map_err(|e| Error::Storage(format!("failed to serialize snapshot: {}", e)))?;
        let header = SnapshotHeader::new(lsn, entry_count, crc32c::crc32c(&data));

        std::fs::create_dir_all(&self.config.snapshot_dir)
            .map_err(|e| Error::Storage(format!("failed to create snapshot dir: {}", e)))?;

        // Write to temporary file first
        let snapshot_name = format!("strata_{}.snapshot", lsn);
        let snapshot_path = self.config.snapshot_dir.join(&snapshot_name);
        let temp_path = self
            .config
            .snapshot_dir
            .join(format!("{}.tmp", snapshot_name));

        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(|e| Error::Storage(format!("failed to create snapshot file: {}", e)))?;

            let mut writer = BufWriter::new(file);
            writer
                .write_all(&header.to_bytes())
                .map_err(|e| Error::Storage(format!("failed to write snapshot header: {}", e)))?;
            writer
                .write_all(&data)
                .map_err(|e| Error::Storage(format!("failed to write snapshot data: {}", e)))?;
            writer
                .flush()
                .map_err(|e| Error::Storage(format!("failed to flush snapshot: {}", e)))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| Error::Storage(format!("failed to sync snapshot: {}", e)))?;
        }

        std::fs::rename(&temp_path, &snapshot_path)
            .map_err(|e| Error::Storage(format!("failed to rename snapshot: {}", e)))?;

        self.last_snapshot_lsn.store(lsn, Ordering::SeqCst);
        self.mutations_since_snapshot.store(0, Ordering::Relaxed);
        if expired > 0 {
            debug!("Dropped {} expired records at snapshot LSN {}", expired, lsn);
        }

        self.cleanup_old_snapshots()?;
        Ok(snapshot_path)
    }

    fn cleanup_old_snapshots(&self) -> Result<()> {
        let mut snapshots = list_snapshots(&self.config.snapshot_dir)?;
        snapshots.sort_by_key(|(_, lsn)| std::cmp::Reverse(*lsn));
        for (path, _) in snapshots
            .into_iter()
            .skip(self.config.snapshot_retention.max(1))
        {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }

    /// Check if snapshot is needed
    pub fn needs_snapshot(&self) -> bool {
        self.mutations_since_snapshot.load(Ordering::Relaxed) >= self.config.snapshot_threshold
    }

    /// Highest applied LSN
    pub fn current_lsn(&self) -> u64 {
        self.lsn.load(Ordering::SeqCst)
    }

    /// LSN of the last snapshot written or loaded
    pub fn last_snapshot_lsn(&self) -> u64 {
        self.last_snapshot_lsn.load(Ordering::SeqCst)
    }

    /// Number of records
    pub fn len(&self) -> u64 {
        self.tree.read().len() as u64
    }

    /// Sum of key and value sizes
    pub fn raw_bytes(&self) -> u64 {
        self.raw_bytes.load(Ordering::Relaxed)
    }

    fn update_lsn(&self, lsn: u64) {
        let _ = self
            .lsn
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (lsn > current).then_some(lsn)
            });
    }
}

/// Snapshot files in `dir` with their LSNs
fn list_snapshots(dir: &Path) -> Result<Vec<(PathBuf, u64)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    Ok(std::fs::read_dir(dir)
        .map_err(|e| Error::Storage(format!("failed to read snapshot dir: {}", e)))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            // strata_<lsn>.snapshot
            let name = entry.file_name();
            let lsn = name
                .to_string_lossy()
                .strip_prefix("strata_")
                .and_then(|s| s.strip_suffix(".snapshot"))
                .and_then(|s| s.parse::<u64>().ok())?;
            Some((entry.path(), lsn))
        })
        .collect())
}

fn latest_snapshot(dir: &Path) -> Result<Option<PathBuf>> {
    Ok(list_snapshots(dir)?
        .into_iter()
        .max_by_key(|(_, lsn)| *lsn)
        .map(|(path, _)| path))
}

fn read_snapshot(path: &Path) -> Result<(BTreeMap<Bytes, StoredValue>, SnapshotHeader)> {
    let file = File::open(path)
        .map_err(|e| Error::Storage(format!("failed to open snapshot: {}", e)))?;
    let mut reader = BufReader::new(file);

    let mut header_buf = [0u8; SnapshotHeader::SIZE];
    reader
        .read_exact(&mut header_buf)
        .map_err(|e| Error::Storage(format!("failed to read snapshot header: {}", e)))?;
    let header = SnapshotHeader::from_bytes(&header_buf)
        .ok_or_else(|| Error::storage("invalid snapshot header"))?;

    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .map_err(|e| Error::Storage(format!("failed to read snapshot data: {}", e)))?;

    if crc32c::crc32c(&data) != header.checksum {
        return Err(Error::storage("snapshot checksum mismatch"));
    }

    let entries: SnapshotEntries = bincode::deserialize(&data)
        .map_err(|e| Error::Storage(format!("failed to deserialize snapshot: {}", e)))?;

    let tree = entries
        .into_iter()
        .map(|(key, data, lsn, expiry)| {
            (
                Bytes::from(key),
                StoredValue {
                    data: data.into(),
                    lsn,
                    expiry,
                },
            )
        })
        .collect();
    Ok((tree, header))
}
