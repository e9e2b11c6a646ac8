//! Write-ahead log
//!
//! Append-only log of [`WalOp`]s with:
//! - Sequential LSN assignment
//! - CRC32C checksums per record
//! - Replay from any LSN
//! - Truncation after snapshot, preserving LSNs
//!
//! Record format:
//! ```text
//! +--------+------+--------+------+--------+
//! | Magic  | LSN  | Length | Data | CRC32C |
//! | 4B     | 8B   | 4B     | var  | 4B     |
//! +--------+------+--------+------+--------+
//! ```
//!
//! A torn or corrupt tail is cut off when the log is opened.

use super::types::WalOp;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::{Error, Result};
use tracing::{debug, warn};

/// WAL record magic number
const WAL_MAGIC: u32 = 0x5357_414C; // "SWAL"

/// Record header size (magic + lsn + length)
const RECORD_HEADER_SIZE: usize = 16;

/// WAL configuration
#[derive(Clone, Debug)]
pub struct WalConfig {
    /// Sync after every write
    pub sync_on_write: bool,
    /// Maximum WAL size before triggering snapshot
    pub max_size_bytes: u64,
    /// Buffer size for writes
    pub write_buffer_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            max_size_bytes: 64 * 1024 * 1024,
            write_buffer_size: 64 * 1024,
        }
    }
}

/// A single WAL record
#[derive(Debug, PartialEq, Eq)]
pub struct WalRecord {
    /// Log Sequence Number
    pub lsn: u64,
    /// Serialized operation
    pub data: Vec<u8>,
}

impl WalRecord {
    /// Serialize record to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let len = u32::try_from(self.data.len())
            .map_err(|_| Error::storage(format!("WAL record too large: {} bytes", self.data.len())))?;
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + self.data.len() + 4);

        buf.extend_from_slice(&WAL_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&self.data);

        // CRC over everything except the CRC itself
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        Ok(buf)
    }

    /// Parse one record from the front of `data`
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < RECORD_HEADER_SIZE + 4 {
            return Err(Error::storage("WAL record too small"));
        }

        let magic = le_u32(&data[0..4]);
        if magic != WAL_MAGIC {
            return Err(Error::storage("invalid WAL magic"));
        }

        let lsn = le_u64(&data[4..12]);
        let data_len = le_u32(&data[12..16]) as usize;

        let total_size = RECORD_HEADER_SIZE + data_len + 4;
        if data.len() < total_size {
            return Err(Error::storage("WAL record truncated"));
        }

        let stored_crc = le_u32(&data[RECORD_HEADER_SIZE + data_len..total_size]);
        let computed_crc = crc32c::crc32c(&data[..RECORD_HEADER_SIZE + data_len]);
        if computed_crc != stored_crc {
            return Err(Error::storage("WAL record CRC mismatch"));
        }

        let record_data = data[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + data_len].to_vec();
        Ok((
            Self {
                lsn,
                data: record_data,
            },
            total_size,
        ))
    }
}

fn le_u32(b: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&b[..4]);
    u32::from_le_bytes(arr)
}

fn le_u64(b: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&b[..8]);
    u64::from_le_bytes(arr)
}

/// Read every intact record; returns the records and the length they cover
fn read_records(path: &Path) -> Result<(Vec<WalRecord>, u64)> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(Error::Storage(format!("failed to read WAL: {}", e))),
    };

    let mut records = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        match WalRecord::from_bytes(&data[offset..]) {
            Ok((record, size)) => {
                records.push(record);
                offset += size;
            }
            Err(e) => {
                warn!(
                    "Ignoring WAL tail at offset {} of {:?}: {}",
                    offset, path, e
                );
                break;
            }
        }
    }
    Ok((records, offset as u64))
}

/// Write-ahead log
pub struct Wal {
    /// WAL file path
    path: PathBuf,
    /// File handle for writing
    writer: Mutex<BufWriter<File>>,
    /// Current file size
    size: AtomicU64,
    /// Next LSN to assign
    next_lsn: AtomicU64,
    /// Configuration
    config: WalConfig,
}

impl Wal {
    /// Create a new, empty WAL file
    pub fn create(path: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to create WAL: {}", e)))?;

        let writer = BufWriter::with_capacity(config.write_buffer_size, file);

        Ok(Self {
            path,
            writer: Mutex::new(writer),
            size: AtomicU64::new(0),
            next_lsn: AtomicU64::new(1),
            config,
        })
    }

    /// Open an existing WAL file, cutting off a torn tail
    pub fn open(path: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (records, valid_len) = read_records(&path)?;
        let last_lsn = records.last().map_or(0, |r| r.lsn);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to open WAL: {}", e)))?;

        let file_len = file
            .metadata()
            .map_err(|e| Error::Storage(format!("failed to stat WAL: {}", e)))?
            .len();
        if file_len > valid_len {
            warn!(
                "Truncating WAL {:?} from {} to {} bytes",
                path, file_len, valid_len
            );
            file.set_len(valid_len)
                .map_err(|e| Error::Storage(format!("failed to truncate WAL: {}", e)))?;
        }

        let writer = BufWriter::with_capacity(config.write_buffer_size, file);

        Ok(Self {
            path,
            writer: Mutex::new(writer),
            size: AtomicU64::new(valid_len),
            next_lsn: AtomicU64::new(last_lsn + 1),
            config,
        })
    }

    /// Append an operation, returning its LSN
    pub fn append(&self, op: &WalOp) -> Result<u64> {
        let data = op.to_bytes()?;

        // LSNs are assigned under the writer lock so the file stays ordered
        let mut writer = self.writer.lock();
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let bytes = WalRecord { lsn, data }.to_bytes()?;

        writer
            .write_all(&bytes)
            .map_err(|e| Error::Storage(format!("WAL write failed: {}", e)))?;

        if self.config.sync_on_write {
            writer
                .flush()
                .map_err(|e| Error::Storage(format!("WAL flush failed: {}", e)))?;
            writer
                .get_ref()
                .sync_data()
                .map_err(|e| Error::Storage(format!("WAL sync failed: {}", e)))?;
        }

        self.size.fetch_add(bytes.len() as u64, Ordering::Relaxed);

        Ok(lsn)
    }

    /// Append a batch of operations atomically under one LSN
    pub fn append_batch(&self, ops: Vec<WalOp>) -> Result<u64> {
        if ops.is_empty() {
            return Ok(self.current_lsn());
        }
        self.append(&WalOp::Batch { ops })
    }

    /// Make sure future LSNs are greater than `lsn`
    pub fn advance_to(&self, lsn: u64) {
        let _ = self
            .next_lsn
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                (next <= lsn).then_some(lsn + 1)
            });
    }

    /// Sync WAL to disk
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer
            .flush()
            .map_err(|e| Error::Storage(format!("WAL flush failed: {}", e)))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| Error::Storage(format!("WAL sync failed: {}", e)))
    }

    /// Replay operations with LSN >= `from_lsn`, returning the last LSN seen
    pub fn replay<F>(&self, from_lsn: u64, mut callback: F) -> Result<u64>
    where
        F: FnMut(u64, WalOp) -> Result<()>,
    {
        self.writer
            .lock()
            .flush()
            .map_err(|e| Error::Storage(format!("WAL flush failed: {}", e)))?;

        let (records, _) = read_records(&self.path)?;
        let mut last_lsn = from_lsn.saturating_sub(1);
        for record in records {
            if record.lsn >= from_lsn {
                callback(record.lsn, WalOp::from_bytes(&record.data)?)?;
            }
            last_lsn = record.lsn;
        }
        Ok(last_lsn)
    }

    /// Drop records with LSN below `snapshot_lsn`
    ///
    /// Surviving records keep their LSNs. Appends wait for the rewrite.
    pub fn truncate_before(&self, snapshot_lsn: u64) -> Result<()> {
        let mut writer = self.writer.lock();
        writer
            .flush()
            .map_err(|e| Error::Storage(format!("WAL flush failed: {}", e)))?;

        let (records, _) = read_records(&self.path)?;
        let new_path = self.path.with_extension("wal.new");
        let mut kept = 0usize;
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&new_path)
                .map_err(|e| Error::Storage(format!("failed to create WAL: {}", e)))?;
            let mut out = BufWriter::with_capacity(self.config.write_buffer_size, file);
            for record in records.iter().filter(|r| r.lsn >= snapshot_lsn) {
                out.write_all(&record.to_bytes()?)
                    .map_err(|e| Error::Storage(format!("WAL write failed: {}", e)))?;
                kept += 1;
            }
            out.flush()
                .map_err(|e| Error::Storage(format!("WAL flush failed: {}", e)))?;
            out.get_ref()
                .sync_all()
                .map_err(|e| Error::Storage(format!("WAL sync failed: {}", e)))?;
        }

        // Atomic rename
        std::fs::rename(&new_path, &self.path)
            .map_err(|e| Error::Storage(format!("WAL rename failed: {}", e)))?;

        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::Storage(format!("failed to reopen WAL: {}", e)))?;
        let new_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        *writer = BufWriter::with_capacity(self.config.write_buffer_size, file);
        self.size.store(new_size, Ordering::Relaxed);

        debug!(
            "Truncated WAL before LSN {}: kept {} of {} records",
            snapshot_lsn,
            kept,
            records.len()
        );
        Ok(())
    }

    /// Get current LSN (last assigned)
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Get current WAL size in bytes
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Check if WAL needs compaction
    pub fn needs_compaction(&self) -> bool {
        self.size() > self.config.max_size_bytes
    }
}
