//! Log and snapshot records for the native engine

use serde::{Deserialize, Serialize};
use strata_common::{Error, Result};

/// Operation recorded in the write-ahead log
///
/// Keys and values are the codec-encoded bytes; `expiry` is carried alongside
/// so compaction can drop dead records without decoding values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOp {
    /// Insert or replace a record
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        expiry: i64,
    },
    /// Remove a record
    Delete { key: Vec<u8> },
    /// Operations applied atomically under one LSN
    Batch { ops: Vec<WalOp> },
}

impl WalOp {
    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| Error::Serialization(format!("failed to encode WAL op: {}", e)))
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| Error::Deserialization(format!("failed to decode WAL op: {}", e)))
    }

    /// Number of leaf operations
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Batch { ops } => ops.iter().map(Self::len).sum(),
            _ => 1,
        }
    }
}

/// Snapshot file header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotHeader {
    /// LSN covered by the snapshot
    pub lsn: u64,
    /// Number of records in the snapshot
    pub entry_count: u64,
    /// CRC32C of the snapshot body
    pub checksum: u32,
}

impl SnapshotHeader {
    pub const MAGIC: u32 = 0x5354_5241; // "STRA"
    pub const VERSION: u32 = 1;
    pub const SIZE: usize = 32;

    #[must_use]
    pub fn new(lsn: u64, entry_count: u64, checksum: u32) -> Self {
        Self {
            lsn,
            entry_count,
            checksum,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&Self::MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&Self::VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.lsn.to_le_bytes());
        buf[16..24].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[24..28].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().ok()?);
        let version = u32::from_le_bytes(data[4..8].try_into().ok()?);
        if magic != Self::MAGIC || version != Self::VERSION {
            return None;
        }
        Some(Self {
            lsn: u64::from_le_bytes(data[8..16].try_into().ok()?),
            entry_count: u64::from_le_bytes(data[16..24].try_into().ok()?),
            checksum: u32::from_le_bytes(data[24..28].try_into().ok()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wal_op_roundtrip() {
        let op = WalOp::Batch {
            ops: vec![
                WalOp::Put {
                    key: b"k1".to_vec(),
                    value: b"v1".to_vec(),
                    expiry: 0,
                },
                WalOp::Delete { key: b"k2".to_vec() },
            ],
        };
        let parsed = WalOp::from_bytes(&op.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, op);
        assert_eq!(parsed.len(), 2);
        assert!(WalOp::from_bytes(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_snapshot_header_roundtrip() {
        let header = SnapshotHeader::new(1000, 500, 0xDEAD_BEEF);
        let parsed = SnapshotHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);

        let mut bytes = header.to_bytes();
        bytes[0] ^= 1;
        assert!(SnapshotHeader::from_bytes(&bytes).is_none());
    }
}
