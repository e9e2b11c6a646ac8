//! Backup stream framing
//!
//! Every engine writes the same envelope; only the record selection differs.
//!
//! ```text
//! +--------+---------+-------+--------+
//! | Magic  | Version | Since | Marker |
//! | 4B     | 4B      | 8B    | 8B     |
//! +--------+---------+-------+--------+
//! then per record:  [klen u32][vlen u32][key][value]
//! terminator:       [u32::MAX][count u64][crc32c u32]
//! ```
//!
//! Keys are encoded keys and values are encoded field groups. The CRC covers
//! every record byte including the length prefixes.

use bytes::Bytes;
use std::io::{Read, Write};
use strata_common::{Codec, Error, FieldGroup, Key, Result};

/// Backup stream magic number
const BACKUP_MAGIC: u32 = 0x5342_414B; // "SBAK"

/// Backup format version
const BACKUP_VERSION: u32 = 1;

/// Header size (magic + version + since + marker)
const HEADER_SIZE: usize = 24;

const TERMINATOR: u32 = u32::MAX;

/// Backup stream header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackupHeader {
    /// Marker the backup was taken relative to
    pub since: u64,
    /// Marker to pass as `since` for the next incremental backup
    pub marker: u64,
}

impl BackupHeader {
    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&BACKUP_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&BACKUP_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.since.to_le_bytes());
        buf[16..24].copy_from_slice(&self.marker.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let magic = read_u32(&buf[0..4]);
        if magic != BACKUP_MAGIC {
            return Err(Error::Deserialization("invalid backup magic".into()));
        }
        let version = read_u32(&buf[4..8]);
        if version != BACKUP_VERSION {
            return Err(Error::Deserialization(format!(
                "unsupported backup version {}",
                version
            )));
        }
        Ok(Self {
            since: read_u64(&buf[8..16]),
            marker: read_u64(&buf[16..24]),
        })
    }
}

fn read_u32(b: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&b[..4]);
    u32::from_le_bytes(arr)
}

fn read_u64(b: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&b[..8]);
    u64::from_le_bytes(arr)
}

/// Writes one backup stream
pub struct BackupWriter<'a> {
    sink: &'a mut dyn Write,
    count: u64,
    crc: u32,
}

impl<'a> BackupWriter<'a> {
    /// Write the header and return a writer for the records
    pub fn start(sink: &'a mut dyn Write, header: BackupHeader) -> Result<Self> {
        sink.write_all(&header.to_bytes())?;
        Ok(Self {
            sink,
            count: 0,
            crc: 0,
        })
    }

    /// Append one encoded record
    pub fn record(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let klen = u32::try_from(key.len())
            .ok()
            .filter(|&n| n != TERMINATOR)
            .ok_or_else(|| Error::Serialization(format!("key too large: {} bytes", key.len())))?;
        let vlen = u32::try_from(value.len()).map_err(|_| {
            Error::Serialization(format!("value too large: {} bytes", value.len()))
        })?;

        let mut prefix = [0u8; 8];
        prefix[0..4].copy_from_slice(&klen.to_le_bytes());
        prefix[4..8].copy_from_slice(&vlen.to_le_bytes());
        for part in [&prefix[..], key, value] {
            self.sink.write_all(part)?;
            self.crc = crc32c::crc32c_append(self.crc, part);
        }
        self.count += 1;
        Ok(())
    }

    /// Encode and append a record
    pub fn field_group(&mut self, codec: Codec, key: &Key, fg: &FieldGroup) -> Result<()> {
        let encoded = codec.encode_keys(std::slice::from_ref(key))?;
        let value = codec.encode_vals(std::slice::from_ref(fg))?;
        self.record(&encoded[0], &value[0])
    }

    /// Write the trailer and return the number of records
    pub fn finish(mut self) -> Result<u64> {
        self.sink.write_all(&TERMINATOR.to_le_bytes())?;
        self.sink.write_all(&self.count.to_le_bytes())?;
        self.sink.write_all(&self.crc.to_le_bytes())?;
        self.sink.flush()?;
        Ok(self.count)
    }
}

/// Reads one backup stream, verifying the trailer
pub struct BackupReader<'a> {
    source: &'a mut dyn Read,
    header: BackupHeader,
    count: u64,
    crc: u32,
    done: bool,
}

impl<'a> BackupReader<'a> {
    /// Read and validate the header
    pub fn open(source: &'a mut dyn Read) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        source.read_exact(&mut buf)?;
        let header = BackupHeader::from_bytes(&buf)?;
        Ok(Self {
            source,
            header,
            count: 0,
            crc: 0,
            done: false,
        })
    }

    #[must_use]
    pub fn header(&self) -> BackupHeader {
        self.header
    }

    /// Next `(encoded key, encoded value)` pair, `None` after a valid trailer
    pub fn next_record(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        if self.done {
            return Ok(None);
        }
        let mut len = [0u8; 4];
        self.source.read_exact(&mut len)?;
        let klen = u32::from_le_bytes(len);
        if klen == TERMINATOR {
            self.verify_trailer()?;
            self.done = true;
            return Ok(None);
        }
        let mut vlen_buf = [0u8; 4];
        self.source.read_exact(&mut vlen_buf)?;
        let vlen = u32::from_le_bytes(vlen_buf);

        let mut key = vec![0u8; klen as usize];
        self.source.read_exact(&mut key)?;
        let mut value = vec![0u8; vlen as usize];
        self.source.read_exact(&mut value)?;

        for part in [&len[..], &vlen_buf[..], &key[..], &value[..]] {
            self.crc = crc32c::crc32c_append(self.crc, part);
        }
        self.count += 1;
        Ok(Some((key.into(), value.into())))
    }

    /// Next record decoded with `codec`
    pub fn next_field_group(&mut self, codec: Codec) -> Result<Option<(Key, FieldGroup)>> {
        let Some((key, value)) = self.next_record()? else {
            return Ok(None);
        };
        let (key, _) = Codec::decode_key(&key)?;
        let (fg, _) = codec.decode_val(&value, true)?;
        Ok(Some((key, fg)))
    }

    fn verify_trailer(&mut self) -> Result<()> {
        let mut buf = [0u8; 12];
        self.source.read_exact(&mut buf)?;
        let count = read_u64(&buf[0..8]);
        let crc = read_u32(&buf[8..12]);
        if count != self.count {
            return Err(Error::Deserialization(format!(
                "backup record count mismatch: trailer says {}, read {}",
                count, self.count
            )));
        }
        if crc != self.crc {
            return Err(Error::Deserialization("backup checksum mismatch".into()));
        }
        Ok(())
    }
}
