//! Binary encoding of keys and field groups
//!
//! Encoded key: `[codec id][uvarint len][key bytes]`.
//!
//! Encoded value: `[uvarint n]` followed by `n` pairs of
//! `[uvarint len][field][uvarint len][value]`, then the expiry as a zig-zag
//! signed varint.
//!
//! Encoders check the destination against the length hint before writing, so
//! a short buffer is reported without touching it. Decoders never panic on
//! malformed input.

use crate::error::{Error, Result};
use crate::types::{FieldGroup, Key, KeyGroup};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

/// Maximum encoded length of a 64-bit varint
pub const MAX_VARINT_LEN64: usize = 10;

/// Number of bytes `x` takes as an unsigned varint
#[must_use]
pub const fn uvarint_len(mut x: u64) -> usize {
    let mut n = 1;
    while x >= 0x80 {
        x >>= 7;
        n += 1;
    }
    n
}

/// Number of bytes `x` takes as a zig-zag signed varint
#[must_use]
pub const fn varint_len(x: i64) -> usize {
    uvarint_len(zigzag(x))
}

const fn zigzag(x: i64) -> u64 {
    ((x << 1) ^ (x >> 63)) as u64
}

const fn unzigzag(u: u64) -> i64 {
    ((u >> 1) as i64) ^ -((u & 1) as i64)
}

/// Write `x` as an unsigned varint, returning the bytes written
///
/// `buf` must hold at least [`uvarint_len`] bytes.
pub fn put_uvarint(buf: &mut [u8], mut x: u64) -> usize {
    let mut i = 0;
    while x >= 0x80 {
        buf[i] = (x as u8) | 0x80;
        x >>= 7;
        i += 1;
    }
    buf[i] = x as u8;
    i + 1
}

/// Write `x` as a zig-zag signed varint, returning the bytes written
pub fn put_varint(buf: &mut [u8], x: i64) -> usize {
    put_uvarint(buf, zigzag(x))
}

/// Read an unsigned varint, returning the value and the bytes consumed
pub fn read_uvarint(src: &[u8]) -> Result<(u64, usize)> {
    let mut x = 0u64;
    let mut shift = 0u32;
    for (i, &b) in src.iter().enumerate() {
        if i == MAX_VARINT_LEN64 {
            return Err(Error::decode("varint overflows 64 bits"));
        }
        if b < 0x80 {
            if i == MAX_VARINT_LEN64 - 1 && b > 1 {
                return Err(Error::decode("varint overflows 64 bits"));
            }
            return Ok((x | (u64::from(b) << shift), i + 1));
        }
        x |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }
    Err(Error::decode("truncated varint"))
}

/// Read a zig-zag signed varint
pub fn read_varint(src: &[u8]) -> Result<(i64, usize)> {
    let (u, n) = read_uvarint(src)?;
    Ok((unzigzag(u), n))
}

/// Read a length-prefixed byte string starting at `pos`, returning its range
fn read_chunk(src: &[u8], pos: usize) -> Result<(usize, usize)> {
    let (len, n) = read_uvarint(&src[pos..])?;
    let start = pos + n;
    let remaining = src.len() - start;
    let len = usize::try_from(len).map_err(|_| Error::decode("length overflows usize"))?;
    if len > remaining {
        return Err(Error::decode(format!(
            "length {len} exceeds remaining {remaining} bytes"
        )));
    }
    Ok((start, start + len))
}

fn write_chunk(dest: &mut [u8], pos: usize, data: &[u8]) -> usize {
    let n = put_uvarint(&mut dest[pos..], data.len() as u64);
    let start = pos + n;
    dest[start..start + data.len()].copy_from_slice(data);
    start + data.len()
}

/// Versioned binary format
///
/// The numeric id is persisted as the first byte of every encoded key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Codec {
    #[default]
    V1 = 1,
}

impl Codec {
    /// Persisted identifier
    #[must_use]
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Look up a codec by its persisted identifier
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            1 => Ok(Self::V1),
            other => Err(Error::UnknownCodec(other)),
        }
    }

    /// Upper bound on the encoded size of `key`
    #[must_use]
    pub fn key_len_hint(self, key: &Key) -> usize {
        match self {
            Self::V1 => 1 + uvarint_len(key.len() as u64) + key.len(),
        }
    }

    /// Upper bound on the encoded size of `fg`
    #[must_use]
    pub fn val_len_hint(self, fg: &FieldGroup) -> usize {
        match self {
            Self::V1 => {
                let pairs: usize = fg
                    .fields
                    .iter()
                    .chain(&fg.values)
                    .map(|b| uvarint_len(b.len() as u64) + b.len())
                    .sum();
                uvarint_len(fg.fields.len() as u64) + pairs + varint_len(fg.expiry)
            }
        }
    }

    /// Encode `key` into `dest`, returning the bytes written
    pub fn encode_key(self, dest: &mut [u8], key: &Key) -> Result<usize> {
        let needed = self.key_len_hint(key);
        if dest.len() < needed {
            return Err(Error::BufferTooSmall {
                needed,
                available: dest.len(),
            });
        }
        match self {
            Self::V1 => {
                dest[0] = self.id();
                Ok(write_chunk(dest, 1, key.as_bytes()))
            }
        }
    }

    /// Decode a key, dispatching on its leading codec id
    pub fn decode_key(src: &[u8]) -> Result<(Key, usize)> {
        let Some(&id) = src.first() else {
            return Err(Error::decode("empty key buffer"));
        };
        match Self::from_id(id)? {
            Self::V1 => {
                let (start, end) = read_chunk(src, 1)?;
                Ok((Key::new(Bytes::copy_from_slice(&src[start..end])), end))
            }
        }
    }

    /// Encode `fg` into `dest`, returning the bytes written
    pub fn encode_val(self, dest: &mut [u8], fg: &FieldGroup) -> Result<usize> {
        fg.check_valid()?;
        let needed = self.val_len_hint(fg);
        if dest.len() < needed {
            return Err(Error::BufferTooSmall {
                needed,
                available: dest.len(),
            });
        }
        match self {
            Self::V1 => {
                let mut pos = put_uvarint(dest, fg.fields.len() as u64);
                for (field, value) in fg.iter() {
                    pos = write_chunk(dest, pos, field);
                    pos = write_chunk(dest, pos, value);
                }
                pos += put_varint(&mut dest[pos..], fg.expiry);
                Ok(pos)
            }
        }
    }

    /// Decode a field group
    ///
    /// With `reuse == false` the source bytes are copied first and the result
    /// shares nothing with `src`. With `reuse == true` fields and values are
    /// slices of `src`.
    pub fn decode_val(self, src: &Bytes, reuse: bool) -> Result<(FieldGroup, usize)> {
        let src = if reuse {
            src.clone()
        } else {
            Bytes::copy_from_slice(src)
        };
        match self {
            Self::V1 => {
                let (count, mut pos) = read_uvarint(&src)?;
                let count = usize::try_from(count)
                    .map_err(|_| Error::decode("field count overflows usize"))?;
                // every pair needs at least two length bytes
                let capacity = count.min((src.len() - pos) / 2);
                let mut fg = FieldGroup {
                    fields: Vec::with_capacity(capacity),
                    values: Vec::with_capacity(capacity),
                    expiry: 0,
                };
                for _ in 0..count {
                    let (start, end) = read_chunk(&src, pos)?;
                    fg.fields.push(src.slice(start..end));
                    let (start, end) = read_chunk(&src, end)?;
                    fg.values.push(src.slice(start..end));
                    pos = end;
                }
                let (expiry, n) = read_varint(&src[pos..])?;
                fg.expiry = expiry;
                Ok((fg, pos + n))
            }
        }
    }

    /// Encode keys into one shared allocation
    pub fn encode_keys(self, keys: &[Key]) -> Result<Vec<Bytes>> {
        encode_batch(
            keys,
            |k| self.key_len_hint(k),
            |dest, k| self.encode_key(dest, k),
        )
    }

    /// Encode the prefix key of each key group into one shared allocation
    pub fn encode_key_groups(self, groups: &[KeyGroup]) -> Result<Vec<Bytes>> {
        encode_batch(
            groups,
            |g| self.key_len_hint(&g.prefix),
            |dest, g| self.encode_key(dest, &g.prefix),
        )
    }

    /// Encode field groups into one shared allocation
    pub fn encode_vals(self, vals: &[FieldGroup]) -> Result<Vec<Bytes>> {
        encode_batch(
            vals,
            |v| self.val_len_hint(v),
            |dest, v| self.encode_val(dest, v),
        )
    }
}

fn encode_batch<T>(
    items: &[T],
    hint: impl Fn(&T) -> usize,
    encode: impl Fn(&mut [u8], &T) -> Result<usize>,
) -> Result<Vec<Bytes>> {
    let total = items.iter().map(&hint).sum();
    let mut buf = BytesMut::zeroed(total);
    let mut bounds = Vec::with_capacity(items.len());
    let mut pos = 0;
    for (i, item) in items.iter().enumerate() {
        let n = encode(&mut buf[pos..], item).map_err(|e| e.at_item(i))?;
        bounds.push((pos, pos + n));
        pos += n;
    }
    let buf = buf.freeze();
    Ok(bounds
        .into_iter()
        .map(|(start, end)| buf.slice(start..end))
        .collect())
}

/// Pool of reusable encode buffers
///
/// Buffers are checked out as [`Scratch`] guards and returned on drop.
#[derive(Debug)]
pub struct ScratchPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl ScratchPool {
    /// Create a pool retaining at most `max_pooled` idle buffers
    #[must_use]
    pub fn new(max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
        }
    }

    /// Check out a zeroed buffer of at least `min_len` bytes
    pub fn checkout(&self, min_len: usize) -> Scratch<'_> {
        let mut buf = self.buffers.lock().pop().unwrap_or_default();
        buf.clear();
        buf.resize(min_len, 0);
        Scratch { pool: self, buf }
    }

    /// Number of idle buffers
    #[must_use]
    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new(16)
    }
}

/// Checked-out scratch buffer
pub struct Scratch<'a> {
    pool: &'a ScratchPool,
    buf: Vec<u8>,
}

impl Scratch<'_> {
    /// Encode `fg` into this buffer and return the encoded bytes
    pub fn encode_val(&mut self, codec: Codec, fg: &FieldGroup) -> Result<&[u8]> {
        let hint = codec.val_len_hint(fg);
        if self.buf.len() < hint {
            self.buf.resize(hint, 0);
        }
        let n = codec.encode_val(&mut self.buf, fg)?;
        Ok(&self.buf[..n])
    }

    /// Encode `key` into this buffer and return the encoded bytes
    pub fn encode_key(&mut self, codec: Codec, key: &Key) -> Result<&[u8]> {
        let hint = codec.key_len_hint(key);
        if self.buf.len() < hint {
            self.buf.resize(hint, 0);
        }
        let n = codec.encode_key(&mut self.buf, key)?;
        Ok(&self.buf[..n])
    }
}

impl Deref for Scratch<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for Scratch<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for Scratch<'_> {
    fn drop(&mut self) {
        let mut idle = self.pool.buffers.lock();
        if idle.len() < self.pool.max_pooled {
            idle.push(std::mem::take(&mut self.buf));
        }
    }
}
