//! The backend contract
//!
//! Every engine (native, redb, memory, cache) and the layered composition
//! implement [`Store`]. Callers hold a `Box<dyn Store>` or `Arc<dyn Store>`
//! and never depend on a concrete engine.

use bytes::Bytes;
use std::io::{Read, Write};
use strata_common::{Codec, Error, FieldGroup, Key, KeyGroup, Result};

/// Batched field-group store
///
/// Absent keys and fields are never errors: `get_many` returns an empty
/// group for them. Results are positional with the input.
pub trait Store: Send + Sync {
    /// Instance name, used in logs and metric labels
    fn name(&self) -> &str;

    /// Binary format used for persisted keys and values
    fn codec(&self) -> Codec;

    /// Read one field group per key group, in input order
    fn get_many(&self, groups: &[KeyGroup]) -> Result<Vec<FieldGroup>>;

    /// Apply each delta as a merge patch onto the stored record
    fn set_many(&self, keys: &[Key], deltas: &[FieldGroup]) -> Result<()>;

    /// Remove the selected fields, or the whole key without a selector
    fn del_many(&self, groups: &[KeyGroup]) -> Result<()>;

    /// Stop background work and release the engine
    fn close(&self) -> Result<()>;

    /// Destroy all persisted state
    ///
    /// Only available in test builds or with the `testing` feature.
    fn teardown(&self) -> Result<()>;

    /// Start background compaction
    fn start_compaction(&self) -> Result<()> {
        Err(Error::not_implemented(format!(
            "start_compaction on {} store",
            self.name()
        )))
    }

    /// Stop background compaction
    fn stop_compaction(&self) -> Result<()> {
        Err(Error::not_implemented(format!(
            "stop_compaction on {} store",
            self.name()
        )))
    }

    /// Persist in-memory state and reclaim log space
    fn flush(&self) -> Result<()> {
        Err(Error::not_implemented(format!("flush on {} store", self.name())))
    }

    /// Stream records changed after `since` into `sink`, returning the new marker
    fn backup(&self, sink: &mut dyn Write, since: u64) -> Result<u64>;

    /// Load records produced by [`Store::backup`]
    fn restore(&self, source: &mut dyn Read) -> Result<()>;

    /// Current engine statistics
    fn stats(&self) -> StoreStats;
}

/// Snapshot of engine statistics
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    /// Engine kind
    pub engine: &'static str,
    /// Named values
    pub metrics: Vec<(String, f64)>,
}

impl StoreStats {
    #[must_use]
    pub fn new(engine: &'static str) -> Self {
        Self {
            engine,
            metrics: Vec::new(),
        }
    }

    /// Add a named value
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.push((name.into(), value));
        self
    }

    /// Append the values of `other`, prefixing their names with `tier`
    #[must_use]
    pub fn merged(mut self, tier: &str, other: &Self) -> Self {
        self.metrics.extend(
            other
                .metrics
                .iter()
                .map(|(name, value)| (format!("{tier}_{name}"), *value)),
        );
        self
    }

    /// Look up a named value
    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.metrics
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }
}

/// Check whether destructive teardown is compiled in
#[must_use]
pub const fn teardown_allowed() -> bool {
    cfg!(any(test, feature = "testing"))
}

/// Attach operation context to an engine error
///
/// Encoding failures and caller misuse pass through unchanged so callers can
/// still match on them.
pub(crate) fn annotate(err: Error, op: &'static str, keys: usize) -> Error {
    if err.is_encoding() || err.is_misuse() {
        err
    } else {
        err.during(op, keys)
    }
}

/// Decode a stored record and shape it for a read
///
/// Expired records read as empty. A selector narrows the result.
pub(crate) fn read_record(
    codec: Codec,
    raw: Option<&Bytes>,
    group: &KeyGroup,
    now: i64,
) -> Result<FieldGroup> {
    let Some(raw) = raw else {
        return Ok(FieldGroup::default());
    };
    let (mut fg, _) = codec.decode_val(raw, true)?;
    if !fg.is_alive(now) {
        return Ok(FieldGroup::default());
    }
    if let Some(fields) = &group.fields {
        fg.select(fields);
    }
    Ok(fg)
}

/// Decode a stored record for a read-merge-write
pub(crate) fn decode_existing(codec: Codec, raw: Option<&Bytes>) -> Result<Option<FieldGroup>> {
    raw.map(|raw| codec.decode_val(raw, true).map(|(fg, _)| fg))
        .transpose()
}

/// Reject mismatched `set_many` inputs
pub(crate) fn check_lengths(keys: &[Key], deltas: &[FieldGroup]) -> Result<()> {
    if keys.len() == deltas.len() {
        Ok(())
    } else {
        Err(Error::LengthMismatch {
            keys: keys.len(),
            deltas: deltas.len(),
        })
    }
}
