//! Engine adapters
//!
//! Each submodule adapts one storage engine to [`Store`](crate::Store). The
//! helpers here hold what every adapter shares: the read-merge-write
//! planning, the batched parallel read, and the open/closed lifecycle.

mod arc;
pub mod cache;
pub mod memory;
mod missing;
pub mod native;
pub mod redb;

pub(crate) use missing::MissingKeys;

use crate::parallel::WorkerPool;
use crate::reporter::StatsReporter;
use crate::store::{StoreStats, decode_existing, read_record};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use strata_common::{
    Codec, Error, FieldGroup, Key, KeyGroup, PoolConfig, Result, ScratchPool, SharedClock,
    WritePlan, merge_updates,
};
use tracing::debug;

/// Settings every adapter is built with
#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub name: String,
    pub codec: Codec,
    pub pool: PoolConfig,
    /// `None` disables the stats reporter
    pub stats_interval: Option<Duration>,
    pub clock: SharedClock,
}

impl StoreOptions {
    pub fn new(name: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            codec: Codec::default(),
            pool: PoolConfig::default(),
            stats_interval: None,
            clock,
        }
    }
}

/// One physical change to an engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Mutation {
    Put { key: Bytes, value: Bytes, expiry: i64 },
    Delete { key: Bytes },
}

impl Mutation {
    /// Key this mutation makes present, if any
    pub(crate) fn created_key(&self) -> Option<&Bytes> {
        match self {
            Self::Put { key, .. } => Some(key),
            Self::Delete { .. } => None,
        }
    }
}

/// Engine read path shared by the parallel executor
pub(crate) trait RecordSource: Send + Sync + 'static {
    /// Look up encoded keys, returning one stored value per key
    fn read_batch(&self, keys: &[Bytes]) -> Result<Vec<Option<Bytes>>>;
}

/// Read `groups` in parallel batches, keeping input order
///
/// With `missing` set, keys known to be absent are answered without a read.
pub(crate) fn parallel_get<S: RecordSource>(
    source: &Arc<S>,
    missing: Option<&Arc<MissingKeys>>,
    pool: &WorkerPool,
    batch_size: usize,
    codec: Codec,
    clock: &SharedClock,
    groups: &[KeyGroup],
) -> Result<Vec<FieldGroup>> {
    let keys = codec.encode_key_groups(groups)?;
    let items: Vec<(usize, Bytes, KeyGroup)> = keys
        .into_iter()
        .zip(groups.iter().cloned())
        .enumerate()
        .map(|(i, (key, group))| (i, key, group))
        .collect();

    let source = Arc::clone(source);
    let missing = missing.map(|m| (Arc::clone(m), m.epoch()));
    let clock = Arc::clone(clock);
    pool.process(&items, batch_size, move |batch| {
        let keys: Vec<Bytes> = batch.iter().map(|(_, key, _)| key.clone()).collect();
        let raw = match &missing {
            Some((missing, epoch)) => missing.read_through(source.as_ref(), &keys, *epoch)?,
            None => source.read_batch(&keys)?,
        };
        let now = clock.now();
        batch
            .iter()
            .zip(raw)
            .map(|((index, _, group), raw)| {
                read_record(codec, raw.as_ref(), group, now).map_err(|e| e.at_item(*index))
            })
            .collect()
    })
}

fn encode_put(codec: Codec, scratch: &ScratchPool, key: Bytes, fg: &FieldGroup) -> Result<Mutation> {
    let mut buf = scratch.checkout(codec.val_len_hint(fg));
    let value = Bytes::copy_from_slice(buf.encode_val(codec, fg)?);
    Ok(Mutation::Put {
        key,
        value,
        expiry: fg.expiry,
    })
}

fn finish_plan(
    codec: Codec,
    scratch: &ScratchPool,
    key: Bytes,
    plan: WritePlan,
) -> Result<Option<Mutation>> {
    match plan {
        WritePlan::Put(fg) => encode_put(codec, scratch, key, &fg).map(Some),
        WritePlan::Delete => Ok(Some(Mutation::Delete { key })),
        WritePlan::Skip => Ok(None),
    }
}

/// Plan the merge-patch of `deltas` onto the records returned by `read`
///
/// Deltas for the same key are consolidated first, so each key is read and
/// written once.
pub(crate) fn plan_set<R>(
    codec: Codec,
    scratch: &ScratchPool,
    keys: &[Key],
    deltas: &[FieldGroup],
    now: i64,
    mut read: R,
) -> Result<Vec<Mutation>>
where
    R: FnMut(&[u8]) -> Result<Option<Bytes>>,
{
    let (keys, deltas) = merge_updates(keys, deltas)?;
    let encoded = codec.encode_keys(&keys)?;
    let mut out = Vec::with_capacity(encoded.len());
    for (i, (key, delta)) in encoded.into_iter().zip(&deltas).enumerate() {
        let existing = decode_existing(codec, read(&key[..])?.as_ref()).map_err(|e| e.at_item(i))?;
        let plan = WritePlan::for_set(existing, delta, now).map_err(|e| e.at_item(i))?;
        if let Some(m) = finish_plan(codec, scratch, key, plan)? {
            out.push(m);
        }
    }
    Ok(out)
}

/// Plan the removal of the fields named by `groups`
///
/// Later groups see the effect of earlier ones in the same batch.
pub(crate) fn plan_del<R>(
    codec: Codec,
    scratch: &ScratchPool,
    groups: &[KeyGroup],
    now: i64,
    mut read: R,
) -> Result<Vec<Mutation>>
where
    R: FnMut(&[u8]) -> Result<Option<Bytes>>,
{
    let encoded = codec.encode_key_groups(groups)?;
    let mut pending: HashMap<Bytes, Option<Bytes>> = HashMap::new();
    let mut out = Vec::with_capacity(encoded.len());
    for (i, (key, group)) in encoded.into_iter().zip(groups).enumerate() {
        let raw = match pending.get(&key) {
            Some(staged) => staged.clone(),
            None => read(&key[..])?,
        };
        let existing = decode_existing(codec, raw.as_ref()).map_err(|e| e.at_item(i))?;
        let plan = WritePlan::for_delete(existing, group.fields.as_deref(), now);
        if let Some(m) = finish_plan(codec, scratch, key.clone(), plan)? {
            let staged = match &m {
                Mutation::Put { value, .. } => Some(value.clone()),
                Mutation::Delete { .. } => None,
            };
            pending.insert(key, staged);
            out.push(m);
        }
    }
    Ok(out)
}

/// Open/closed state and the stats loop of one adapter
pub(crate) struct Lifecycle {
    name: String,
    closed: AtomicBool,
    reporter: Mutex<Option<StatsReporter>>,
}

impl Lifecycle {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            closed: AtomicBool::new(false),
            reporter: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Start publishing `snapshot()` if an interval is configured
    pub(crate) fn report<F>(&self, interval: Option<Duration>, snapshot: F) -> Result<()>
    where
        F: Fn() -> StoreStats + Send + 'static,
    {
        if let Some(interval) = interval {
            let reporter = StatsReporter::start(self.name.clone(), interval, snapshot)?;
            *self.reporter.lock() = Some(reporter);
        }
        Ok(())
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Mark closed and stop the reporter; false if already closed
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(reporter) = self.reporter.lock().take() {
            reporter.stop();
        }
        debug!("Closed store {}", self.name);
        true
    }
}
