//! Store adapter over the in-house WAL + index engine
//!
//! Writes are planned and logged under one commit lock, so a batch lands as a
//! single WAL record. Reads go straight to the index through the worker pool.
//! Backups are incremental by LSN: the marker is the engine's current LSN and
//! `since` selects records written after it.

use super::{
    Lifecycle, MissingKeys, Mutation, RecordSource, StoreOptions, parallel_get, plan_del,
    plan_set,
};
use crate::backup::{BackupHeader, BackupReader, BackupWriter};
use crate::engine::{Engine, WalOp};
use crate::parallel::WorkerPool;
use crate::store::{Store, StoreStats, annotate, check_lengths, teardown_allowed};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::sync::Arc;
use strata_common::{
    Codec, Error, FieldGroup, Key, KeyGroup, Liveness, NativeConfig, Result, ScratchPool,
    SharedClock,
};
use tracing::{debug, info};

impl RecordSource for Engine {
    fn read_batch(&self, keys: &[Bytes]) -> Result<Vec<Option<Bytes>>> {
        Ok(keys.iter().map(|key| self.get(key)).collect())
    }
}

fn to_wal_op(m: Mutation) -> WalOp {
    match m {
        Mutation::Put { key, value, expiry } => WalOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
            expiry,
        },
        Mutation::Delete { key } => WalOp::Delete { key: key.to_vec() },
    }
}

/// Field-group store on the in-house engine
pub struct NativeStore {
    engine: Arc<Engine>,
    missing: Option<Arc<MissingKeys>>,
    pool: WorkerPool,
    batch_size: usize,
    codec: Codec,
    clock: SharedClock,
    /// Serializes read-merge-write
    commit: Mutex<()>,
    scratch: ScratchPool,
    lifecycle: Lifecycle,
}

impl NativeStore {
    /// Open or create the engine under `config.data_dir`
    pub fn open(config: NativeConfig, options: StoreOptions) -> Result<Self> {
        let engine = Arc::new(Engine::open_or_create(config, Arc::clone(&options.clock))?);
        let pool = WorkerPool::new(options.name.as_str(), options.pool.workers)?;
        let lifecycle = Lifecycle::new(&options.name);

        let missing = MissingKeys::new(options.pool.missing_keys).map(Arc::new);

        let stats_engine = Arc::clone(&engine);
        let stats_missing = missing.clone();
        lifecycle.report(options.stats_interval, move || {
            engine_stats(&stats_engine, stats_missing.as_deref())
        })?;

        info!(
            "Opened native store {} at {:?}",
            options.name,
            engine.data_dir()
        );
        Ok(Self {
            engine,
            missing,
            pool,
            batch_size: options.pool.batch_size,
            codec: options.codec,
            clock: options.clock,
            commit: Mutex::new(()),
            scratch: ScratchPool::default(),
            lifecycle,
        })
    }

    fn commit(&self, mutations: Vec<Mutation>) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        let created: Vec<Bytes> = mutations
            .iter()
            .filter_map(Mutation::created_key)
            .cloned()
            .collect();
        self.forget_missing(&created);
        let ops = mutations.into_iter().map(to_wal_op).collect();
        let applied = self.engine.apply(ops);
        self.forget_missing(&created);
        let lsn = applied?;
        debug!("{}: committed at lsn {}", self.lifecycle.name(), lsn);
        Ok(())
    }

    fn forget_missing(&self, keys: &[Bytes]) {
        if let Some(missing) = &self.missing
            && !keys.is_empty()
        {
            missing.invalidate(keys);
        }
    }
}

fn engine_stats(engine: &Engine, missing: Option<&MissingKeys>) -> StoreStats {
    let stats = engine.stats();
    let out = StoreStats::new("native")
        .with("entries", stats.entry_count as f64)
        .with("raw_bytes", stats.raw_bytes as f64)
        .with("wal_bytes", stats.wal_size as f64)
        .with("lsn", stats.wal_lsn as f64)
        .with("snapshot_lsn", stats.last_snapshot_lsn as f64);
    match missing {
        Some(m) => out
            .with("missing_keys", m.len() as f64)
            .with("missing_hits", m.hits() as f64),
        None => out,
    }
}

impl Store for NativeStore {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn codec(&self) -> Codec {
        self.codec
    }

    fn get_many(&self, groups: &[KeyGroup]) -> Result<Vec<FieldGroup>> {
        self.lifecycle.check_open()?;
        parallel_get(
            &self.engine,
            self.missing.as_ref(),
            &self.pool,
            self.batch_size,
            self.codec,
            &self.clock,
            groups,
        )
        .map_err(|e| annotate(e, "get_many", groups.len()))
    }

    fn set_many(&self, keys: &[Key], deltas: &[FieldGroup]) -> Result<()> {
        self.lifecycle.check_open()?;
        check_lengths(keys, deltas)?;
        let _commit = self.commit.lock();
        let now = self.clock.now();
        plan_set(self.codec, &self.scratch, keys, deltas, now, |key| {
            Ok(self.engine.get(key))
        })
        .and_then(|mutations| self.commit(mutations))
        .map_err(|e| annotate(e, "set_many", keys.len()))
    }

    fn del_many(&self, groups: &[KeyGroup]) -> Result<()> {
        self.lifecycle.check_open()?;
        let _commit = self.commit.lock();
        let now = self.clock.now();
        plan_del(self.codec, &self.scratch, groups, now, |key| {
            Ok(self.engine.get(key))
        })
        .and_then(|mutations| self.commit(mutations))
        .map_err(|e| annotate(e, "del_many", groups.len()))
    }

    fn close(&self) -> Result<()> {
        if self.lifecycle.close() {
            self.pool.close();
            self.engine.shutdown();
        }
        Ok(())
    }

    fn teardown(&self) -> Result<()> {
        if !teardown_allowed() {
            return Err(Error::TeardownForbidden);
        }
        self.close()?;
        self.engine.destroy()
    }

    fn start_compaction(&self) -> Result<()> {
        self.lifecycle.check_open()?;
        self.engine.start_compaction()
    }

    fn stop_compaction(&self) -> Result<()> {
        self.engine.stop_compaction();
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.lifecycle.check_open()?;
        let _commit = self.commit.lock();
        self.engine
            .snapshot()
            .map(|path| debug!("Flushed {} to {:?}", self.lifecycle.name(), path))
            .map_err(|e| annotate(e, "flush", 0))
    }

    fn backup(&self, sink: &mut dyn Write, since: u64) -> Result<u64> {
        self.lifecycle.check_open()?;
        let (marker, records) = {
            let _commit = self.commit.lock();
            (self.engine.current_lsn(), self.engine.entries_since(since))
        };
        let mut writer = BackupWriter::start(sink, BackupHeader { since, marker })?;
        for (key, value) in &records {
            writer.record(key, value)?;
        }
        let count = writer.finish()?;
        info!(
            "Backed up {} records from {} (since {}, marker {})",
            count,
            self.lifecycle.name(),
            since,
            marker
        );
        Ok(marker)
    }

    fn restore(&self, source: &mut dyn Read) -> Result<()> {
        self.lifecycle.check_open()?;
        let mut reader = BackupReader::open(source)?;
        let now = self.clock.now();
        let mut ops = Vec::new();
        while let Some((key, value)) = reader.next_record()? {
            let (fg, _) = self.codec.decode_val(&value, true)?;
            if Liveness::of(fg.expiry, now).is_alive() {
                ops.push(WalOp::Put {
                    key: key.to_vec(),
                    value: value.to_vec(),
                    expiry: fg.expiry,
                });
            }
        }
        let count = ops.len();
        let _commit = self.commit.lock();
        let created: Vec<Bytes> = ops
            .iter()
            .filter_map(|op| match op {
                WalOp::Put { key, .. } => Some(Bytes::copy_from_slice(key)),
                _ => None,
            })
            .collect();
        self.forget_missing(&created);
        let applied = self.engine.apply(ops);
        self.forget_missing(&created);
        applied.map_err(|e| annotate(e, "restore", count))?;
        info!("Restored {} records into {}", count, self.lifecycle.name());
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        engine_stats(&self.engine, self.missing.as_deref())
    }
}

impl Drop for NativeStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
