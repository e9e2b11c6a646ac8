//! Store adapter over redb
//!
//! One table maps encoded keys to encoded field groups. Writes read, merge and
//! write inside a single redb write transaction; redb serializes writers, so
//! concurrent readers see either the old or the new record. Backups are full
//! dumps taken from one read transaction.

use super::{
    Lifecycle, MissingKeys, Mutation, RecordSource, StoreOptions, parallel_get, plan_del,
    plan_set,
};
use crate::backup::{BackupHeader, BackupReader, BackupWriter};
use crate::parallel::WorkerPool;
use crate::store::{Store, StoreStats, annotate, check_lengths, teardown_allowed};
use ::redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use bytes::Bytes;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::{
    Codec, Error, FieldGroup, Key, KeyGroup, Liveness, RedbConfig, Result, ScratchPool,
    SharedClock,
};
use tracing::{info, warn};

const RECORDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("records");

fn storage_err(step: &str, e: impl std::fmt::Display) -> Error {
    Error::Storage(format!("redb {} failed: {}", step, e))
}

struct RedbEngine {
    db: Database,
    path: PathBuf,
    /// Bumped on every committed write; used as the backup marker
    commits: AtomicU64,
    missing: Option<Arc<MissingKeys>>,
}

impl RedbEngine {
    fn open(path: PathBuf, missing: Option<Arc<MissingKeys>>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path).map_err(|e| storage_err("open", e))?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write().map_err(|e| storage_err("begin_write", e))?;
        {
            let _t = write_txn
                .open_table(RECORDS)
                .map_err(|e| storage_err("open_table", e))?;
        }
        write_txn.commit().map_err(|e| storage_err("commit", e))?;

        Ok(Self {
            db,
            path,
            commits: AtomicU64::new(0),
            missing,
        })
    }

    /// Plan and apply mutations inside one write transaction
    fn write<P>(&self, plan: P) -> Result<()>
    where
        P: FnOnce(&mut dyn FnMut(&[u8]) -> Result<Option<Bytes>>) -> Result<Vec<Mutation>>,
    {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| storage_err("begin_write", e))?;
        let (changed, created) = {
            let mut table = write_txn
                .open_table(RECORDS)
                .map_err(|e| storage_err("open_table", e))?;
            let mutations = {
                let mut read = |key: &[u8]| -> Result<Option<Bytes>> {
                    let value = table.get(key).map_err(|e| storage_err("get", e))?;
                    Ok(value.map(|v| Bytes::copy_from_slice(v.value())))
                };
                plan(&mut read)?
            };
            let created: Vec<Bytes> = mutations
                .iter()
                .filter_map(Mutation::created_key)
                .cloned()
                .collect();
            self.forget_missing(&created);
            for m in &mutations {
                match m {
                    Mutation::Put { key, value, .. } => {
                        table
                            .insert(&key[..], &value[..])
                            .map_err(|e| storage_err("insert", e))?;
                    }
                    Mutation::Delete { key } => {
                        table
                            .remove(&key[..])
                            .map_err(|e| storage_err("remove", e))?;
                    }
                }
            }
            (!mutations.is_empty(), created)
        };
        if changed {
            let committed = write_txn.commit().map_err(|e| storage_err("commit", e));
            self.forget_missing(&created);
            committed?;
            self.commits.fetch_add(1, Ordering::AcqRel);
        } else {
            write_txn.abort().map_err(|e| storage_err("abort", e))?;
        }
        Ok(())
    }

    fn forget_missing(&self, keys: &[Bytes]) {
        if let Some(missing) = &self.missing
            && !keys.is_empty()
        {
            missing.invalidate(keys);
        }
    }

    /// Every stored record, read from one snapshot of the table
    fn dump(&self) -> Result<Vec<(Bytes, Bytes)>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| storage_err("begin_read", e))?;
        let table = read_txn
            .open_table(RECORDS)
            .map_err(|e| storage_err("open_table", e))?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(|e| storage_err("iter", e))? {
            let (key, value) = entry.map_err(|e| storage_err("iter", e))?;
            out.push((
                Bytes::copy_from_slice(key.value()),
                Bytes::copy_from_slice(value.value()),
            ));
        }
        Ok(out)
    }

    fn len(&self) -> u64 {
        let count = self.db.begin_read().ok().and_then(|txn| {
            txn.open_table(RECORDS)
                .ok()
                .and_then(|table| table.len().ok())
        });
        count.unwrap_or_default()
    }

    fn clear(&self) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| storage_err("begin_write", e))?;
        write_txn
            .delete_table(RECORDS)
            .map_err(|e| storage_err("delete_table", e))?;
        {
            let _t = write_txn
                .open_table(RECORDS)
                .map_err(|e| storage_err("open_table", e))?;
        }
        write_txn.commit().map_err(|e| storage_err("commit", e))
    }
}

impl RecordSource for RedbEngine {
    fn read_batch(&self, keys: &[Bytes]) -> Result<Vec<Option<Bytes>>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| storage_err("begin_read", e))?;
        let table = read_txn
            .open_table(RECORDS)
            .map_err(|e| storage_err("open_table", e))?;
        keys.iter()
            .map(|key| {
                let value = table.get(&key[..]).map_err(|e| storage_err("get", e))?;
                Ok(value.map(|v| Bytes::copy_from_slice(v.value())))
            })
            .collect()
    }
}

/// Field-group store on redb
pub struct RedbStore {
    engine: Arc<RedbEngine>,
    pool: WorkerPool,
    batch_size: usize,
    codec: Codec,
    clock: SharedClock,
    scratch: ScratchPool,
    lifecycle: Lifecycle,
}

impl RedbStore {
    /// Open (or create) the database at `config.path`
    pub fn open(config: RedbConfig, options: StoreOptions) -> Result<Self> {
        let missing = MissingKeys::new(options.pool.missing_keys).map(Arc::new);
        let engine = Arc::new(RedbEngine::open(config.path, missing)?);
        let pool = WorkerPool::new(options.name.as_str(), options.pool.workers)?;
        let lifecycle = Lifecycle::new(&options.name);

        let stats_engine = Arc::clone(&engine);
        lifecycle.report(options.stats_interval, move || redb_stats(&stats_engine))?;

        info!("Opened redb store {} at {:?}", options.name, engine.path);
        Ok(Self {
            engine,
            pool,
            batch_size: options.pool.batch_size,
            codec: options.codec,
            clock: options.clock,
            scratch: ScratchPool::default(),
            lifecycle,
        })
    }
}

fn redb_stats(engine: &RedbEngine) -> StoreStats {
    let file_bytes = std::fs::metadata(&engine.path).map_or(0, |m| m.len());
    let out = StoreStats::new("redb")
        .with("entries", engine.len() as f64)
        .with("file_bytes", file_bytes as f64)
        .with("commits", engine.commits.load(Ordering::Acquire) as f64);
    match &engine.missing {
        Some(m) => out
            .with("missing_keys", m.len() as f64)
            .with("missing_hits", m.hits() as f64),
        None => out,
    }
}

impl Store for RedbStore {
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
            self.engine.missing.as_ref(),
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
        let now = self.clock.now();
        self.engine
            .write(|read| plan_set(self.codec, &self.scratch, keys, deltas, now, read))
            .map_err(|e| annotate(e, "set_many", keys.len()))
    }

    fn del_many(&self, groups: &[KeyGroup]) -> Result<()> {
        self.lifecycle.check_open()?;
        let now = self.clock.now();
        self.engine
            .write(|read| plan_del(self.codec, &self.scratch, groups, now, read))
            .map_err(|e| annotate(e, "del_many", groups.len()))
    }

    fn close(&self) -> Result<()> {
        if self.lifecycle.close() {
            self.pool.close();
        }
        Ok(())
    }

    fn teardown(&self) -> Result<()> {
        if !teardown_allowed() {
            return Err(Error::TeardownForbidden);
        }
        self.close()?;
        self.engine.clear()?;
        if let Err(e) = std::fs::remove_file(&self.engine.path) {
            warn!("Failed to remove {:?}: {}", self.engine.path, e);
        }
        Ok(())
    }

    fn backup(&self, sink: &mut dyn Write, since: u64) -> Result<u64> {
        self.lifecycle.check_open()?;
        let marker = self.engine.commits.load(Ordering::Acquire);
        let records = self
            .engine
            .dump()
            .map_err(|e| annotate(e, "backup", 0))?;
        let mut writer = BackupWriter::start(sink, BackupHeader { since, marker })?;
        for (key, value) in &records {
            writer.record(key, value)?;
        }
        let count = writer.finish()?;
        info!("Backed up {} records from {}", count, self.lifecycle.name());
        Ok(marker)
    }

    fn restore(&self, source: &mut dyn Read) -> Result<()> {
        self.lifecycle.check_open()?;
        let mut reader = BackupReader::open(source)?;
        let now = self.clock.now();
        let mut mutations = Vec::new();
        while let Some((key, value)) = reader.next_record()? {
            let (fg, _) = self.codec.decode_val(&value, true)?;
            if Liveness::of(fg.expiry, now).is_alive() {
                mutations.push(Mutation::Put {
                    key,
                    value,
                    expiry: fg.expiry,
                });
            }
        }
        let count = mutations.len();
        self.engine
            .write(move |_| Ok(mutations))
            .map_err(|e| annotate(e, "restore", count))?;
        info!("Restored {} records into {}", count, self.lifecycle.name());
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        redb_stats(&self.engine)
    }
}

impl Drop for RedbStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
