//! In-process store
//!
//! Records live in a fixed number of shards, each a `HashMap` behind its own
//! `RwLock`. The shard is chosen by an xxh64 hash of the encoded key. Writers
//! serialize on a commit lock for the read-merge-write; readers only take
//! shard read locks. Nothing survives the process.

use super::{
    Lifecycle, Mutation, RecordSource, StoreOptions, parallel_get, plan_del, plan_set,
};
use crate::backup::{BackupHeader, BackupReader, BackupWriter};
use crate::parallel::WorkerPool;
use crate::store::{Store, StoreStats, annotate, check_lengths, teardown_allowed};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::{
    Codec, Error, FieldGroup, Key, KeyGroup, Liveness, MemoryConfig, Result, ScratchPool,
    SharedClock,
};
use tracing::{debug, info};
use xxhash_rust::xxh64::xxh64;

pub(crate) struct Shards {
    shards: Vec<RwLock<HashMap<Bytes, Bytes>>>,
    /// Sum of encoded key and value sizes
    raw_bytes: AtomicU64,
    entries: AtomicU64,
    /// Bumped on every applied batch; used as the backup marker
    version: AtomicU64,
}

impl Shards {
    pub(crate) fn new(count: usize) -> Self {
        let count = count.max(1);
        Self {
            shards: (0..count).map(|_| RwLock::new(HashMap::new())).collect(),
            raw_bytes: AtomicU64::new(0),
            entries: AtomicU64::new(0),
            version: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &[u8]) -> &RwLock<HashMap<Bytes, Bytes>> {
        let idx = (xxh64(key, 0) % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.shard(key).read().get(key).cloned()
    }

    pub(crate) fn apply(&self, mutations: Vec<Mutation>) {
        if mutations.is_empty() {
            return;
        }
        for m in mutations {
            match m {
                Mutation::Put { key, value, .. } => {
                    let added = (key.len() + value.len()) as u64;
                    let old = self.shard(&key).write().insert(key.clone(), value);
                    match old {
                        Some(old) => {
                            self.raw_bytes.fetch_sub(old.len() as u64, Ordering::Relaxed);
                            self.raw_bytes
                                .fetch_add(added - key.len() as u64, Ordering::Relaxed);
                        }
                        None => {
                            self.raw_bytes.fetch_add(added, Ordering::Relaxed);
                            self.entries.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Mutation::Delete { key } => {
                    if let Some(old) = self.shard(&key).write().remove(&key) {
                        self.raw_bytes
                            .fetch_sub((key.len() + old.len()) as u64, Ordering::Relaxed);
                        self.entries.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            }
        }
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Live records, removing the ones expired at `now`
    pub(crate) fn dump(&self, codec: Codec, now: i64) -> Result<Vec<(Bytes, Bytes)>> {
        let mut out = Vec::new();
        let mut swept = 0u64;
        for shard in &self.shards {
            let mut map = shard.write();
            let mut expired = Vec::new();
            for (key, value) in map.iter() {
                let (fg, _) = codec.decode_val(value, true)?;
                if Liveness::of(fg.expiry, now).is_alive() {
                    out.push((key.clone(), value.clone()));
                } else {
                    expired.push(key.clone());
                }
            }
            for key in expired {
                if let Some(old) = map.remove(&key) {
                    self.raw_bytes
                        .fetch_sub((key.len() + old.len()) as u64, Ordering::Relaxed);
                    self.entries.fetch_sub(1, Ordering::Relaxed);
                    swept += 1;
                }
            }
        }
        if swept > 0 {
            debug!("Swept {} expired records", swept);
        }
        Ok(out)
    }

    pub(crate) fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
        self.raw_bytes.store(0, Ordering::Relaxed);
        self.entries.store(0, Ordering::Relaxed);
    }

    fn stats(&self) -> StoreStats {
        StoreStats::new("memory")
            .with("entries", self.entries.load(Ordering::Relaxed) as f64)
            .with("raw_bytes", self.raw_bytes.load(Ordering::Relaxed) as f64)
            .with("shards", self.shards.len() as f64)
    }
}

impl RecordSource for Shards {
    fn read_batch(&self, keys: &[Bytes]) -> Result<Vec<Option<Bytes>>> {
        Ok(keys.iter().map(|key| self.get(key)).collect())
    }
}

/// Field-group store held entirely in memory
pub struct MemoryStore {
    shards: Arc<Shards>,
    pool: WorkerPool,
    batch_size: usize,
    codec: Codec,
    clock: SharedClock,
    commit: Mutex<()>,
    scratch: ScratchPool,
    lifecycle: Lifecycle,
}

impl MemoryStore {
    pub fn open(config: &MemoryConfig, options: StoreOptions) -> Result<Self> {
        let shards = Arc::new(Shards::new(config.shards));
        let pool = WorkerPool::new(options.name.as_str(), options.pool.workers)?;
        let lifecycle = Lifecycle::new(&options.name);

        let stats_shards = Arc::clone(&shards);
        lifecycle.report(options.stats_interval, move || stats_shards.stats())?;

        info!(
            "Opened memory store {} with {} shards",
            options.name, config.shards
        );
        Ok(Self {
            shards,
            pool,
            batch_size: options.pool.batch_size,
            codec: options.codec,
            clock: options.clock,
            commit: Mutex::new(()),
            scratch: ScratchPool::default(),
            lifecycle,
        })
    }
}

impl Store for MemoryStore {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn codec(&self) -> Codec {
        self.codec
    }

    fn get_many(&self, groups: &[KeyGroup]) -> Result<Vec<FieldGroup>> {
        self.lifecycle.check_open()?;
        parallel_get(
            &self.shards,
            None,
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
        let mutations = plan_set(self.codec, &self.scratch, keys, deltas, now, |key| {
            Ok(self.shards.get(key))
        })
        .map_err(|e| annotate(e, "set_many", keys.len()))?;
        self.shards.apply(mutations);
        Ok(())
    }

    fn del_many(&self, groups: &[KeyGroup]) -> Result<()> {
        self.lifecycle.check_open()?;
        let _commit = self.commit.lock();
        let now = self.clock.now();
        let mutations = plan_del(self.codec, &self.scratch, groups, now, |key| {
            Ok(self.shards.get(key))
        })
        .map_err(|e| annotate(e, "del_many", groups.len()))?;
        self.shards.apply(mutations);
        Ok(())
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
        self.shards.clear();
        Ok(())
    }

    fn backup(&self, sink: &mut dyn Write, since: u64) -> Result<u64> {
        self.lifecycle.check_open()?;
        let (marker, records) = {
            let _commit = self.commit.lock();
            let records = self
                .shards
                .dump(self.codec, self.clock.now())
                .map_err(|e| annotate(e, "backup", 0))?;
            (self.shards.version.load(Ordering::Acquire), records)
        };
        let mut writer = BackupWriter::start(sink, BackupHeader { since, marker })?;
        for (key, value) in &records {
            writer.record(key, value)?;
        }
        writer.finish()?;
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
        let _commit = self.commit.lock();
        self.shards.apply(mutations);
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        self.shards.stats()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::ManualClock;

    fn store(clock: Arc<ManualClock>) -> MemoryStore {
        MemoryStore::open(&MemoryConfig { shards: 4 }, StoreOptions::new("mem", clock)).unwrap()
    }

    #[test]
    fn test_memory_raw_size_accounting() {
        let store = store(Arc::new(ManualClock::new(0)));
        store
            .set_many(&[Key::from("k")], &[FieldGroup::from_pairs([("a", "1")], 0)])
            .unwrap();
        let first = store.stats().get("raw_bytes").unwrap();
        assert!(first > 0.0);

        store
            .set_many(&[Key::from("k")], &[FieldGroup::from_pairs([("b", "22")], 0)])
            .unwrap();
        assert!(store.stats().get("raw_bytes").unwrap() > first);
        assert_eq!(store.stats().get("entries"), Some(1.0));

        store.del_many(&[KeyGroup::all("k")]).unwrap();
        assert_eq!(store.stats().get("raw_bytes"), Some(0.0));
        assert_eq!(store.stats().get("entries"), Some(0.0));
    }

    #[test]
    fn test_memory_backup_sweeps_expired() {
        let clock = Arc::new(ManualClock::new(100));
        let source = store(Arc::clone(&clock));
        source
            .set_many(
                &[Key::from("short"), Key::from("long")],
                &[
                    FieldGroup::from_pairs([("a", "1")], 150),
                    FieldGroup::from_pairs([("a", "2")], 0),
                ],
            )
            .unwrap();
        clock.set(200);

        let mut stream = Vec::new();
        source.backup(&mut stream, 0).unwrap();
        assert_eq!(source.stats().get("entries"), Some(1.0));

        let target = store(clock);
        target.restore(&mut stream.as_slice()).unwrap();
        let got = target
            .get_many(&[KeyGroup::all("short"), KeyGroup::all("long")])
            .unwrap();
        assert!(got[0].is_empty());
        assert_eq!(got[1].get(b"a").unwrap().as_ref(), b"2");
    }

    #[test]
    fn test_memory_teardown_clears() {
        let store = store(Arc::new(ManualClock::new(0)));
        store
            .set_many(&[Key::from("k")], &[FieldGroup::from_pairs([("a", "1")], 0)])
            .unwrap();
        store.teardown().unwrap();
        assert_eq!(store.stats().get("entries"), Some(0.0));
        assert!(matches!(store.get_many(&[KeyGroup::all("k")]), Err(Error::Closed)));
    }
}
