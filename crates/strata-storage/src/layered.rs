//! Cache + durable composition
//!
//! [`LayeredStore`] puts a volatile cache tier in front of a durable tier and
//! keeps the two eventually consistent:
//!
//! - **Read**: serve what the cache has, fetch the missing fields (or the
//!   whole record for an all-fields selector) from the durable tier, merge,
//!   and queue a fill for whatever the durable tier returned.
//! - **Write / delete**: invalidate the cache, commit to the durable tier,
//!   then queue a fill. A reader racing the write sees either the invalidated
//!   cache (and falls through to durable) or the post-write durable state.
//! - **Fill**: a single consumer thread batches requests by size or time,
//!   re-reads the durable tier and writes non-empty records into the cache.
//!   Groups the durable tier no longer has are invalidated instead; empty
//!   records are never cached. With `interval_ms = 0` fills run on the
//!   calling thread. Either way one fill runs at a time, from the durable
//!   re-read to the cache write, so an older read can never overwrite the
//!   fill of a later write.
//!
//! Durable errors fail the request. Fill errors are logged and dropped.

use crate::backend::Lifecycle;
use crate::store::{Store, StoreStats, check_lengths, teardown_allowed};
use bytes::Bytes;
use crossbeam_channel::{RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use strata_common::{Codec, Error, FieldGroup, FillConfig, Key, KeyGroup, Result};
use tracing::{debug, info, warn};

/// Re-reads the durable tier and republishes into the cache
struct Filler {
    store: String,
    cache: Arc<dyn Store>,
    durable: Arc<dyn Store>,
    /// Requests queued or in flight
    pending: AtomicUsize,
    /// Held from the durable re-read until the cache is updated
    serial: Mutex<()>,
}

impl Filler {
    fn fill(&self, groups: &[KeyGroup]) {
        let _serial = self.serial.lock();
        let found = match self.durable.get_many(groups) {
            Ok(found) => found,
            Err(e) => {
                warn!("{}: fill read of {} groups failed: {}", self.store, groups.len(), e);
                return;
            }
        };
        let mut keys = Vec::new();
        let mut records = Vec::new();
        let mut gone = Vec::new();
        for (group, fg) in groups.iter().zip(found) {
            if fg.is_empty() {
                gone.push(group.clone());
            } else {
                keys.push(group.prefix.clone());
                records.push(fg);
            }
        }
        if !keys.is_empty() {
            match self.cache.set_many(&keys, &records) {
                Ok(()) => debug!("{}: filled {} records", self.store, keys.len()),
                Err(e) => warn!("{}: fill write of {} records failed: {}", self.store, keys.len(), e),
            }
        }
        // An earlier fill may have raced the write that removed these
        if !gone.is_empty() {
            if let Err(e) = self.cache.del_many(&gone) {
                warn!("{}: fill invalidation of {} groups failed: {}", self.store, gone.len(), e);
            }
        }
    }
}

/// Fill request queue and its consumer
struct FillQueue {
    sender: Mutex<Option<Sender<KeyGroup>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl FillQueue {
    fn start(filler: Arc<Filler>, config: &FillConfig) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::bounded::<KeyGroup>(config.queue_capacity().max(1));
        let batch_size = config.batch_size.max(1);
        let interval = Duration::from_millis(config.interval_ms);

        let handle = thread::Builder::new()
            .name(format!("{}-fill", filler.store))
            .spawn(move || {
                debug!("Fill thread for {} started", filler.store);
                while let Ok(first) = receiver.recv() {
                    let mut batch = vec![first];
                    let deadline = Instant::now() + interval;
                    while batch.len() < batch_size {
                        match receiver.recv_deadline(deadline) {
                            Ok(group) => batch.push(group),
                            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                                break;
                            }
                        }
                    }
                    filler.fill(&batch);
                    filler.pending.fetch_sub(batch.len(), Ordering::AcqRel);
                }
                debug!("Fill thread for {} stopped", filler.store);
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Drain queued requests and join the consumer
    fn stop(&self) {
        drop(self.sender.lock().take());
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Why a fill is being queued
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FillCause {
    /// Opportunistic: dropped when the queue is full
    Read,
    /// Corrective: waits for queue space
    Write,
}

/// Store composed of a cache tier and a durable tier
pub struct LayeredStore {
    filler: Arc<Filler>,
    /// `None` fills synchronously inside the foreground call
    queue: Option<FillQueue>,
    lifecycle: Lifecycle,
}

impl LayeredStore {
    /// Compose `cache` in front of `durable`; both must share one codec
    pub fn new(
        name: &str,
        cache: Arc<dyn Store>,
        durable: Arc<dyn Store>,
        fill: &FillConfig,
        stats_interval: Option<Duration>,
    ) -> Result<Self> {
        if cache.codec() != durable.codec() {
            return Err(Error::configuration(format!(
                "cache codec {:?} differs from durable codec {:?}",
                cache.codec(),
                durable.codec()
            )));
        }
        let filler = Arc::new(Filler {
            store: name.to_string(),
            cache,
            durable,
            pending: AtomicUsize::new(0),
            serial: Mutex::new(()),
        });
        let queue = if fill.is_synchronous() {
            None
        } else {
            Some(FillQueue::start(Arc::clone(&filler), fill)?)
        };

        let lifecycle = Lifecycle::new(name);
        let stats_filler = Arc::clone(&filler);
        lifecycle.report(stats_interval, move || layered_stats(&stats_filler))?;

        info!(
            "Opened layered store {} ({} over {}, {} fill)",
            name,
            filler.cache.name(),
            filler.durable.name(),
            if queue.is_some() { "async" } else { "sync" }
        );
        Ok(Self {
            filler,
            queue,
            lifecycle,
        })
    }

    fn enqueue(&self, groups: Vec<KeyGroup>, cause: FillCause) {
        if groups.is_empty() {
            return;
        }
        let Some(queue) = &self.queue else {
            self.filler.fill(&groups);
            return;
        };
        let Some(sender) = queue.sender.lock().clone() else {
            return;
        };
        for group in groups {
            self.filler.pending.fetch_add(1, Ordering::AcqRel);
            let sent = match cause {
                FillCause::Write => sender.send(group).is_ok(),
                FillCause::Read => match sender.try_send(group) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!("{}: fill queue full, dropping read fill", self.name());
                        metrics::counter!("strata_layered_fill_dropped", "store" => self.name().to_string())
                            .increment(1);
                        false
                    }
                    Err(TrySendError::Disconnected(_)) => false,
                },
            };
            if !sent {
                self.filler.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Wait until every queued fill has been applied
    ///
    /// Returns false if fills are still pending after `timeout`.
    pub fn wait_for_fill(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.filler.pending.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// The cache tier
    pub fn cache(&self) -> &Arc<dyn Store> {
        &self.filler.cache
    }

    /// The durable tier
    pub fn durable(&self) -> &Arc<dyn Store> {
        &self.filler.durable
    }
}

fn layered_stats(filler: &Filler) -> StoreStats {
    StoreStats::new("layered")
        .with("fill_pending", filler.pending.load(Ordering::Acquire) as f64)
        .merged("cache", &filler.cache.stats())
        .merged("durable", &filler.durable.stats())
}

/// Fields of `group` the cache did not return, as a durable request
fn residual(group: &KeyGroup, cached: &FieldGroup) -> Option<KeyGroup> {
    let Some(wanted) = &group.fields else {
        // The cache may hold a partial record from an earlier field read
        return Some(group.clone());
    };
    let mut seen: HashSet<&[u8]> = HashSet::with_capacity(wanted.len());
    let missing: Vec<Bytes> = wanted
        .iter()
        .filter(|&f| cached.get(f).is_none() && seen.insert(f.as_ref()))
        .cloned()
        .collect();
    if missing.is_empty() {
        None
    } else {
        Some(KeyGroup {
            prefix: group.prefix.clone(),
            fields: Some(missing),
        })
    }
}

/// Cache entries a write must invalidate
fn invalidation(key: &Key, delta: &FieldGroup) -> KeyGroup {
    if delta.expiry > 0 {
        // A new finite expiry applies to fields the delta does not name
        KeyGroup::all(key.clone())
    } else {
        KeyGroup::fields(key.clone(), delta.fields.iter().cloned())
    }
}

impl Store for LayeredStore {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn codec(&self) -> Codec {
        self.filler.durable.codec()
    }

    fn get_many(&self, groups: &[KeyGroup]) -> Result<Vec<FieldGroup>> {
        self.lifecycle.check_open()?;
        let mut results = match self.filler.cache.get_many(groups) {
            Ok(found) => found,
            Err(e) => {
                warn!("{}: cache read failed, using durable tier: {}", self.name(), e);
                vec![FieldGroup::default(); groups.len()]
            }
        };

        let (positions, residuals): (Vec<usize>, Vec<KeyGroup>) = groups
            .iter()
            .zip(&results)
            .enumerate()
            .filter_map(|(i, (group, cached))| residual(group, cached).map(|r| (i, r)))
            .unzip();
        let hits = groups.len() - residuals.len();
        metrics::counter!("strata_layered_cache_hits", "store" => self.name().to_string())
            .increment(hits as u64);
        metrics::counter!("strata_layered_cache_misses", "store" => self.name().to_string())
            .increment(residuals.len() as u64);
        if residuals.is_empty() {
            return Ok(results);
        }

        let found = self.filler.durable.get_many(&residuals)?;
        let mut fills = Vec::with_capacity(residuals.len());
        for ((pos, group), fg) in positions.into_iter().zip(residuals).zip(found) {
            if group.selects_all() {
                results[pos] = fg;
            } else if !fg.is_empty() {
                results[pos].update(&fg)?;
            }
            if !results[pos].is_empty() {
                fills.push(group);
            }
        }
        self.enqueue(fills, FillCause::Read);
        Ok(results)
    }

    fn set_many(&self, keys: &[Key], deltas: &[FieldGroup]) -> Result<()> {
        self.lifecycle.check_open()?;
        check_lengths(keys, deltas)?;
        let targets: Vec<KeyGroup> = keys
            .iter()
            .zip(deltas)
            .map(|(key, delta)| invalidation(key, delta))
            .collect();
        self.filler.cache.del_many(&targets)?;
        self.filler.durable.set_many(keys, deltas)?;
        self.enqueue(targets, FillCause::Write);
        Ok(())
    }

    fn del_many(&self, groups: &[KeyGroup]) -> Result<()> {
        self.lifecycle.check_open()?;
        self.filler.cache.del_many(groups)?;
        self.filler.durable.del_many(groups)?;
        self.enqueue(groups.to_vec(), FillCause::Write);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if !self.lifecycle.close() {
            return Ok(());
        }
        if let Some(queue) = &self.queue {
            queue.stop();
        }
        let cache = self.filler.cache.close();
        self.filler.durable.close()?;
        cache
    }

    fn teardown(&self) -> Result<()> {
        if !teardown_allowed() {
            return Err(Error::TeardownForbidden);
        }
        self.close()?;
        self.filler.cache.teardown()?;
        self.filler.durable.teardown()
    }

    fn start_compaction(&self) -> Result<()> {
        self.lifecycle.check_open()?;
        self.filler.durable.start_compaction()
    }

    fn stop_compaction(&self) -> Result<()> {
        self.filler.durable.stop_compaction()
    }

    fn flush(&self) -> Result<()> {
        self.lifecycle.check_open()?;
        self.filler.durable.flush()
    }

    fn backup(&self, sink: &mut dyn Write, since: u64) -> Result<u64> {
        self.lifecycle.check_open()?;
        self.filler.durable.backup(sink, since)
    }

    fn restore(&self, source: &mut dyn Read) -> Result<()> {
        self.lifecycle.check_open()?;
        self.filler.durable.restore(source)
    }

    fn stats(&self) -> StoreStats {
        layered_stats(&self.filler)
    }
}

impl Drop for LayeredStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StoreOptions;
    use crate::backend::cache::CacheStore;
    use crate::backend::memory::MemoryStore;
    use strata_common::{CacheConfig, ManualClock, MemoryConfig, SharedClock};

    fn tiers(clock: &SharedClock) -> (Arc<dyn Store>, Arc<dyn Store>) {
        let cache = CacheStore::open(
            &CacheConfig { capacity: 64 },
            StoreOptions::new("cache", Arc::clone(clock)),
        )
        .unwrap();
        let durable = MemoryStore::open(
            &MemoryConfig { shards: 4 },
            StoreOptions::new("durable", Arc::clone(clock)),
        )
        .unwrap();
        (Arc::new(cache), Arc::new(durable))
    }

    fn layered(fill: FillConfig) -> LayeredStore {
        let clock: SharedClock = Arc::new(ManualClock::new(100));
        let (cache, durable) = tiers(&clock);
        LayeredStore::new("layered", cache, durable, &fill, None).unwrap()
    }

    fn async_fill() -> FillConfig {
        FillConfig {
            batch_size: 8,
            interval_ms: 2,
            queue_factor: 10,
        }
    }

    #[test]
    fn test_residual_selection() {
        let cached = FieldGroup::from_pairs([("a", "1")], 0);
        assert!(residual(&KeyGroup::fields("k", ["a"]), &cached).is_none());

        let r = residual(&KeyGroup::fields("k", ["a", "b", "b"]), &cached).unwrap();
        assert_eq!(r.fields.unwrap(), vec![Bytes::from_static(b"b")]);

        let r = residual(&KeyGroup::all("k"), &cached).unwrap();
        assert!(r.selects_all());
    }

    #[test]
    fn test_invalidation_scope() {
        let key = Key::from("k");
        let scoped = invalidation(&key, &FieldGroup::from_pairs([("a", "1")], 0));
        assert_eq!(scoped.fields.unwrap().len(), 1);
        assert!(invalidation(&key, &FieldGroup::from_pairs([("a", "1")], 500)).selects_all());
    }

    #[test]
    fn test_read_fills_cache() {
        let store = layered(async_fill());
        store
            .set_many(&[Key::from("k")], &[FieldGroup::from_pairs([("a", "1"), ("b", "2")], 0)])
            .unwrap();
        assert!(store.wait_for_fill(Duration::from_secs(5)));

        let cached = store.cache().get_many(&[KeyGroup::all("k")]).unwrap();
        assert_eq!(cached[0], FieldGroup::from_pairs([("a", "1"), ("b", "2")], 0));

        // Field reads are served from the cache alone
        let got = store.get_many(&[KeyGroup::fields("k", ["b"])]).unwrap();
        assert_eq!(got[0], FieldGroup::from_pairs([("b", "2")], 0));
    }

    #[test]
    fn test_write_invalidates_before_durable_commit() {
        let store = layered(FillConfig {
            interval_ms: 0,
            ..FillConfig::default()
        });
        store
            .set_many(&[Key::from("k")], &[FieldGroup::from_pairs([("a", "old")], 0)])
            .unwrap();
        // Stale entry planted directly in the cache
        store
            .cache()
            .set_many(&[Key::from("k")], &[FieldGroup::from_pairs([("a", "stale")], 0)])
            .unwrap();
        store
            .set_many(&[Key::from("k")], &[FieldGroup::from_pairs([("a", "new")], 0)])
            .unwrap();

        let cached = store.cache().get_many(&[KeyGroup::all("k")]).unwrap();
        assert_eq!(cached[0].get(b"a").unwrap().as_ref(), b"new");
    }

    #[test]
    fn test_delete_clears_both_tiers() {
        let store = layered(async_fill());
        store
            .set_many(&[Key::from("k")], &[FieldGroup::from_pairs([("a", "1"), ("b", "2")], 0)])
            .unwrap();
        store.get_many(&[KeyGroup::all("k")]).unwrap();
        assert!(store.wait_for_fill(Duration::from_secs(5)));

        store.del_many(&[KeyGroup::fields("k", ["a"])]).unwrap();
        let got = store.get_many(&[KeyGroup::all("k")]).unwrap();
        assert_eq!(got[0], FieldGroup::from_pairs([("b", "2")], 0));

        store.del_many(&[KeyGroup::all("k")]).unwrap();
        assert!(store.wait_for_fill(Duration::from_secs(5)));
        assert!(store.get_many(&[KeyGroup::all("k")]).unwrap()[0].is_empty());
        assert!(store.cache().get_many(&[KeyGroup::all("k")]).unwrap()[0].is_empty());
    }

    #[test]
    fn test_stats_merge_both_tiers() {
        let store = layered(async_fill());
        assert_eq!(store.codec(), Codec::V1);
        assert_eq!(store.stats().engine, "layered");
        assert!(store.stats().get("cache_capacity").is_some());
        assert!(store.stats().get("durable_entries").is_some());
    }

    #[test]
    fn test_close_drains_fill_queue() {
        let store = layered(FillConfig {
            batch_size: 1000,
            interval_ms: 50,
            queue_factor: 10,
        });
        let keys: Vec<Key> = (0..20).map(|i| Key::from(format!("k{i}").into_bytes())).collect();
        let deltas = vec![FieldGroup::from_pairs([("f", "v")], 0); 20];
        store.set_many(&keys, &deltas).unwrap();
        store.close().unwrap();
        assert_eq!(store.filler.pending.load(Ordering::Acquire), 0);
        assert!(matches!(store.get_many(&[KeyGroup::all("k0")]), Err(Error::Closed)));
    }

    #[test]
    fn test_cache_only_read_queues_no_fill() {
        let store = layered(FillConfig {
            batch_size: 1000,
            interval_ms: 200,
            queue_factor: 10,
        });
        store
            .cache()
            .set_many(&[Key::from("k")], &[FieldGroup::from_pairs([("a", "1")], 0)])
            .unwrap();
        let got = store.get_many(&[KeyGroup::fields("k", ["a"])]).unwrap();
        assert_eq!(got[0].get(b"a").unwrap().as_ref(), b"1");
        assert_eq!(store.filler.pending.load(Ordering::Acquire), 0);
    }

    /// Durable tier whose `pause_at`-th read blocks until the next write commits
    struct PausingStore {
        inner: Arc<dyn Store>,
        reads: AtomicUsize,
        pause_at: usize,
        paused: Mutex<bool>,
        resume: parking_lot::Condvar,
        entered: crossbeam_channel::Sender<()>,
    }

    impl Store for PausingStore {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn codec(&self) -> Codec {
            self.inner.codec()
        }

        fn get_many(&self, groups: &[KeyGroup]) -> Result<Vec<FieldGroup>> {
            let found = self.inner.get_many(groups)?;
            if self.reads.fetch_add(1, Ordering::AcqRel) + 1 == self.pause_at {
                let mut paused = self.paused.lock();
                *paused = true;
                let _ = self.entered.send(());
                while *paused {
                    self.resume.wait(&mut paused);
                }
            }
            Ok(found)
        }

        fn set_many(&self, keys: &[Key], deltas: &[FieldGroup]) -> Result<()> {
            self.inner.set_many(keys, deltas)?;
            *self.paused.lock() = false;
            self.resume.notify_all();
            Ok(())
        }

        fn del_many(&self, groups: &[KeyGroup]) -> Result<()> {
            self.inner.del_many(groups)
        }

        fn close(&self) -> Result<()> {
            self.inner.close()
        }

        fn teardown(&self) -> Result<()> {
            self.inner.teardown()
        }

        fn backup(&self, sink: &mut dyn Write, since: u64) -> Result<u64> {
            self.inner.backup(sink, since)
        }

        fn restore(&self, source: &mut dyn Read) -> Result<()> {
            self.inner.restore(source)
        }

        fn stats(&self) -> StoreStats {
            self.inner.stats()
        }
    }

    #[test]
    fn test_sync_fill_cannot_resurrect_older_read() {
        let clock: SharedClock = Arc::new(ManualClock::new(100));
        let (cache, inner) = tiers(&clock);
        let (entered, paused) = crossbeam_channel::bounded(1);
        // reads: 1 = fill of the first write, 2 = reader's durable read, 3 = reader's fill
        let durable = Arc::new(PausingStore {
            inner,
            reads: AtomicUsize::new(0),
            pause_at: 3,
            paused: Mutex::new(false),
            resume: parking_lot::Condvar::new(),
            entered,
        });
        let store = Arc::new(
            LayeredStore::new(
                "layered",
                cache,
                durable,
                &FillConfig {
                    interval_ms: 0,
                    ..FillConfig::default()
                },
                None,
            )
            .unwrap(),
        );
        store
            .set_many(&[Key::from("k")], &[FieldGroup::from_pairs([("a", "old")], 0)])
            .unwrap();

        let reader = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.get_many(&[KeyGroup::all("k")]).unwrap())
        };
        // the reader's fill has re-read `old` and is parked before the cache write
        paused.recv_timeout(Duration::from_secs(5)).unwrap();
        store
            .set_many(&[Key::from("k")], &[FieldGroup::from_pairs([("a", "new")], 0)])
            .unwrap();
        reader.join().unwrap();

        let cached = store.cache().get_many(&[KeyGroup::all("k")]).unwrap();
        assert_eq!(cached[0].get(b"a").unwrap().as_ref(), b"new");
        let got = store.get_many(&[KeyGroup::fields("k", ["a"])]).unwrap();
        assert_eq!(got[0].get(b"a").unwrap().as_ref(), b"new");
    }
}
