//! Behavior every [`Store`] must share
//!
//! Each scenario runs against a fresh store built by a factory closure, for
//! every engine and for the layered composition.

use crate::backend::StoreOptions;
use crate::backend::cache::CacheStore;
use crate::backend::memory::MemoryStore;
use crate::backend::native::NativeStore;
use crate::backend::redb::RedbStore;
use crate::layered::LayeredStore;
use crate::store::{Store, StoreStats};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use strata_common::{
    CacheConfig, Error, FieldGroup, FillConfig, Key, KeyGroup, ManualClock, MemoryConfig,
    NativeConfig, PoolConfig, RedbConfig, SharedClock,
};
use tempfile::TempDir;

const START: i64 = 1_700_000_000;

struct Subject {
    store: Arc<dyn Store>,
    layered: Option<Arc<LayeredStore>>,
    clock: Arc<ManualClock>,
    _dir: TempDir,
}

impl Subject {
    /// Let pending cache fills land
    fn settle(&self) {
        if let Some(layered) = &self.layered {
            assert!(layered.wait_for_fill(Duration::from_secs(5)));
        }
    }

    fn set(&self, key: &'static str, pairs: &[(&'static str, &'static str)], expiry: i64) {
        self.store
            .set_many(&[Key::from(key)], &[FieldGroup::from_pairs(pairs.iter().copied(), expiry)])
            .unwrap();
    }

    fn get_all(&self, key: &'static str) -> FieldGroup {
        self.store.get_many(&[KeyGroup::all(key)]).unwrap().remove(0)
    }

    fn stored_entries(&self) -> f64 {
        self.settle();
        entries(&self.store.stats())
    }
}

/// Records held across all tiers
fn entries(stats: &StoreStats) -> f64 {
    stats
        .metrics
        .iter()
        .filter(|(name, _)| name == "entries" || name.ends_with("_entries"))
        .map(|(_, v)| *v)
        .sum()
}

fn options(name: &str, clock: &Arc<ManualClock>) -> StoreOptions {
    let clock: SharedClock = Arc::clone(clock) as SharedClock;
    StoreOptions {
        pool: PoolConfig {
            workers: 4,
            batch_size: 4,
            missing_keys: 64,
        },
        ..StoreOptions::new(name, clock)
    }
}

type Factory = fn(&Path, &Arc<ManualClock>) -> (Arc<dyn Store>, Option<Arc<LayeredStore>>);

fn native(dir: &Path, clock: &Arc<ManualClock>) -> (Arc<dyn Store>, Option<Arc<LayeredStore>>) {
    let config = NativeConfig {
        sync_on_write: false,
        background_compaction: false,
        ..NativeConfig::with_data_dir(dir.join("native"))
    };
    (Arc::new(NativeStore::open(config, options("native", clock)).unwrap()), None)
}

fn redb_file(dir: &Path, clock: &Arc<ManualClock>) -> (Arc<dyn Store>, Option<Arc<LayeredStore>>) {
    let config = RedbConfig {
        path: dir.join("strata.redb"),
    };
    (Arc::new(RedbStore::open(config, options("redb", clock)).unwrap()), None)
}

fn memory(_: &Path, clock: &Arc<ManualClock>) -> (Arc<dyn Store>, Option<Arc<LayeredStore>>) {
    let config = MemoryConfig { shards: 8 };
    (Arc::new(MemoryStore::open(&config, options("memory", clock)).unwrap()), None)
}

fn cache(_: &Path, clock: &Arc<ManualClock>) -> (Arc<dyn Store>, Option<Arc<LayeredStore>>) {
    let config = CacheConfig { capacity: 1024 };
    (Arc::new(CacheStore::open(&config, options("cache", clock)).unwrap()), None)
}

fn layered_with(
    dir: &Path,
    clock: &Arc<ManualClock>,
    fill: &FillConfig,
) -> (Arc<dyn Store>, Option<Arc<LayeredStore>>) {
    let (front, _) = cache(dir, clock);
    let (back, _) = native(dir, clock);
    let store = Arc::new(LayeredStore::new("layered", front, back, fill, None).unwrap());
    (Arc::clone(&store) as Arc<dyn Store>, Some(store))
}

fn layered_async(dir: &Path, clock: &Arc<ManualClock>) -> (Arc<dyn Store>, Option<Arc<LayeredStore>>) {
    let fill = FillConfig {
        batch_size: 16,
        interval_ms: 5,
        queue_factor: 10,
    };
    layered_with(dir, clock, &fill)
}

fn layered_sync(dir: &Path, clock: &Arc<ManualClock>) -> (Arc<dyn Store>, Option<Arc<LayeredStore>>) {
    let fill = FillConfig {
        interval_ms: 0,
        ..FillConfig::default()
    };
    layered_with(dir, clock, &fill)
}

fn subject(factory: Factory) -> Subject {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(START));
    let (store, layered) = factory(dir.path(), &clock);
    Subject {
        store,
        layered,
        clock,
        _dir: dir,
    }
}

fn scenario_basic_positional(factory: Factory) {
    let s = subject(factory);
    s.set("a", &[("x", "1")], 0);
    s.set("b", &[("y", "2")], 0);

    let got = s
        .store
        .get_many(&[KeyGroup::all("b"), KeyGroup::all("missing"), KeyGroup::all("a")])
        .unwrap();
    assert_eq!(got.len(), 3);
    assert_eq!(got[0], FieldGroup::from_pairs([("y", "2")], 0));
    assert!(got[1].is_empty());
    assert_eq!(got[2], FieldGroup::from_pairs([("x", "1")], 0));
}

fn scenario_user_profile(factory: Factory) {
    let s = subject(factory);
    s.set("u123", &[("city", "SF")], 0);
    s.set("u123", &[("age", "30")], -1);
    assert_eq!(
        s.get_all("u123"),
        FieldGroup::from_pairs([("city", "SF"), ("age", "30")], 0)
    );

    s.store
        .del_many(&[KeyGroup::fields("u123", ["city"])])
        .unwrap();
    assert_eq!(s.get_all("u123"), FieldGroup::from_pairs([("age", "30")], 0));

    s.store
        .del_many(&[KeyGroup::fields("u123", ["age"])])
        .unwrap();
    assert!(s.get_all("u123").is_empty());
    assert_eq!(s.stored_entries(), 0.0);
}

fn scenario_selected_fields(factory: Factory) {
    let s = subject(factory);
    s.set("k", &[("a", "1"), ("b", "2"), ("c", "3")], 0);

    let got = s
        .store
        .get_many(&[KeyGroup::fields("k", ["c", "nope", "a"])])
        .unwrap();
    assert_eq!(got[0].len(), 2);
    assert_eq!(got[0].get(b"a").unwrap().as_ref(), b"1");
    assert_eq!(got[0].get(b"c").unwrap().as_ref(), b"3");
    assert!(got[0].get(b"nope").is_none());

    // Field reads before and after an all-fields read agree
    s.settle();
    let got = s.store.get_many(&[KeyGroup::fields("k", ["b"])]).unwrap();
    assert_eq!(got[0], FieldGroup::from_pairs([("b", "2")], 0));
    assert_eq!(s.get_all("k").len(), 3);
}

fn scenario_ttl(factory: Factory) {
    let s = subject(factory);
    s.set("k", &[("a", "1")], START + 10);
    assert_eq!(s.get_all("k").expiry, START + 10);

    // Expiry is inclusive of the expiry second itself
    s.clock.set(START + 10);
    assert!(!s.get_all("k").is_empty());

    s.clock.set(START + 11);
    assert!(s.get_all("k").is_empty());

    // An expired record does not leak fields into a new write
    s.set("k", &[("b", "2")], 0);
    assert_eq!(s.get_all("k"), FieldGroup::from_pairs([("b", "2")], 0));
}

fn scenario_expired_delta_tombstones(factory: Factory) {
    let s = subject(factory);
    s.set("k", &[("a", "1")], 0);
    s.set("k", &[("b", "2")], START - 1);
    assert!(s.get_all("k").is_empty());
    assert_eq!(s.stored_entries(), 0.0);
}

fn scenario_large_batch(factory: Factory) {
    let s = subject(factory);
    let keys: Vec<Key> = (0..65)
        .map(|i| Key::from(format!("key-{i:03}").into_bytes()))
        .collect();
    let deltas: Vec<FieldGroup> = (0..65)
        .map(|i| FieldGroup::from_pairs([("n", format!("{i}"))], 0))
        .collect();
    s.store.set_many(&keys, &deltas).unwrap();

    let groups: Vec<KeyGroup> = keys.iter().rev().cloned().map(KeyGroup::all).collect();
    let got = s.store.get_many(&groups).unwrap();
    assert_eq!(got.len(), 65);
    for (i, fg) in got.iter().enumerate() {
        let expected = format!("{}", 64 - i);
        assert_eq!(fg.get(b"n").unwrap().as_ref(), expected.as_bytes());
    }
}

fn scenario_batch_consolidation(factory: Factory) {
    let s = subject(factory);
    s.store
        .set_many(
            &[Key::from("k"), Key::from("other"), Key::from("k")],
            &[
                FieldGroup::from_pairs([("a", "1")], 0),
                FieldGroup::from_pairs([("z", "9")], 0),
                FieldGroup::from_pairs([("a", "2"), ("b", "3")], -1),
            ],
        )
        .unwrap();
    assert_eq!(s.get_all("k"), FieldGroup::from_pairs([("a", "2"), ("b", "3")], 0));

    s.store
        .del_many(&[KeyGroup::fields("k", ["a"]), KeyGroup::fields("k", ["b"])])
        .unwrap();
    assert!(s.get_all("k").is_empty());
    assert!(!s.get_all("other").is_empty());
}

fn scenario_misuse(factory: Factory) {
    let s = subject(factory);
    let err = s
        .store
        .set_many(&[Key::from("k")], &[])
        .unwrap_err();
    assert!(matches!(err, Error::LengthMismatch { keys: 1, deltas: 0 }));

    // Deleting what is not there is not an error
    s.store
        .del_many(&[KeyGroup::all("absent"), KeyGroup::fields("absent", ["f"])])
        .unwrap();

    let invalid = FieldGroup::new(vec!["a".into(), "b".into()], vec!["1".into()], 0);
    assert!(s.store.set_many(&[Key::from("k")], &[invalid]).is_err());
    assert!(s.get_all("k").is_empty());
}

fn scenario_concurrent_merges(factory: Factory) {
    let s = subject(factory);
    let writers: Vec<_> = (0..8)
        .map(|w| {
            let store = Arc::clone(&s.store);
            thread::spawn(move || {
                for f in 0..10 {
                    let field = format!("w{w}-f{f}");
                    store
                        .set_many(
                            &[Key::from("shared")],
                            &[FieldGroup::from_pairs([(field, "v")], 0)],
                        )
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    assert_eq!(s.get_all("shared").len(), 80);
}

fn scenario_closed(factory: Factory) {
    let s = subject(factory);
    s.store.close().unwrap();
    s.store.close().unwrap();
    assert!(matches!(
        s.store.get_many(&[KeyGroup::all("k")]),
        Err(Error::Closed)
    ));
    assert!(matches!(
        s.store.set_many(&[Key::from("k")], &[FieldGroup::default()]),
        Err(Error::Closed)
    ));
}

fn run_all(factory: Factory) {
    scenario_basic_positional(factory);
    scenario_user_profile(factory);
    scenario_selected_fields(factory);
    scenario_ttl(factory);
    scenario_expired_delta_tombstones(factory);
    scenario_large_batch(factory);
    scenario_batch_consolidation(factory);
    scenario_misuse(factory);
    scenario_concurrent_merges(factory);
    scenario_closed(factory);
}

#[test]
fn test_native_conformance() {
    run_all(native);
}

#[test]
fn test_redb_conformance() {
    run_all(redb_file);
}

#[test]
fn test_memory_conformance() {
    run_all(memory);
}

#[test]
fn test_cache_conformance() {
    run_all(cache);
}

#[test]
fn test_layered_conformance() {
    run_all(layered_async);
}

#[test]
fn test_layered_sync_fill_conformance() {
    run_all(layered_sync);
}

#[test]
fn test_layered_read_after_write_before_fill() {
    let s = subject(layered_async);
    for round in 0..50 {
        let value = format!("{round}");
        s.store
            .set_many(&[Key::from("k")], &[FieldGroup::from_pairs([("v", value.clone())], 0)])
            .unwrap();
        let got = s.get_all("k");
        assert_eq!(got.get(b"v").unwrap().as_ref(), value.as_bytes());
    }
    s.settle();
    let layered = s.layered.as_ref().unwrap();
    let cached = layered.cache().get_many(&[KeyGroup::all("k")]).unwrap();
    assert_eq!(cached[0].get(b"v").unwrap().as_ref(), b"49");
}

#[test]
fn test_teardown_in_test_builds() {
    let factories: [Factory; 5] = [native, redb_file, memory, cache, layered_async];
    for factory in factories {
        let s = subject(factory);
        s.set("k", &[("a", "1")], 0);
        s.store.teardown().unwrap();
        assert!(matches!(
            s.store.get_many(&[KeyGroup::all("k")]),
            Err(Error::Closed)
        ));
    }
}
