//! Bounded in-process cache tier
//!
//! Records are kept in an [`ArcCache`] sized by entry count. Reads promote and
//! drop expired entries; writes plan against the cached record without
//! touching recency. The cache is volatile and refuses backup and restore.

use super::arc::ArcCache;
use super::{Lifecycle, Mutation, RecordSource, StoreOptions, parallel_get, plan_del, plan_set};
use crate::parallel::WorkerPool;
use crate::store::{Store, StoreStats, annotate, check_lengths, teardown_allowed};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use strata_common::{
    CacheConfig, Codec, Error, FieldGroup, Key, KeyGroup, Result, ScratchPool, SharedClock,
};
use tracing::info;

struct CacheTier {
    arc: ArcCache,
    clock: SharedClock,
}

impl CacheTier {
    fn apply(&self, mutations: Vec<Mutation>) {
        for m in mutations {
            match m {
                Mutation::Put { key, value, expiry } => self.arc.put(key, value, expiry),
                Mutation::Delete { key } => {
                    self.arc.remove(&key);
                }
            }
        }
    }

    fn stats(&self) -> StoreStats {
        let stats = self.arc.stats();
        StoreStats::new("cache")
            .with("entries", self.arc.len() as f64)
            .with("capacity", self.arc.capacity() as f64)
            .with("hits", stats.hits.load(Ordering::Relaxed) as f64)
            .with("misses", stats.misses.load(Ordering::Relaxed) as f64)
            .with("evictions", stats.evictions.load(Ordering::Relaxed) as f64)
            .with("expirations", stats.expirations.load(Ordering::Relaxed) as f64)
            .with("hit_ratio", stats.hit_ratio())
    }
}

impl RecordSource for CacheTier {
    fn read_batch(&self, keys: &[Bytes]) -> Result<Vec<Option<Bytes>>> {
        let now = self.clock.now();
        Ok(keys.iter().map(|key| self.arc.get(key, now)).collect())
    }
}

/// Field-group store backed by an adaptive replacement cache
pub struct CacheStore {
    tier: Arc<CacheTier>,
    pool: WorkerPool,
    batch_size: usize,
    codec: Codec,
    clock: SharedClock,
    commit: Mutex<()>,
    scratch: ScratchPool,
    lifecycle: Lifecycle,
}

impl CacheStore {
    pub fn open(config: &CacheConfig, options: StoreOptions) -> Result<Self> {
        let tier = Arc::new(CacheTier {
            arc: ArcCache::new(config.capacity),
            clock: Arc::clone(&options.clock),
        });
        let pool = WorkerPool::new(options.name.as_str(), options.pool.workers)?;
        let lifecycle = Lifecycle::new(&options.name);

        let stats_tier = Arc::clone(&tier);
        lifecycle.report(options.stats_interval, move || stats_tier.stats())?;

        info!(
            "Opened cache store {} with capacity {}",
            options.name, config.capacity
        );
        Ok(Self {
            tier,
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

impl Store for CacheStore {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn codec(&self) -> Codec {
        self.codec
    }

    fn get_many(&self, groups: &[KeyGroup]) -> Result<Vec<FieldGroup>> {
        self.lifecycle.check_open()?;
        parallel_get(
            &self.tier,
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
            Ok(self.tier.arc.peek(key))
        })
        .map_err(|e| annotate(e, "set_many", keys.len()))?;
        self.tier.apply(mutations);
        Ok(())
    }

    fn del_many(&self, groups: &[KeyGroup]) -> Result<()> {
        self.lifecycle.check_open()?;
        let _commit = self.commit.lock();
        let now = self.clock.now();
        let mutations = plan_del(self.codec, &self.scratch, groups, now, |key| {
            Ok(self.tier.arc.peek(key))
        })
        .map_err(|e| annotate(e, "del_many", groups.len()))?;
        self.tier.apply(mutations);
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
        self.tier.arc.clear();
        Ok(())
    }

    fn backup(&self, _sink: &mut dyn Write, _since: u64) -> Result<u64> {
        Err(Error::not_implemented("backup on cache store"))
    }

    fn restore(&self, _source: &mut dyn Read) -> Result<()> {
        Err(Error::not_implemented("restore on cache store"))
    }

    fn stats(&self) -> StoreStats {
        self.tier.stats()
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
