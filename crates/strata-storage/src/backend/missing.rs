//! Negative lookup cache
//!
//! Disk-backed engines remember encoded keys that read as absent so repeated
//! lookups of missing keys skip storage. Entries are evicted oldest first.
//!
//! Writers call [`MissingKeys::invalidate`] for the keys they create both
//! before and after the commit. Every invalidation bumps an epoch, and a
//! reader only records a miss if no invalidation happened since it started,
//! so a miss observed before a commit can never outlive it.

use super::RecordSource;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use strata_common::Result;

struct Inner {
    epoch: u64,
    keys: HashSet<Bytes>,
    order: VecDeque<Bytes>,
    hits: u64,
}

/// Bounded set of keys known to be absent
pub(crate) struct MissingKeys {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl MissingKeys {
    /// `None` when `capacity` is zero
    pub(crate) fn new(capacity: usize) -> Option<Self> {
        (capacity > 0).then(|| Self {
            capacity,
            inner: Mutex::new(Inner {
                epoch: 0,
                keys: HashSet::new(),
                order: VecDeque::new(),
                hits: 0,
            }),
        })
    }

    /// Current invalidation epoch, taken before a read starts
    pub(crate) fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// Read `keys` from `source`, skipping keys known to be absent
    ///
    /// Misses are recorded only if nothing was invalidated since `epoch`.
    pub(crate) fn read_through<S: RecordSource + ?Sized>(
        &self,
        source: &S,
        keys: &[Bytes],
        epoch: u64,
    ) -> Result<Vec<Option<Bytes>>> {
        let (wanted, positions): (Vec<Bytes>, Vec<usize>) = {
            let mut inner = self.inner.lock();
            let mut wanted = Vec::with_capacity(keys.len());
            let mut positions = Vec::with_capacity(keys.len());
            for (i, key) in keys.iter().enumerate() {
                if inner.keys.contains(key) {
                    inner.hits += 1;
                } else {
                    wanted.push(key.clone());
                    positions.push(i);
                }
            }
            (wanted, positions)
        };

        let mut out = vec![None; keys.len()];
        if wanted.is_empty() {
            return Ok(out);
        }
        let found = source.read_batch(&wanted)?;

        let mut inner = self.inner.lock();
        let record = inner.epoch == epoch;
        for ((key, pos), value) in wanted.into_iter().zip(positions).zip(found) {
            match value {
                Some(value) => out[pos] = Some(value),
                None if record => self.insert(&mut inner, key),
                None => {}
            }
        }
        Ok(out)
    }

    fn insert(&self, inner: &mut Inner, key: Bytes) {
        if !inner.keys.insert(key.clone()) {
            return;
        }
        inner.order.push_back(key);
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.keys.remove(&oldest);
            }
        }
    }

    /// Forget `keys` and start a new epoch
    pub(crate) fn invalidate<'a>(&self, keys: impl IntoIterator<Item = &'a Bytes>) {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        for key in keys {
            inner.keys.remove(key);
        }
    }

    /// Keys currently remembered
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().keys.len()
    }

    /// Lookups answered without touching storage
    pub(crate) fn hits(&self) -> u64 {
        self.inner.lock().hits
    }
}
