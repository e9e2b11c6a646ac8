//! Core type definitions for Strata
//!
//! A key maps to a [`FieldGroup`]: a sparse set of named fields sharing one
//! expiry. Writes are merge patches applied with [`FieldGroup::update`], reads
//! and deletes address a key plus an optional field selector ([`KeyGroup`]).

use crate::codec::put_uvarint;
use crate::error::{Error, Result};
use bytes::Bytes;
use derive_more::From;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Opaque storage key
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, From)]
pub struct Key {
    pub data: Bytes,
}

impl Key {
    /// Create a key from raw bytes
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Create a key scoped to a shard discriminator and a realm (tenant) id
    ///
    /// Layout: `{discriminator}{uvarint realm}{data}`.
    pub fn scoped(discriminator: u8, realm: u64, data: impl AsRef<[u8]>) -> Self {
        let data = data.as_ref();
        let mut buf = vec![0u8; 1 + 10 + data.len()];
        buf[0] = discriminator;
        let n = put_uvarint(&mut buf[1..], realm);
        buf.truncate(1 + n);
        buf.extend_from_slice(data);
        Self { data: buf.into() }
    }

    /// Get the raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Length of the raw key in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the key is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<&'static str> for Key {
    fn from(s: &'static str) -> Self {
        Self::new(s)
    }
}

impl From<Vec<u8>> for Key {
    fn from(v: Vec<u8>) -> Self {
        Self::new(v)
    }
}

/// Read / delete request unit: a key plus an optional field selector
///
/// `fields == None` addresses every field stored under the key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyGroup {
    pub prefix: Key,
    pub fields: Option<Vec<Bytes>>,
}

impl KeyGroup {
    /// Address every field of `key`
    pub fn all(key: impl Into<Key>) -> Self {
        Self {
            prefix: key.into(),
            fields: None,
        }
    }

    /// Address only the named fields of `key`
    pub fn fields<I, F>(key: impl Into<Key>, fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<Bytes>,
    {
        Self {
            prefix: key.into(),
            fields: Some(fields.into_iter().map(Into::into).collect()),
        }
    }

    /// Check if this group selects every field
    #[must_use]
    pub fn selects_all(&self) -> bool {
        self.fields.is_none()
    }
}

/// The (possibly partial) value stored under one key
///
/// `fields` and `values` are parallel vectors. `expiry` is unix seconds:
/// `0` never expires, a negative value in a patch leaves the stored expiry
/// unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldGroup {
    pub fields: Vec<Bytes>,
    pub values: Vec<Bytes>,
    pub expiry: i64,
}

impl FieldGroup {
    /// Create a field group from parallel vectors
    #[must_use]
    pub fn new(fields: Vec<Bytes>, values: Vec<Bytes>, expiry: i64) -> Self {
        Self {
            fields,
            values,
            expiry,
        }
    }

    /// Create a field group from (field, value) pairs
    pub fn from_pairs<I, F, V>(pairs: I, expiry: i64) -> Self
    where
        I: IntoIterator<Item = (F, V)>,
        F: Into<Bytes>,
        V: Into<Bytes>,
    {
        let (fields, values) = pairs
            .into_iter()
            .map(|(f, v)| (f.into(), v.into()))
            .unzip();
        Self {
            fields,
            values,
            expiry,
        }
    }

    /// Fields and values have the same length
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.fields.len() == self.values.len()
    }

    /// Return an error if the group is not valid
    pub fn check_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::InvalidFieldGroup {
                fields: self.fields.len(),
                values: self.values.len(),
            })
        }
    }

    /// Number of fields
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the group holds no fields
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Look up the value of a field
    #[must_use]
    pub fn get(&self, field: &[u8]) -> Option<&Bytes> {
        self.fields
            .iter()
            .position(|f| f.as_ref() == field)
            .map(|i| &self.values[i])
    }

    /// Iterate over (field, value) pairs
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.fields.iter().zip(self.values.iter())
    }

    /// Whether the group is still visible at `now`
    #[must_use]
    pub fn is_alive(&self, now: i64) -> bool {
        Liveness::of(self.expiry, now).is_alive()
    }

    /// Apply `other` as a merge patch
    ///
    /// Fields present in `other` overwrite (or are appended to) `self`, fields
    /// only in `self` are kept. Duplicate fields inside `other` collapse: the
    /// last value wins and the first position is kept. A non-negative
    /// `other.expiry` replaces `self.expiry`.
    pub fn update(&mut self, other: &FieldGroup) -> Result<()> {
        self.check_valid()?;
        other.check_valid()?;

        let mut patch: HashMap<&[u8], &Bytes> = HashMap::with_capacity(other.fields.len());
        for (field, value) in other.fields.iter().zip(&other.values) {
            patch.insert(field.as_ref(), value);
        }

        let mut written: HashSet<&[u8]> = HashSet::with_capacity(patch.len());
        for (field, value) in self.fields.iter().zip(self.values.iter_mut()) {
            if let Some((&name, &new_value)) = patch.get_key_value(field.as_ref()) {
                *value = new_value.clone();
                written.insert(name);
            }
        }

        if written.len() < patch.len() {
            let extra = patch.len() - written.len();
            self.fields.reserve(extra);
            self.values.reserve(extra);
            for field in &other.fields {
                if written.insert(field.as_ref()) {
                    self.fields.push(field.clone());
                    self.values.push(patch[field.as_ref()].clone());
                }
            }
        }

        if other.expiry >= 0 {
            self.expiry = other.expiry;
        }
        Ok(())
    }

    /// Keep only the named fields, preserving order
    pub fn select(&mut self, fields: &[Bytes]) {
        let wanted: HashSet<&[u8]> = fields.iter().map(AsRef::as_ref).collect();
        self.retain(|field| wanted.contains(field));
    }

    /// Remove the named fields, preserving the order of the survivors
    pub fn del(&mut self, fields: &[Bytes]) {
        let doomed: HashSet<&[u8]> = fields.iter().map(AsRef::as_ref).collect();
        self.retain(|field| !doomed.contains(field));
    }

    fn retain(&mut self, mut keep: impl FnMut(&[u8]) -> bool) {
        let fields = std::mem::take(&mut self.fields);
        let values = std::mem::take(&mut self.values);
        for (field, value) in fields.into_iter().zip(values) {
            if keep(&field) {
                self.fields.push(field);
                self.values.push(value);
            }
        }
    }
}

/// Visibility of a record relative to the current time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    /// Never expires
    Forever,
    /// Alive for this much longer
    ExpiresIn(Duration),
    /// Expiry is strictly in the past
    Expired,
}

impl Liveness {
    /// Classify `expiry` (unix seconds) at `now`
    #[must_use]
    pub fn of(expiry: i64, now: i64) -> Self {
        if expiry <= 0 {
            Self::Forever
        } else if expiry < now {
            Self::Expired
        } else {
            Self::ExpiresIn(Duration::from_secs((expiry - now) as u64))
        }
    }

    #[must_use]
    pub fn is_alive(self) -> bool {
        !matches!(self, Self::Expired)
    }
}

/// What a backend must do with one key after merging a write or delete
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WritePlan {
    /// Persist this record
    Put(FieldGroup),
    /// Physically remove the key
    Delete,
    /// Nothing stored, nothing to do
    Skip,
}

impl WritePlan {
    /// Plan a merge-patch write of `delta` over the currently stored record
    ///
    /// An expired stored record counts as absent. A merged record with no
    /// fields, or whose expiry has passed, becomes a delete.
    pub fn for_set(existing: Option<FieldGroup>, delta: &FieldGroup, now: i64) -> Result<Self> {
        let mut merged = existing
            .filter(|old| old.is_alive(now))
            .unwrap_or_default();
        merged.update(delta)?;
        if merged.is_empty() || !merged.is_alive(now) {
            Ok(Self::Delete)
        } else {
            Ok(Self::Put(merged))
        }
    }

    /// Plan the removal of `selector` (all fields when `None`) from the stored record
    #[must_use]
    pub fn for_delete(existing: Option<FieldGroup>, selector: Option<&[Bytes]>, now: i64) -> Self {
        let Some(mut old) = existing else {
            return Self::Skip;
        };
        let Some(fields) = selector else {
            return Self::Delete;
        };
        if !old.is_alive(now) {
            return Self::Delete;
        }
        old.del(fields);
        if old.is_empty() {
            Self::Delete
        } else {
            Self::Put(old)
        }
    }
}

/// Consolidate deltas addressed to the same key within one batch
///
/// Output keeps the first-occurrence order of keys; later deltas are applied
/// onto earlier ones with [`FieldGroup::update`].
pub fn merge_updates(keys: &[Key], deltas: &[FieldGroup]) -> Result<(Vec<Key>, Vec<FieldGroup>)> {
    if keys.len() != deltas.len() {
        return Err(Error::LengthMismatch {
            keys: keys.len(),
            deltas: deltas.len(),
        });
    }
    let mut index: HashMap<&Key, usize> = HashMap::with_capacity(keys.len());
    let mut out_keys = Vec::with_capacity(keys.len());
    let mut out_deltas: Vec<FieldGroup> = Vec::with_capacity(keys.len());
    for (i, (key, delta)) in keys.iter().zip(deltas).enumerate() {
        match index.get(key) {
            Some(&pos) => out_deltas[pos].update(delta).map_err(|e| e.at_item(i))?,
            None => {
                delta.check_valid().map_err(|e| e.at_item(i))?;
                index.insert(key, out_keys.len());
                out_keys.push(key.clone());
                out_deltas.push(delta.clone());
            }
        }
    }
    Ok((out_keys, out_deltas))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn fg(pairs: &[(&'static str, &'static str)], expiry: i64) -> FieldGroup {
        FieldGroup::from_pairs(pairs.iter().copied(), expiry)
    }

    fn names(fields: &[&'static str]) -> Vec<Bytes> {
        fields.iter().map(|f| Bytes::from_static(f.as_bytes())).collect()
    }

    #[test]
    fn test_update_overwrites_and_appends() {
        let mut v = fg(&[("a", "1"), ("b", "2")], 10);
        v.update(&fg(&[("b", "20"), ("c", "30")], -1)).unwrap();

        assert_eq!(v, fg(&[("a", "1"), ("b", "20"), ("c", "30")], 10));
    }

    #[test]
    fn test_update_expiry_rules() {
        let mut v = fg(&[("a", "1")], 10);
        v.update(&fg(&[], 0)).unwrap();
        assert_eq!(v.expiry, 0);

        v.update(&fg(&[], 99)).unwrap();
        assert_eq!(v.expiry, 99);

        v.update(&fg(&[], -5)).unwrap();
        assert_eq!(v.expiry, 99);
    }

    #[test]
    fn test_update_collapses_duplicate_patch_fields() {
        let mut v = fg(&[("a", "1")], 0);
        v.update(&fg(&[("x", "1"), ("a", "2"), ("x", "3")], 0))
            .unwrap();
        assert_eq!(v, fg(&[("a", "2"), ("x", "3")], 0));
    }

    #[test]
    fn test_update_rejects_invalid() {
        let mut v = fg(&[("a", "1")], 0);
        let bad = FieldGroup::new(names(&["a", "b"]), names(&["1"]), 0);
        let err = v.update(&bad).unwrap_err();
        assert!(matches!(err, Error::InvalidFieldGroup { fields: 2, values: 1 }));

        let mut bad = bad;
        assert!(bad.update(&fg(&[], 0)).is_err());
    }

    #[test]
    fn test_update_idempotent() {
        let v = fg(&[("a", "1"), ("b", "2"), ("c", "3")], 17);
        let mut w = v.clone();
        w.update(&v).unwrap();
        assert_eq!(w, v);
    }

    #[test]
    fn test_update_disjoint_patches_commute() {
        let base = fg(&[("a", "1"), ("b", "2")], 5);
        let p1 = fg(&[("a", "10"), ("x", "11")], -1);
        let p2 = fg(&[("b", "20"), ("y", "21")], -1);

        let mut left = base.clone();
        left.update(&p1).unwrap();
        left.update(&p2).unwrap();

        let mut right = base;
        right.update(&p2).unwrap();
        right.update(&p1).unwrap();

        let as_set = |v: &FieldGroup| v.iter().map(|(f, x)| (f.clone(), x.clone())).collect::<BTreeSet<_>>();
        assert_eq!(as_set(&left), as_set(&right));
        assert_eq!(left.expiry, right.expiry);
    }

    #[test]
    fn test_random_groups_obey_algebra() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let n = rng.gen_range(0..12);
            let mut v = FieldGroup::default();
            for i in 0..n {
                v.fields.push(Bytes::from(format!("f{i}")));
                v.values.push(Bytes::from(rng.r#gen::<u32>().to_string()));
            }
            v.expiry = rng.gen_range(0..1_000);

            let mut twice = v.clone();
            twice.update(&v).unwrap();
            assert_eq!(twice, v);

            let subset: Vec<Bytes> = v
                .fields
                .iter()
                .filter(|_| rng.gen_bool(0.5))
                .cloned()
                .collect();
            let mut selected = v.clone();
            selected.select(&subset);
            let mut remaining = v.clone();
            remaining.del(&subset);
            assert_eq!(selected.len() + remaining.len(), v.len());
            assert_eq!(selected.fields, subset);
        }
    }

    #[test]
    fn test_select_and_del_partition() {
        let v = fg(&[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")], 0);
        let subset = names(&["d", "b", "zz"]);

        let mut selected = v.clone();
        selected.select(&subset);
        assert_eq!(selected, fg(&[("b", "2"), ("d", "4")], 0));

        let mut remaining = v.clone();
        remaining.del(&subset);
        assert_eq!(remaining, fg(&[("a", "1"), ("c", "3")], 0));

        let left: BTreeSet<_> = selected.fields.iter().cloned().collect();
        let right: BTreeSet<_> = remaining.fields.iter().cloned().collect();
        assert!(left.is_disjoint(&right));
        let union: BTreeSet<_> = left.union(&right).cloned().collect();
        let original: BTreeSet<_> = v.fields.iter().cloned().collect();
        assert_eq!(union, original);
    }

    #[test]
    fn test_liveness() {
        assert_eq!(Liveness::of(0, 100), Liveness::Forever);
        assert_eq!(Liveness::of(-1, 100), Liveness::Forever);
        assert_eq!(Liveness::of(99, 100), Liveness::Expired);
        assert_eq!(Liveness::of(100, 100), Liveness::ExpiresIn(Duration::ZERO));
        assert_eq!(
            Liveness::of(160, 100),
            Liveness::ExpiresIn(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_plan_for_set() {
        let now = 1_000;
        let plan = WritePlan::for_set(None, &fg(&[("a", "1")], -1), now).unwrap();
        assert_eq!(plan, WritePlan::Put(fg(&[("a", "1")], 0)));

        let plan = WritePlan::for_set(Some(fg(&[("a", "1")], 0)), &fg(&[("b", "2")], 999), now)
            .unwrap();
        assert_eq!(plan, WritePlan::Delete);

        // an expired record does not leak fields into the new one
        let plan = WritePlan::for_set(Some(fg(&[("a", "1")], 5)), &fg(&[("b", "2")], 0), now)
            .unwrap();
        assert_eq!(plan, WritePlan::Put(fg(&[("b", "2")], 0)));

        let plan = WritePlan::for_set(None, &fg(&[], 0), now).unwrap();
        assert_eq!(plan, WritePlan::Delete);
    }

    #[test]
    fn test_plan_for_delete() {
        let now = 1_000;
        let stored = fg(&[("a", "1"), ("b", "2")], 0);
        let a = names(&["a"]);
        let ab = names(&["a", "b"]);

        assert_eq!(WritePlan::for_delete(None, Some(&a), now), WritePlan::Skip);
        assert_eq!(
            WritePlan::for_delete(Some(stored.clone()), None, now),
            WritePlan::Delete
        );
        assert_eq!(
            WritePlan::for_delete(Some(stored.clone()), Some(&a), now),
            WritePlan::Put(fg(&[("b", "2")], 0))
        );
        assert_eq!(
            WritePlan::for_delete(Some(stored), Some(&ab), now),
            WritePlan::Delete
        );
    }

    #[test]
    fn test_merge_updates_consolidates() {
        let keys = vec![Key::from("k"), Key::from("j"), Key::from("k")];
        let deltas = vec![
            fg(&[("hello", "world")], -1),
            fg(&[("x", "y")], 0),
            fg(&[("bonjour", "monde")], 7),
        ];
        let (keys, deltas) = merge_updates(&keys, &deltas).unwrap();
        assert_eq!(keys, vec![Key::from("k"), Key::from("j")]);
        assert_eq!(deltas[0], fg(&[("hello", "world"), ("bonjour", "monde")], 7));
        assert_eq!(deltas[1], fg(&[("x", "y")], 0));
    }

    #[test]
    fn test_merge_updates_length_mismatch() {
        let err = merge_updates(&[Key::from("k")], &[]).unwrap_err();
        assert!(matches!(err, Error::LengthMismatch { keys: 1, deltas: 0 }));
    }

    #[test]
    fn test_scoped_key_layout() {
        let key = Key::scoped(b'p', 300, b"user");
        assert_eq!(key.as_bytes(), &[b'p', 0xac, 0x02, b'u', b's', b'e', b'r']);
    }
}
