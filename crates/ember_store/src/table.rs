//! Bucketed prime table with per-bucket versions and cursor traversal.
//!
//! Versions implement the snapshot protocol used by the restore streamer: a
//! snapshot registers at version `V`; any bucket whose version is below `V`
//! has not been captured yet, and a mutation touching it must be preceded by
//! a change notification so the snapshotter can serialize the bucket first.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use bytes::Bytes;

use crate::value::PrimeValue;

pub type DbIndex = u16;

/// Hash a key for bucket selection. Unkeyed so hashes are stable across the
/// lifetime of the process (cool records and defrag rely on this).
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

const INITIAL_BUCKETS: usize = 16;
const BUCKET_SPLIT_LEN: usize = 8;

#[derive(Default)]
struct Bucket {
    version: u64,
    entries: Vec<(Bytes, PrimeValue)>,
}

/// Traversal cursor. `Cursor::default()` starts a traversal; `is_done` turns
/// true once the traversal wrapped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cursor(u64);

impl Cursor {
    pub fn is_done(&self) -> bool {
        self.0 == 0
    }

    fn bucket(&self) -> usize {
        (self.0.saturating_sub(1)) as usize
    }
}

/// A change about to land in the table, dispatched to snapshotters before the
/// mutation is applied.
#[derive(Clone, Debug)]
pub enum ChangeReq {
    /// A write into an existing bucket.
    Update { bucket_id: usize },
    /// An insert of a new key (bucket resolved by the receiver).
    Insert { key: Bytes },
}

pub struct PrimeTable {
    buckets: Vec<Bucket>,
    len: usize,
}

impl Default for PrimeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PrimeTable {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(INITIAL_BUCKETS);
        buckets.resize_with(INITIAL_BUCKETS, Bucket::default);
        Self { buckets, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(&self, key: &[u8]) -> usize {
        (hash_key(key) as usize) & (self.buckets.len() - 1)
    }

    pub fn bucket_id(&self, key: &[u8]) -> usize {
        self.bucket_of(key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: &[u8]) -> Option<&PrimeValue> {
        let bucket = &self.buckets[self.bucket_of(key)];
        bucket
            .entries
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut PrimeValue> {
        let id = self.bucket_of(key);
        self.buckets[id]
            .entries
            .iter_mut()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v)
    }

    /// Insert or replace. Returns the previous value if any.
    pub fn insert(&mut self, key: Bytes, value: PrimeValue) -> Option<PrimeValue> {
        let id = self.bucket_of(&key);
        if let Some(slot) = self.buckets[id]
            .entries
            .iter_mut()
            .find(|(k, _)| *k == key)
        {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        self.buckets[id].entries.push((key, value));
        self.len += 1;
        if self.buckets[id].entries.len() > BUCKET_SPLIT_LEN {
            self.grow();
        }
        None
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<PrimeValue> {
        let id = self.bucket_of(key);
        let bucket = &mut self.buckets[id];
        let pos = bucket.entries.iter().position(|(k, _)| k.as_ref() == key)?;
        self.len -= 1;
        Some(bucket.entries.swap_remove(pos).1)
    }

    /// Find an entry by key hash and predicate, the lookup used by bin
    /// defragmentation where only the hash survives.
    pub fn find_by_hash(
        &mut self,
        hash: u64,
        mut pred: impl FnMut(&Bytes, &PrimeValue) -> bool,
    ) -> Option<(&Bytes, &mut PrimeValue)> {
        let id = (hash as usize) & (self.buckets.len() - 1);
        self.buckets[id]
            .entries
            .iter_mut()
            .find(|(k, v)| hash_key(k) == hash && pred(k, v))
            .map(|(k, v)| (&*k, v))
    }

    /// Double the bucket array, redistributing entries. New buckets inherit
    /// the version of the bucket they split from, so snapshot bookkeeping
    /// stays conservative.
    fn grow(&mut self) {
        let old_len = self.buckets.len();
        let old = std::mem::take(&mut self.buckets);
        let mut buckets: Vec<Bucket> = Vec::with_capacity(old_len * 2);
        buckets.resize_with(old_len * 2, Bucket::default);
        for (i, bucket) in old.into_iter().enumerate() {
            buckets[i].version = bucket.version;
            buckets[i + old_len].version = bucket.version;
            for (key, value) in bucket.entries {
                let id = (hash_key(&key) as usize) & (buckets.len() - 1);
                buckets[id].entries.push((key, value));
            }
        }
        self.buckets = buckets;
    }

    // Bucket-level access for snapshotters.

    pub fn bucket_version(&self, bucket_id: usize) -> u64 {
        self.buckets[bucket_id].version
    }

    pub fn set_bucket_version(&mut self, bucket_id: usize, version: u64) {
        self.buckets[bucket_id].version = version;
    }

    /// Immutable view of a bucket's entries.
    pub fn bucket_entries(&self, bucket_id: usize) -> &[(Bytes, PrimeValue)] {
        &self.buckets[bucket_id].entries
    }

    /// Visit one bucket and return the advanced cursor; a zero cursor means
    /// the traversal wrapped. Traversal is in bucket (segment) order.
    pub fn traverse(&self, cursor: Cursor, visit: impl FnOnce(usize)) -> Cursor {
        let id = cursor.bucket();
        if id >= self.buckets.len() {
            return Cursor(0);
        }
        visit(id);
        if id + 1 >= self.buckets.len() {
            Cursor(0)
        } else {
            Cursor(id as u64 + 2)
        }
    }

    /// Iterate all live entries (test and snapshot helper).
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &PrimeValue)> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|(k, v)| (k, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Bytes, &mut PrimeValue)> {
        self.buckets
            .iter_mut()
            .flat_map(|b| b.entries.iter_mut().map(|(k, v)| (&*k, v)))
    }
}

/// A logical database: prime table plus expiry bookkeeping and the snapshot
/// registration state.
#[derive(Default)]
pub struct DbTable {
    pub prime: PrimeTable,
    /// Absolute expiry in unix milliseconds.
    pub expire: HashMap<Bytes, u64>,
    /// Version counter handing out snapshot versions.
    version_counter: u64,
    /// Versions of currently registered snapshots, ascending.
    registered: Vec<u64>,
}

impl DbTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a snapshot observer. Returns its snapshot version; every
    /// bucket with a version strictly below it is not yet captured.
    pub fn register_on_change(&mut self) -> u64 {
        self.version_counter += 1;
        let version = self.version_counter;
        self.registered.push(version);
        version
    }

    pub fn unregister_on_change(&mut self, version: u64) {
        self.registered.retain(|v| *v != version);
    }

    pub fn has_registered_snapshots(&self) -> bool {
        !self.registered.is_empty()
    }

    /// Build the change notification a mutation of `key` requires, or None if
    /// no registered snapshot still needs this bucket. Must be called before
    /// the mutation is applied.
    pub fn prepare_change(&self, key: &[u8]) -> Option<ChangeReq> {
        let min_version = *self.registered.first()?;
        if self.prime.contains(key) {
            let bucket_id = self.prime.bucket_id(key);
            (self.prime.bucket_version(bucket_id) < min_version)
                .then_some(ChangeReq::Update { bucket_id })
        } else {
            // The insert may relocate buckets on growth; let the receiver
            // resolve the bucket at dispatch time.
            Some(ChangeReq::Insert {
                key: Bytes::copy_from_slice(key),
            })
        }
    }

    pub fn expire_time(&self, key: &[u8]) -> u64 {
        self.expire.get(key).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::PrimeValue;

    fn key(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn insert_get_remove() {
        let mut table = PrimeTable::new();
        for i in 0..100 {
            let k = key(&format!("k{i}"));
            assert!(table.insert(k, PrimeValue::new_string(b"v")).is_none());
        }
        assert_eq!(table.len(), 100);
        assert!(table.get(b"k42").is_some());
        assert!(table.remove(b"k42").is_some());
        assert!(table.get(b"k42").is_none());
        assert_eq!(table.len(), 99);
    }

    #[test]
    fn traversal_visits_every_bucket_once() {
        let mut table = PrimeTable::new();
        for i in 0..200 {
            table.insert(key(&format!("k{i}")), PrimeValue::new_string(b"v"));
        }
        let mut seen = 0usize;
        let mut cursor = Cursor::default();
        loop {
            cursor = table.traverse(cursor, |id| {
                seen += table.bucket_entries(id).len();
            });
            if cursor.is_done() {
                break;
            }
        }
        assert_eq!(seen, 200);
    }

    #[test]
    fn growth_preserves_bucket_versions() {
        let mut table = PrimeTable::new();
        for id in 0..table.bucket_count() {
            table.set_bucket_version(id, 7);
        }
        for i in 0..200 {
            table.insert(key(&format!("k{i}")), PrimeValue::new_string(b"v"));
        }
        assert!(table.bucket_count() > INITIAL_BUCKETS);
        for id in 0..table.bucket_count() {
            assert_eq!(table.bucket_version(id), 7);
        }
    }

    #[test]
    fn prepare_change_only_for_unsnapshotted_buckets() {
        let mut db = DbTable::new();
        db.prime.insert(key("a"), PrimeValue::new_string(b"v"));
        assert!(db.prepare_change(b"a").is_none(), "no snapshot registered");

        let version = db.register_on_change();
        match db.prepare_change(b"a") {
            Some(ChangeReq::Update { bucket_id }) => {
                db.prime.set_bucket_version(bucket_id, version);
            }
            other => panic!("unexpected change req: {other:?}"),
        }
        assert!(db.prepare_change(b"a").is_none(), "bucket already captured");

        match db.prepare_change(b"new") {
            Some(ChangeReq::Insert { key: k }) => assert_eq!(k, key("new")),
            other => panic!("unexpected change req: {other:?}"),
        }

        db.unregister_on_change(version);
        assert!(db.prepare_change(b"new").is_none());
    }
}
