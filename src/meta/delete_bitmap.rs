use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::Bound::{Excluded, Unbounded};
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};
use crate::meta::rowset::RowsetId;

pub type SegmentId = u32;
pub type BitmapVersion = i64;

/// Key of one segment bitmap: which rowset, which segment within it, and the
/// version the deletes were produced at.
pub type BitmapKey = (RowsetId, SegmentId, BitmapVersion);

/// Sentinel segment id marking "this rowset has been processed" entries.
pub const INVALID_SEGMENT_ID: SegmentId = SegmentId::MAX;
pub const TEMP_VERSION_COMMON: BitmapVersion = 0;
pub const ROWSET_SENTINEL_MARK: u32 = u32::MAX;

/// Serialized form of one bitmap entry, embedded into the persisted tablet
/// descriptor for merge-on-write tablets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteBitmapEntry {
    pub rowset_id: RowsetId,
    pub segment_id: SegmentId,
    pub version: BitmapVersion,
    pub bitmap: Vec<u8>,
}

/// Per-tablet row-deletion index: ordered map from `BitmapKey` to a
/// compressed bitmap of deleted row ordinals. The side map
/// `rowset_cache_version` records, per (rowset, segment), the highest version
/// already materialized into the aggregation cache so `get_agg` can seed
/// incrementally instead of re-unioning from version 0.
#[derive(Debug)]
pub struct DeleteBitmap {
    tablet_id: i64,
    bitmaps: RwLock<BTreeMap<BitmapKey, RoaringBitmap>>,
    rowset_cache_version: RwLock<BTreeMap<RowsetId, BTreeMap<SegmentId, BitmapVersion>>>,
}

impl DeleteBitmap {
    pub fn new(tablet_id: i64) -> Self {
        DeleteBitmap {
            tablet_id,
            bitmaps: RwLock::new(BTreeMap::new()),
            rowset_cache_version: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn tablet_id(&self) -> i64 {
        self.tablet_id
    }

    pub fn add(&self, key: &BitmapKey, row_id: u32) {
        let mut bitmaps = self.bitmaps.write();
        bitmaps.entry(*key).or_default().insert(row_id);
    }

    /// Returns false if the key is absent.
    pub fn remove(&self, key: &BitmapKey, row_id: u32) -> bool {
        let mut bitmaps = self.bitmaps.write();
        match bitmaps.get_mut(key) {
            Some(bm) => {
                bm.remove(row_id);
                true
            }
            None => false,
        }
    }

    /// Delete all entries in `[start, end)` lexicographically.
    pub fn remove_range(&self, start: &BitmapKey, end: &BitmapKey) {
        let mut bitmaps = self.bitmaps.write();
        Self::remove_range_locked(&mut bitmaps, start, end);
    }

    pub fn remove_ranges(&self, ranges: &[(BitmapKey, BitmapKey)]) {
        let mut bitmaps = self.bitmaps.write();
        for (start, end) in ranges {
            Self::remove_range_locked(&mut bitmaps, start, end);
        }
    }

    fn remove_range_locked(
        bitmaps: &mut BTreeMap<BitmapKey, RoaringBitmap>,
        start: &BitmapKey,
        end: &BitmapKey,
    ) {
        let doomed: Vec<BitmapKey> =
            bitmaps.range(*start..*end).map(|(k, _)| *k).collect();
        for k in doomed {
            bitmaps.remove(&k);
        }
    }

    pub fn contains(&self, key: &BitmapKey, row_id: u32) -> bool {
        let bitmaps = self.bitmaps.read();
        bitmaps.get(key).is_some_and(|bm| bm.contains(row_id))
    }

    /// Like `contains`, but against the union of all versions `<= key.2`,
    /// going through the aggregation cache.
    pub fn contains_agg(&self, key: &BitmapKey, row_id: u32) -> bool {
        self.get_agg(key).contains(row_id)
    }

    pub fn contains_agg_without_cache(&self, key: &BitmapKey, row_id: u32) -> bool {
        let (rowset, seg, version) = *key;
        let bitmaps = self.bitmaps.read();
        for (k, bm) in bitmaps.range((rowset, seg, 0)..) {
            if k.0 != rowset || k.1 != seg || k.2 > version {
                break;
            }
            if bm.contains(row_id) {
                return true;
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.bitmaps.read().is_empty()
    }

    /// Insert or replace; returns true iff inserted.
    pub fn set(&self, key: &BitmapKey, bitmap: RoaringBitmap) -> bool {
        let mut bitmaps = self.bitmaps.write();
        bitmaps.insert(*key, bitmap).is_none()
    }

    pub fn get(&self, key: &BitmapKey) -> Option<RoaringBitmap> {
        let bitmaps = self.bitmaps.read();
        bitmaps.get(key).cloned()
    }

    /// Copy every entry in `[start, end)` into `out`.
    pub fn subset(&self, start: &BitmapKey, end: &BitmapKey, out: &DeleteBitmap) {
        debug_assert!(start < end);
        let bitmaps = self.bitmaps.read();
        for (k, bm) in bitmaps.range(*start..*end) {
            out.set(k, bm.clone());
        }
    }

    pub fn get_count_with_range(&self, start: &BitmapKey, end: &BitmapKey) -> usize {
        debug_assert!(start < end);
        let bitmaps = self.bitmaps.read();
        bitmaps.range(*start..*end).count()
    }

    /// Union `bitmap` into the entry at `key`.
    pub fn merge_bitmap(&self, key: &BitmapKey, bitmap: &RoaringBitmap) {
        let mut bitmaps = self.bitmaps.write();
        match bitmaps.get_mut(key) {
            Some(existing) => *existing |= bitmap,
            None => {
                bitmaps.insert(*key, bitmap.clone());
            }
        }
    }

    /// Union every entry of `other` into self. Locks are taken in address
    /// order so two concurrent cross-merges cannot deadlock.
    pub fn merge(&self, other: &DeleteBitmap) {
        if std::ptr::eq(self, other) {
            return;
        }
        if (self as *const Self) < (other as *const Self) {
            let mut mine = self.bitmaps.write();
            let theirs = other.bitmaps.read();
            Self::merge_locked(&mut mine, &theirs);
        } else {
            let theirs = other.bitmaps.read();
            let mut mine = self.bitmaps.write();
            Self::merge_locked(&mut mine, &theirs);
        }
    }

    fn merge_locked(
        mine: &mut BTreeMap<BitmapKey, RoaringBitmap>,
        theirs: &BTreeMap<BitmapKey, RoaringBitmap>,
    ) {
        for (k, bm) in theirs.iter() {
            match mine.get_mut(k) {
                Some(existing) => *existing |= bm,
                None => {
                    mine.insert(*k, bm.clone());
                }
            }
        }
    }

    /// Replace self's contents with `other`'s. The two bitmap locks are
    /// taken in address order; the stale cache-version side map is cleared
    /// afterwards under its own lock.
    pub fn assign_from(&self, other: &DeleteBitmap) {
        if std::ptr::eq(self, other) {
            return;
        }
        if (self as *const Self) < (other as *const Self) {
            let mut mine = self.bitmaps.write();
            let theirs = other.bitmaps.read();
            *mine = theirs.clone();
        } else {
            let theirs = other.bitmaps.read();
            let mut mine = self.bitmaps.write();
            *mine = theirs.clone();
        }
        self.clear_rowset_cache_version();
    }

    /// Deep copy under shared lock. The cache-version side map intentionally
    /// starts empty in the copy.
    pub fn snapshot(&self) -> DeleteBitmap {
        let bitmaps = self.bitmaps.read();
        DeleteBitmap {
            tablet_id: self.tablet_id,
            bitmaps: RwLock::new(bitmaps.clone()),
            rowset_cache_version: RwLock::new(BTreeMap::new()),
        }
    }

    /// Snapshot, then drop every key with version greater than `version`.
    pub fn snapshot_at(&self, version: BitmapVersion) -> DeleteBitmap {
        let snapshot = self.snapshot();
        snapshot.bitmaps.write().retain(|k, _| k.2 <= version);
        snapshot
    }

    /// Total deleted rows, sentinel entries excluded.
    pub fn cardinality(&self) -> u64 {
        let bitmaps = self.bitmaps.read();
        bitmaps
            .iter()
            .filter(|(k, _)| k.1 != INVALID_SEGMENT_ID)
            .map(|(_, bm)| bm.len())
            .sum()
    }

    /// Total serialized bytes, sentinel entries excluded.
    pub fn get_size(&self) -> u64 {
        let bitmaps = self.bitmaps.read();
        bitmaps
            .iter()
            .filter(|(k, _)| k.1 != INVALID_SEGMENT_ID)
            .map(|(_, bm)| bm.serialized_size() as u64)
            .sum()
    }

    pub fn get_entry_count(&self) -> u64 {
        let bitmaps = self.bitmaps.read();
        bitmaps.keys().filter(|k| k.1 != INVALID_SEGMENT_ID).count() as u64
    }

    pub fn remove_sentinel_marks(&self) {
        let mut bitmaps = self.bitmaps.write();
        bitmaps.retain(|k, _| k.1 != INVALID_SEGMENT_ID);
    }

    pub fn has_calculated_for_multi_segments(&self, rowset_id: &RowsetId) -> bool {
        self.contains(&(*rowset_id, INVALID_SEGMENT_ID, TEMP_VERSION_COMMON), ROWSET_SENTINEL_MARK)
    }

    /// Visit one `(rowset_id, version)` per invocation. `f` returns -2 to
    /// advance to the next version within the same rowset, any other value to
    /// skip past the rowset entirely.
    pub fn traverse_rowset_and_version<F>(&self, mut f: F)
    where
        F: FnMut(&RowsetId, BitmapVersion) -> i32,
    {
        let bitmaps = self.bitmaps.read();
        let mut next_key = bitmaps.keys().next().copied();
        while let Some(key) = next_key {
            let ret = f(&key.0, key.2);
            let from = if ret == -2 {
                key
            } else {
                (key.0, SegmentId::MAX, BitmapVersion::MAX)
            };
            next_key = bitmaps.range((Excluded(from), Unbounded)).next().map(|(k, _)| *k);
        }
    }

    // ---- rowset_cache_version side map ----

    pub fn remove_rowset_cache_version(&self, rowset_id: &RowsetId) -> usize {
        let mut versions = self.rowset_cache_version.write();
        versions.remove(rowset_id);
        versions.len()
    }

    pub fn clear_rowset_cache_version(&self) {
        self.rowset_cache_version.write().clear();
    }

    pub fn get_rowset_cache_version(&self) -> BTreeSet<RowsetId> {
        let versions = self.rowset_cache_version.read();
        versions.keys().copied().collect()
    }

    fn cached_agg_version(&self, key: &BitmapKey) -> BitmapVersion {
        let versions = self.rowset_cache_version.read();
        versions
            .get(&key.0)
            .and_then(|segments| segments.get(&key.1))
            .copied()
            .unwrap_or(0)
    }

    fn set_cached_agg_version(&self, key: &BitmapKey) {
        let mut versions = self.rowset_cache_version.write();
        versions.entry(key.0).or_default().insert(key.1, key.2);
    }

    // ---- aggregation ----

    /// Union of all bitmaps for `(rowset, segment)` with version `<= key.2`,
    /// served from the process-wide LRU. On a miss the value is rebuilt
    /// incrementally: seed from the cached aggregate the side map points at,
    /// then union only the newer entries.
    pub fn get_agg(&self, key: &BitmapKey) -> AggBitmapHandle {
        let cache = DeleteBitmapAggCache::instance();
        let cache_key = agg_cache_key(self.tablet_id, key);
        if let Some(value) = cache.lookup(&cache_key) {
            return AggBitmapHandle { value };
        }

        let mut bitmap = RoaringBitmap::new();
        let mut start_version =
            if cache.use_version_cache() { self.cached_agg_version(key) } else { 0 };
        if start_version > 0 {
            let seed_key = agg_cache_key(self.tablet_id, &(key.0, key.1, start_version));
            match cache.lookup(&seed_key) {
                Some(seed) if start_version <= key.2 => {
                    bitmap |= &seed.bitmap;
                    start_version += 1;
                }
                _ => start_version = 0,
            }
        }
        {
            let bitmaps = self.bitmaps.read();
            for (k, bm) in bitmaps.range((key.0, key.1, start_version)..) {
                if k.0 != key.0 || k.1 != key.1 || k.2 > key.2 {
                    break;
                }
                bitmap |= bm;
            }
        }

        if start_version > 0 && cache.correctness_check() {
            let expected = self.get_agg_without_cache(key, 0);
            assert_eq!(
                bitmap, expected,
                "incremental delete bitmap aggregation diverged, tablet={} rowset={} segment={} \
                 version={} start_version={}",
                self.tablet_id, key.0, key.1, key.2, start_version
            );
        }

        let charge = bitmap.serialized_size() + std::mem::size_of::<AggValue>();
        let value = Arc::new(AggValue { bitmap, charge });
        cache.insert(cache_key, value.clone());
        if cache.use_version_cache() && !value.bitmap.is_empty() {
            self.set_cached_agg_version(key);
        }
        AggBitmapHandle { value }
    }

    pub fn get_agg_without_cache(
        &self,
        key: &BitmapKey,
        start_version: BitmapVersion,
    ) -> RoaringBitmap {
        let mut bitmap = RoaringBitmap::new();
        let bitmaps = self.bitmaps.read();
        for (k, bm) in bitmaps.range((key.0, key.1, start_version)..) {
            if k.0 != key.0 || k.1 != key.1 || k.2 > key.2 {
                break;
            }
            bitmap |= bm;
        }
        bitmap
    }

    // ---- persistence ----

    /// Emit serializable entries, skipping rowset ids in `skip` (stale
    /// rowsets are never persisted for merge-on-write tablets).
    pub fn to_entries(&self, skip: &HashSet<RowsetId>) -> Result<Vec<DeleteBitmapEntry>> {
        let bitmaps = self.bitmaps.read();
        let mut entries = Vec::with_capacity(bitmaps.len());
        for (k, bm) in bitmaps.iter() {
            if skip.contains(&k.0) {
                continue;
            }
            let mut data = Vec::with_capacity(bm.serialized_size());
            bm.serialize_into(&mut data)
                .map_err(|e| Error::internal(format!("serialize delete bitmap: {e}")))?;
            entries.push(DeleteBitmapEntry {
                rowset_id: k.0,
                segment_id: k.1,
                version: k.2,
                bitmap: data,
            });
        }
        Ok(entries)
    }

    pub fn load_entries(&self, entries: &[DeleteBitmapEntry]) -> Result<()> {
        let mut bitmaps = self.bitmaps.write();
        for entry in entries {
            let bm = RoaringBitmap::deserialize_from(&entry.bitmap[..]).map_err(|e| {
                Error::new(
                    crate::core::error::ErrorKind::ParseError,
                    format!("deserialize delete bitmap: {e}"),
                )
            })?;
            bitmaps.insert((entry.rowset_id, entry.segment_id, entry.version), bm);
        }
        Ok(())
    }
}

/// Build the LRU key by explicit per-field serialization; never from raw
/// struct memory, whose padding bytes are unspecified.
fn agg_cache_key(tablet_id: i64, key: &BitmapKey) -> Vec<u8> {
    let (rowset, seg, version) = key;
    let mut buf = Vec::with_capacity(8 + 25 + 4 + 8);
    buf.extend_from_slice(&tablet_id.to_le_bytes());
    buf.extend_from_slice(&rowset.hi.to_le_bytes());
    buf.extend_from_slice(&rowset.mi.to_le_bytes());
    buf.extend_from_slice(&rowset.lo.to_le_bytes());
    buf.push(rowset.version);
    buf.extend_from_slice(&seg.to_le_bytes());
    buf.extend_from_slice(&version.to_le_bytes());
    buf
}

struct AggValue {
    bitmap: RoaringBitmap,
    charge: usize,
}

/// Aggregated bitmap handle. Holding it pins the value even if the LRU
/// evicts the entry; the reference is released on drop.
pub struct AggBitmapHandle {
    value: Arc<AggValue>,
}

impl Deref for AggBitmapHandle {
    type Target = RoaringBitmap;

    fn deref(&self) -> &RoaringBitmap {
        &self.value.bitmap
    }
}

struct AggCacheShard {
    cache: LruCache<Vec<u8>, Arc<AggValue>>,
    charge: usize,
}

/// Process-wide, size-bounded LRU over aggregated bitmaps, keyed by
/// `(tablet_id, rowset_id, segment_id, version)` bytes with charge = bitmap
/// bytes plus value overhead.
pub struct DeleteBitmapAggCache {
    shard: Mutex<AggCacheShard>,
    capacity: usize,
    use_version_cache: bool,
    correctness_check: bool,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

static AGG_CACHE: OnceLock<DeleteBitmapAggCache> = OnceLock::new();

impl DeleteBitmapAggCache {
    fn build(capacity: usize, use_version_cache: bool, correctness_check: bool) -> Self {
        DeleteBitmapAggCache {
            shard: Mutex::new(AggCacheShard { cache: LruCache::unbounded(), charge: 0 }),
            capacity,
            use_version_cache,
            correctness_check,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Install the process-wide cache. Later calls keep the first settings.
    pub fn init(capacity: usize, use_version_cache: bool, correctness_check: bool) {
        let _ = AGG_CACHE.get_or_init(|| Self::build(capacity, use_version_cache, correctness_check));
    }

    pub fn instance() -> &'static DeleteBitmapAggCache {
        AGG_CACHE.get_or_init(|| Self::build(100 * 1024 * 1024, true, false))
    }

    fn use_version_cache(&self) -> bool {
        self.use_version_cache
    }

    fn correctness_check(&self) -> bool {
        self.correctness_check
    }

    fn lookup(&self, key: &[u8]) -> Option<Arc<AggValue>> {
        let mut shard = self.shard.lock();
        match shard.cache.get(key) {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn insert(&self, key: Vec<u8>, value: Arc<AggValue>) {
        let mut shard = self.shard.lock();
        let added = value.charge;
        if let Some(old) = shard.cache.put(key, value) {
            shard.charge -= old.charge;
        }
        shard.charge += added;
        while shard.charge > self.capacity {
            match shard.cache.pop_lru() {
                Some((_, evicted)) => shard.charge -= evicted.charge,
                None => break,
            }
        }
    }

    /// Current total charge of resident entries, in bytes.
    pub fn charge(&self) -> usize {
        self.shard.lock().charge
    }

    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap_of(rows: &[u32]) -> RoaringBitmap {
        rows.iter().copied().collect()
    }

    #[test]
    fn test_set_get_contains() {
        let id = RowsetId::generate();
        let bm = DeleteBitmap::new(10);
        assert!(bm.set(&(id, 0, 1), bitmap_of(&[1, 2, 3])));
        assert!(!bm.set(&(id, 0, 1), bitmap_of(&[1, 2])));
        assert!(bm.contains(&(id, 0, 1), 1));
        assert!(!bm.contains(&(id, 0, 1), 3));
        assert_eq!(bm.get(&(id, 0, 1)).unwrap().len(), 2);
        assert!(bm.get(&(id, 1, 1)).is_none());
    }

    #[test]
    fn test_remove_range_spares_sentinel() {
        let id = RowsetId::generate();
        let bm = DeleteBitmap::new(11);
        bm.set(&(id, 0, 1), bitmap_of(&[1]));
        bm.set(&(id, 3, 2), bitmap_of(&[2]));
        bm.set(&(id, INVALID_SEGMENT_ID, TEMP_VERSION_COMMON), bitmap_of(&[ROWSET_SENTINEL_MARK]));
        bm.remove_range(&(id, 0, 0), &(id, INVALID_SEGMENT_ID, 0));
        assert!(bm.get(&(id, 0, 1)).is_none());
        assert!(bm.get(&(id, 3, 2)).is_none());
        assert!(bm.has_calculated_for_multi_segments(&id));
        // Sentinel entries never count toward cardinality or size.
        assert_eq!(bm.cardinality(), 0);
        assert_eq!(bm.get_size(), 0);
    }

    #[test]
    fn test_snapshot_at_version_and_agg() {
        let id = RowsetId::generate();
        let bm = DeleteBitmap::new(12);
        bm.set(&(id, 0, 1), bitmap_of(&[1]));
        bm.set(&(id, 0, 2), bitmap_of(&[2]));
        bm.set(&(id, 0, 5), bitmap_of(&[5]));

        let snap = bm.snapshot_at(2);
        assert!(snap.get(&(id, 0, 1)).is_some());
        assert!(snap.get(&(id, 0, 2)).is_some());
        assert!(snap.get(&(id, 0, 5)).is_none());

        let agg = bm.get_agg(&(id, 0, 2));
        assert_eq!(agg.iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_agg_consecutive_calls_equal() {
        let id = RowsetId::generate();
        let bm = DeleteBitmap::new(13);
        for v in 1..=4 {
            bm.set(&(id, 0, v), bitmap_of(&[v as u32]));
        }
        let first = bm.get_agg(&(id, 0, 4)).len();
        let second = bm.get_agg(&(id, 0, 4)).len();
        assert_eq!(first, 4);
        assert_eq!(first, second);
        // The side map now points at the fully aggregated version.
        assert!(bm.get_rowset_cache_version().contains(&id));
    }

    #[test]
    fn test_agg_incremental_seed_matches_scratch() {
        let id = RowsetId::generate();
        let bm = DeleteBitmap::new(14);
        bm.set(&(id, 0, 1), bitmap_of(&[1]));
        bm.set(&(id, 0, 2), bitmap_of(&[2]));
        let _ = bm.get_agg(&(id, 0, 2));
        bm.set(&(id, 0, 3), bitmap_of(&[3]));
        let incremental = bm.get_agg(&(id, 0, 3));
        let scratch = bm.get_agg_without_cache(&(id, 0, 3), 0);
        assert_eq!(*incremental, scratch);
        assert_eq!(scratch.len(), 3);
    }

    #[test]
    fn test_merge_and_subset() {
        let a_id = RowsetId::generate();
        let b_id = RowsetId::generate();
        let a = DeleteBitmap::new(15);
        let b = DeleteBitmap::new(15);
        a.set(&(a_id, 0, 1), bitmap_of(&[1]));
        b.set(&(a_id, 0, 1), bitmap_of(&[9]));
        b.set(&(b_id, 0, 1), bitmap_of(&[2]));
        a.merge(&b);
        assert_eq!(a.get(&(a_id, 0, 1)).unwrap().len(), 2);
        assert_eq!(a.get(&(b_id, 0, 1)).unwrap().len(), 1);

        let out = DeleteBitmap::new(15);
        let (lo, hi) = if a_id < b_id { (a_id, b_id) } else { (b_id, a_id) };
        a.subset(&(lo, 0, 0), &(lo, INVALID_SEGMENT_ID, BitmapVersion::MAX), &out);
        assert_eq!(out.get_entry_count(), 1);
        assert!(out.get(&(hi, 0, 1)).is_none());
    }

    #[test]
    fn test_traverse_rowset_and_version() {
        let mut ids = [RowsetId::generate(), RowsetId::generate()];
        ids.sort();
        let bm = DeleteBitmap::new(16);
        bm.set(&(ids[0], 0, 1), bitmap_of(&[1]));
        bm.set(&(ids[0], 0, 2), bitmap_of(&[2]));
        bm.set(&(ids[1], 0, 7), bitmap_of(&[3]));

        // Walk every version of every rowset.
        let mut seen = Vec::new();
        bm.traverse_rowset_and_version(|id, v| {
            seen.push((*id, v));
            -2
        });
        assert_eq!(seen, vec![(ids[0], 1), (ids[0], 2), (ids[1], 7)]);

        // Skip to the next rowset after the first visit.
        let mut first_versions = Vec::new();
        bm.traverse_rowset_and_version(|id, v| {
            first_versions.push((*id, v));
            0
        });
        assert_eq!(first_versions, vec![(ids[0], 1), (ids[1], 7)]);
    }

    #[test]
    fn test_entries_round_trip_skips_stale() {
        let live = RowsetId::generate();
        let stale = RowsetId::generate();
        let bm = DeleteBitmap::new(17);
        bm.set(&(live, 0, 1), bitmap_of(&[1, 5]));
        bm.set(&(stale, 0, 1), bitmap_of(&[2]));

        let skip: HashSet<RowsetId> = [stale].into_iter().collect();
        let entries = bm.to_entries(&skip).unwrap();
        assert_eq!(entries.len(), 1);

        let restored = DeleteBitmap::new(17);
        restored.load_entries(&entries).unwrap();
        assert_eq!(restored.get(&(live, 0, 1)).unwrap().len(), 2);
        assert!(restored.get(&(stale, 0, 1)).is_none());
    }

    #[test]
    fn test_rowset_cache_version_removal() {
        let id = RowsetId::generate();
        let bm = DeleteBitmap::new(18);
        bm.set(&(id, 0, 1), bitmap_of(&[1]));
        let _ = bm.get_agg(&(id, 0, 1));
        assert!(bm.get_rowset_cache_version().contains(&id));
        bm.remove_rowset_cache_version(&id);
        assert!(!bm.get_rowset_cache_version().contains(&id));
    }
}
