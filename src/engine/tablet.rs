use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::latch::CountDownLatch;
use crate::engine::compaction::CompactionType;
use crate::engine::meta_service::MetaService;
use crate::meta::delete_bitmap::INVALID_SEGMENT_ID;
use crate::meta::rowset::{RowsetMeta, Version};
use crate::meta::schema::SchemaCache;
use crate::meta::tablet_meta::{TabletMeta, TabletState};

/// One tablet held by this node: the meta under its reader/writer lock plus
/// the runtime state compaction and publish coordinate through.
#[derive(Debug)]
pub struct Tablet {
    tablet_id: i64,
    table_id: i64,
    partition_id: i64,
    meta: RwLock<TabletMeta>,
    // Serializes rowset/delete-bitmap updates for merge-on-write publishes.
    rowset_update_lock: Mutex<()>,
    // Held shared by publish, exclusively by tablet migration.
    migration_lock: RwLock<()>,

    pub last_base_compaction_failure_ms: AtomicI64,
    pub last_cumu_compaction_failure_ms: AtomicI64,
    pub last_full_compaction_failure_ms: AtomicI64,
    pub last_cumu_no_suitable_version_ms: AtomicI64,
    // Target version of an in-flight schema change, -1 when none.
    pub alter_version: AtomicI64,
}

impl Tablet {
    pub fn new(meta: TabletMeta) -> Self {
        Tablet {
            tablet_id: meta.tablet_id,
            table_id: meta.table_id,
            partition_id: meta.partition_id,
            meta: RwLock::new(meta),
            rowset_update_lock: Mutex::new(()),
            migration_lock: RwLock::new(()),
            last_base_compaction_failure_ms: AtomicI64::new(0),
            last_cumu_compaction_failure_ms: AtomicI64::new(0),
            last_full_compaction_failure_ms: AtomicI64::new(0),
            last_cumu_no_suitable_version_ms: AtomicI64::new(0),
            alter_version: AtomicI64::new(-1),
        }
    }

    pub fn tablet_id(&self) -> i64 {
        self.tablet_id
    }

    pub fn table_id(&self) -> i64 {
        self.table_id
    }

    pub fn partition_id(&self) -> i64 {
        self.partition_id
    }

    pub fn meta(&self) -> RwLockReadGuard<'_, TabletMeta> {
        self.meta.read()
    }

    pub fn meta_mut(&self) -> RwLockWriteGuard<'_, TabletMeta> {
        self.meta.write()
    }

    pub fn rowset_update_lock(&self) -> &Mutex<()> {
        &self.rowset_update_lock
    }

    pub fn migration_lock(&self) -> &RwLock<()> {
        &self.migration_lock
    }

    pub fn tablet_state(&self) -> TabletState {
        self.meta.read().tablet_state()
    }

    pub fn enable_merge_on_write(&self) -> bool {
        self.meta.read().enable_merge_on_write()
    }

    pub fn max_version(&self) -> Version {
        self.meta.read().max_version()
    }

    pub fn check_version_exists(&self, version: Version) -> bool {
        self.meta.read().version_exists(version)
    }

    /// Atomically append a published rowset to the live list.
    pub fn add_inc_rowset(&self, rowset: Arc<RowsetMeta>) -> Result<()> {
        self.meta.write().add_rowset(rowset)
    }

    pub fn set_last_failure_time(&self, compaction_type: CompactionType, now_ms: i64) {
        match compaction_type {
            CompactionType::Base => {
                self.last_base_compaction_failure_ms.store(now_ms, Ordering::Release)
            }
            CompactionType::Cumulative => {
                self.last_cumu_compaction_failure_ms.store(now_ms, Ordering::Release)
            }
            CompactionType::Full => {
                self.last_full_compaction_failure_ms.store(now_ms, Ordering::Release)
            }
        }
    }

    /// Rowset-count pressure above (cumulative) or below (base) the
    /// cumulative layer point; the producer ranks tablets by it.
    pub fn compaction_score(&self, compaction_type: CompactionType) -> i64 {
        let meta = self.meta.read();
        let point = meta.cumulative_layer_point;
        match compaction_type {
            CompactionType::Cumulative => meta
                .rs_metas()
                .iter()
                .filter(|rs| point < 0 || rs.start_version() >= point)
                .count() as i64,
            CompactionType::Base => meta
                .rs_metas()
                .iter()
                .filter(|rs| point >= 0 && rs.end_version() < point)
                .count() as i64,
            CompactionType::Full => meta.rs_metas().len() as i64,
        }
    }

    /// (total bitmap entries, entries belonging to the base rowset).
    pub fn delete_bitmap_score(&self) -> (u64, u64) {
        let meta = self.meta.read();
        if !meta.enable_merge_on_write() {
            return (0, 0);
        }
        let total = meta.delete_bitmap().get_entry_count();
        let base = meta
            .rs_metas()
            .iter()
            .find(|rs| rs.start_version() == 0)
            .map(|rs| {
                meta.delete_bitmap().get_count_with_range(
                    &(rs.rowset_id, 0, 0),
                    &(rs.rowset_id, INVALID_SEGMENT_ID, i64::MAX),
                ) as u64
            })
            .unwrap_or(0);
        (total, base)
    }
}

/// In-memory tablet registry: lookup, compaction candidates, vacuum and the
/// metadata-service sync loop body.
pub struct TabletManager {
    tablets: RwLock<HashMap<i64, Arc<Tablet>>>,
}

impl TabletManager {
    pub fn new() -> Self {
        TabletManager { tablets: RwLock::new(HashMap::new()) }
    }

    pub fn put_tablet(&self, tablet: Arc<Tablet>) {
        self.tablets.write().insert(tablet.tablet_id(), tablet);
    }

    pub fn drop_tablet(&self, tablet_id: i64) -> Option<Arc<Tablet>> {
        self.tablets.write().remove(&tablet_id)
    }

    pub fn get_tablet(&self, tablet_id: i64) -> Result<Arc<Tablet>> {
        self.tablets
            .read()
            .get(&tablet_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("tablet not found, tablet_id={tablet_id}")))
    }

    pub fn tablet_count(&self) -> usize {
        self.tablets.read().len()
    }

    /// Up to `n` tablets with the highest `compaction_type` score that
    /// `filter_out` does not reject. `max_score` is always refreshed with the
    /// maximum observed score, even when `n` is zero.
    pub fn get_topn_tablets_to_compact(
        &self,
        n: usize,
        compaction_type: CompactionType,
        filter_out: &dyn Fn(&Tablet) -> bool,
        out: &mut Vec<Arc<Tablet>>,
        max_score: &mut i64,
    ) -> Result<()> {
        let tablets: Vec<Arc<Tablet>> = self.tablets.read().values().cloned().collect();
        let mut candidates: Vec<(i64, Arc<Tablet>)> = Vec::new();
        for tablet in tablets {
            let score = tablet.compaction_score(compaction_type);
            if score > *max_score {
                *max_score = score;
            }
            if score <= 0 || filter_out(&tablet) {
                continue;
            }
            candidates.push((score, tablet));
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.tablet_id().cmp(&b.1.tablet_id())));
        out.extend(candidates.into_iter().take(n).map(|(_, t)| t));
        Ok(())
    }

    /// Reclaim stale rowsets past their sweep TTL, along with their delete
    /// bitmaps. Aborts between tablets once the stop latch fires.
    pub fn vacuum_stale_rowsets(&self, stop_latch: &CountDownLatch, config: &Config) -> usize {
        let tablets: Vec<Arc<Tablet>> = self.tablets.read().values().cloned().collect();
        let now = Utc::now();
        let ttl = chrono::Duration::seconds(config.stale_rowset_sweep_ttl_s as i64);
        let mut swept = 0;
        for tablet in tablets {
            if stop_latch.is_zero() {
                break;
            }
            let mut meta = tablet.meta_mut();
            let expired: Vec<Arc<RowsetMeta>> = meta
                .stale_rs_metas()
                .iter()
                .filter(|rs| now - rs.creation_time > ttl)
                .cloned()
                .collect();
            for rs in &expired {
                meta.delete_stale_rowset_by_version(rs.version);
                meta.remove_rowset_delete_bitmap(&rs.rowset_id);
                swept += 1;
            }
            if !expired.is_empty() {
                debug!(
                    tablet_id = tablet.tablet_id(),
                    swept = expired.len(),
                    "vacuumed stale rowsets"
                );
            }
        }
        // Schemas orphaned by evicted tablets can go too.
        SchemaCache::instance().prune();
        swept
    }

    /// Pull rowsets this node is missing from the metadata service.
    pub fn sync_tablets(&self, stop_latch: &CountDownLatch, meta_service: &dyn MetaService) {
        let tablets: Vec<Arc<Tablet>> = self.tablets.read().values().cloned().collect();
        for tablet in tablets {
            if stop_latch.is_zero() {
                break;
            }
            let max_version = tablet.max_version().end;
            match meta_service.get_tablet_rowsets(tablet.tablet_id(), max_version) {
                Ok(rowsets) => {
                    if rowsets.is_empty() {
                        continue;
                    }
                    let mut meta = tablet.meta_mut();
                    let count = rowsets.len();
                    for rs in rowsets {
                        if let Err(e) = meta.add_rowset(Arc::new(rs)) {
                            warn!(
                                tablet_id = tablet.tablet_id(),
                                error = %e,
                                "failed to apply synced rowset"
                            );
                        }
                    }
                    info!(tablet_id = tablet.tablet_id(), count, "synced rowsets from meta service");
                }
                Err(e) => {
                    warn!(tablet_id = tablet.tablet_id(), error = %e, "failed to sync tablet");
                }
            }
        }
    }

    pub fn get_partition_related_tablets(&self, partition_id: i64) -> Vec<Arc<Tablet>> {
        let mut related: Vec<Arc<Tablet>> = self
            .tablets
            .read()
            .values()
            .filter(|t| t.partition_id() == partition_id)
            .cloned()
            .collect();
        related.sort_by_key(|t| t.tablet_id());
        related
    }

    pub fn get_topn_tablet_delete_bitmap_score(&self, max_score: &mut u64, max_base_score: &mut u64) {
        let tablets: Vec<Arc<Tablet>> = self.tablets.read().values().cloned().collect();
        for tablet in tablets {
            let (score, base_score) = tablet.delete_bitmap_score();
            *max_score = (*max_score).max(score);
            *max_base_score = (*max_base_score).max(base_score);
        }
    }
}

impl Default for TabletManager {
    fn default() -> Self {
        TabletManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::tablet_meta::testing::{create_request, rowset_at};

    fn tablet_with_rowsets(tablet_id: i64, versions: &[(i64, i64)]) -> Arc<Tablet> {
        let mut meta = TabletMeta::create_from_request(&create_request(tablet_id, false));
        for (start, end) in versions {
            meta.add_rowset(rowset_at(tablet_id, *start, *end)).unwrap();
        }
        meta.set_cumulative_layer_point(2);
        Arc::new(Tablet::new(meta))
    }

    #[test]
    fn test_get_tablet_not_found() {
        let mgr = TabletManager::new();
        let err = mgr.get_tablet(42).unwrap_err();
        assert!(err.is(crate::core::error::ErrorKind::NotFound));
    }

    #[test]
    fn test_compaction_scores() {
        let tablet = tablet_with_rowsets(20, &[(0, 1), (2, 2), (3, 3), (4, 4)]);
        assert_eq!(tablet.compaction_score(CompactionType::Cumulative), 3);
        assert_eq!(tablet.compaction_score(CompactionType::Base), 1);
        assert_eq!(tablet.compaction_score(CompactionType::Full), 4);
    }

    #[test]
    fn test_topn_orders_by_score_and_respects_filter() {
        let mgr = TabletManager::new();
        let small = tablet_with_rowsets(21, &[(2, 2), (3, 3)]);
        let big = tablet_with_rowsets(22, &[(2, 2), (3, 3), (4, 4), (5, 5)]);
        mgr.put_tablet(small.clone());
        mgr.put_tablet(big.clone());

        let mut out = Vec::new();
        let mut max_score = 0;
        mgr.get_topn_tablets_to_compact(
            1,
            CompactionType::Cumulative,
            &|_| false,
            &mut out,
            &mut max_score,
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tablet_id(), 22);
        assert_eq!(max_score, 4);

        // A zero budget still refreshes the score metric.
        let mut none = Vec::new();
        let mut score_only = 0;
        mgr.get_topn_tablets_to_compact(
            0,
            CompactionType::Cumulative,
            &|t| t.tablet_id() == 22,
            &mut none,
            &mut score_only,
        )
        .unwrap();
        assert!(none.is_empty());
        assert_eq!(score_only, 4);
    }

    #[test]
    fn test_partition_related_tablets() {
        let mgr = TabletManager::new();
        mgr.put_tablet(tablet_with_rowsets(23, &[(0, 1)]));
        mgr.put_tablet(tablet_with_rowsets(24, &[(0, 1)]));
        let related = mgr.get_partition_related_tablets(3);
        assert_eq!(related.len(), 2);
        assert!(mgr.get_partition_related_tablets(999).is_empty());
    }

    #[test]
    fn test_sync_tablets_pulls_missing_rowsets() {
        use crate::engine::meta_service::testing::MockMetaService;

        let mgr = TabletManager::new();
        let tablet = tablet_with_rowsets(25, &[(0, 1)]);
        mgr.put_tablet(tablet.clone());

        let ms = MockMetaService::default();
        ms.remote_rowsets
            .lock()
            .insert(25, vec![(*rowset_at(25, 2, 2)).clone(), (*rowset_at(25, 0, 1)).clone()]);

        let latch = CountDownLatch::new(1);
        mgr.sync_tablets(&latch, &ms);
        assert_eq!(tablet.max_version(), Version::new(2, 2));
        assert_eq!(tablet.meta().rs_metas().len(), 2);
    }

    #[test]
    fn test_vacuum_sweeps_expired_stale_rowsets() {
        let mgr = TabletManager::new();
        let tablet = tablet_with_rowsets(26, &[(0, 1), (2, 2)]);
        {
            let mut meta = tablet.meta_mut();
            let live: Vec<_> = meta.rs_metas().to_vec();
            let merged = rowset_at(26, 0, 2);
            meta.modify_rowsets(vec![merged], &live, false);
            assert_eq!(meta.stale_rs_metas().len(), 2);
        }
        mgr.put_tablet(tablet.clone());

        let latch = CountDownLatch::new(1);
        let config = Config { stale_rowset_sweep_ttl_s: 0, ..Config::default() };
        let swept = mgr.vacuum_stale_rowsets(&latch, &config);
        assert_eq!(swept, 2);
        assert!(tablet.meta().stale_rs_metas().is_empty());
    }
}
