use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::meta::rowset::RowsetMeta;

/// Tracks which rowset a transaction wrote per tablet, and which transaction
/// is expected to publish a given `(tablet, version)`. A `None` rowset means
/// the write failed on this node but the frontend still fanned out the
/// publish.
#[derive(Default)]
pub struct TxnManager {
    // (txn_id, partition_id) -> tablet_id -> pending rowset
    txn_tablets: Mutex<HashMap<(i64, i64), BTreeMap<i64, Option<Arc<RowsetMeta>>>>>,
    // (tablet_id, version) -> txn_id
    tablet_version_txn: Mutex<HashMap<(i64, i64), i64>>,
}

impl TxnManager {
    pub fn new() -> Self {
        TxnManager::default()
    }

    /// Bind the rowset a load produced for `(txn, partition, tablet)`.
    pub fn commit_txn(
        &self,
        txn_id: i64,
        partition_id: i64,
        tablet_id: i64,
        rowset: Option<Arc<RowsetMeta>>,
    ) {
        let mut txns = self.txn_tablets.lock();
        txns.entry((txn_id, partition_id)).or_default().insert(tablet_id, rowset);
    }

    pub fn get_txn_related_tablets(
        &self,
        txn_id: i64,
        partition_id: i64,
    ) -> BTreeMap<i64, Option<Arc<RowsetMeta>>> {
        let txns = self.txn_tablets.lock();
        txns.get(&(txn_id, partition_id)).cloned().unwrap_or_default()
    }

    pub fn remove_txn_tablet(&self, txn_id: i64, partition_id: i64, tablet_id: i64) {
        let mut txns = self.txn_tablets.lock();
        if let Some(tablets) = txns.get_mut(&(txn_id, partition_id)) {
            tablets.remove(&tablet_id);
            if tablets.is_empty() {
                txns.remove(&(txn_id, partition_id));
            }
        }
    }

    pub fn get_txn_by_tablet_version(&self, tablet_id: i64, version: i64) -> Option<i64> {
        self.tablet_version_txn.lock().get(&(tablet_id, version)).copied()
    }

    pub fn update_tablet_version_txn(&self, tablet_id: i64, version: i64, txn_id: i64) {
        self.tablet_version_txn.lock().insert((tablet_id, version), txn_id);
    }

    pub fn remove_tablet_version_txn(&self, tablet_id: i64, version: i64) {
        self.tablet_version_txn.lock().remove(&(tablet_id, version));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::rowset::{RowsetId, Version};

    #[test]
    fn test_txn_tablet_bindings() {
        let mgr = TxnManager::new();
        let rs = Arc::new(RowsetMeta::new(RowsetId::generate(), 5, Version::single(2)));
        mgr.commit_txn(100, 1, 5, Some(rs.clone()));
        mgr.commit_txn(100, 1, 6, None);

        let tablets = mgr.get_txn_related_tablets(100, 1);
        assert_eq!(tablets.len(), 2);
        assert!(tablets[&5].is_some());
        assert!(tablets[&6].is_none());

        mgr.remove_txn_tablet(100, 1, 5);
        mgr.remove_txn_tablet(100, 1, 6);
        assert!(mgr.get_txn_related_tablets(100, 1).is_empty());
    }

    #[test]
    fn test_tablet_version_txn() {
        let mgr = TxnManager::new();
        assert!(mgr.get_txn_by_tablet_version(5, 2).is_none());
        mgr.update_tablet_version_txn(5, 2, 100);
        assert_eq!(mgr.get_txn_by_tablet_version(5, 2), Some(100));
        mgr.remove_tablet_version_txn(5, 2);
        assert!(mgr.get_txn_by_tablet_version(5, 2).is_none());
    }
}
