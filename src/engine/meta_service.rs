use std::any::Any;
use std::sync::Arc;

use crate::core::error::Result;
use crate::engine::compaction::CompactionType;
use crate::meta::rowset::{RowsetMeta, Version};
use crate::vault::filesystem::{PathFormat, VaultInfo};

/// Returned by `publish_txn`. Holding it extends the transaction's
/// pending-rowset lifetime so path GC cannot delete the data files before
/// the rowset becomes visible.
pub struct PendingRowsetGuard {
    _keepalive: Option<Arc<dyn Any + Send + Sync>>,
}

impl PendingRowsetGuard {
    pub fn new(keepalive: Arc<dyn Any + Send + Sync>) -> Self {
        PendingRowsetGuard { _keepalive: Some(keepalive) }
    }

    pub fn empty() -> Self {
        PendingRowsetGuard { _keepalive: None }
    }
}

/// The metadata-service RPC surface the core depends on. Real deployments
/// implement this over the wire; everything here is allowed to block.
pub trait MetaService: Send + Sync {
    /// Vault descriptor list plus the global vault-routing flag.
    fn get_storage_vault_info(&self) -> Result<(Vec<(String, VaultInfo, PathFormat)>, bool)>;

    /// Make the rowset bound to `(txn_id, tablet_id)` visible at `version`.
    fn publish_txn(
        &self,
        partition_id: i64,
        tablet_id: i64,
        txn_id: i64,
        version: Version,
    ) -> Result<PendingRowsetGuard>;

    /// Serialize compactions over one tablet across the cluster. Returns a
    /// lease id that must be renewed via `lease_compaction`.
    fn request_compaction_global_lock(
        &self,
        tablet_id: i64,
        compaction_type: CompactionType,
        initiator: i64,
    ) -> Result<i64>;

    fn lease_compaction(&self, tablet_id: i64, lease_id: i64) -> Result<()>;

    /// Record a compaction as preparing: reserves the output version range.
    fn prepare_compaction(
        &self,
        tablet_id: i64,
        compaction_type: CompactionType,
        input_versions: Version,
    ) -> Result<()>;

    fn commit_compaction(
        &self,
        tablet_id: i64,
        compaction_type: CompactionType,
        lease_id: i64,
        output: &RowsetMeta,
    ) -> Result<()>;

    fn register_compaction_stop_token(&self, tablet_id: i64, initiator: i64) -> Result<()>;

    fn unregister_compaction_stop_token(&self, tablet_id: i64) -> Result<()>;

    fn lease_compaction_stop_token(&self, tablet_id: i64, initiator: i64) -> Result<()>;

    /// Rowsets the tablet is missing locally, i.e. with versions above
    /// `from_version`. Used by the tablet sync loop.
    fn get_tablet_rowsets(&self, tablet_id: i64, from_version: i64) -> Result<Vec<RowsetMeta>>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use crate::core::error::Error;

    /// In-memory metadata service for tests: grants leases, records calls,
    /// and can be told to fail specific RPCs.
    #[derive(Default)]
    pub struct MockMetaService {
        pub vault_infos: Mutex<Vec<(String, VaultInfo, PathFormat)>>,
        pub enable_storage_vault: AtomicBool,
        pub published: Mutex<Vec<(i64, i64, i64, Version)>>,
        pub fail_publish: AtomicBool,
        pub deny_global_lock: AtomicBool,
        pub lease_counter: AtomicI64,
        pub leases_renewed: AtomicUsize,
        pub prepared: Mutex<Vec<(i64, CompactionType, Version)>>,
        pub committed: Mutex<Vec<(i64, CompactionType, RowsetMeta)>>,
        pub stop_tokens: Mutex<HashMap<i64, i64>>,
        pub remote_rowsets: Mutex<HashMap<i64, Vec<RowsetMeta>>>,
    }

    impl MetaService for MockMetaService {
        fn get_storage_vault_info(
            &self,
        ) -> Result<(Vec<(String, VaultInfo, PathFormat)>, bool)> {
            Ok((
                self.vault_infos.lock().clone(),
                self.enable_storage_vault.load(Ordering::SeqCst),
            ))
        }

        fn publish_txn(
            &self,
            partition_id: i64,
            tablet_id: i64,
            txn_id: i64,
            version: Version,
        ) -> Result<PendingRowsetGuard> {
            if self.fail_publish.load(Ordering::SeqCst) {
                return Err(Error::internal("injected publish failure"));
            }
            self.published.lock().push((partition_id, tablet_id, txn_id, version));
            Ok(PendingRowsetGuard::empty())
        }

        fn request_compaction_global_lock(
            &self,
            tablet_id: i64,
            _compaction_type: CompactionType,
            _initiator: i64,
        ) -> Result<i64> {
            if self.deny_global_lock.load(Ordering::SeqCst) {
                return Err(Error::already_exists(format!(
                    "compaction lock held elsewhere, tablet_id={tablet_id}"
                )));
            }
            if self.stop_tokens.lock().contains_key(&tablet_id) {
                return Err(Error::already_exists(format!(
                    "compaction stopped by token, tablet_id={tablet_id}"
                )));
            }
            Ok(self.lease_counter.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn lease_compaction(&self, _tablet_id: i64, _lease_id: i64) -> Result<()> {
            self.leases_renewed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn prepare_compaction(
            &self,
            tablet_id: i64,
            compaction_type: CompactionType,
            input_versions: Version,
        ) -> Result<()> {
            self.prepared.lock().push((tablet_id, compaction_type, input_versions));
            Ok(())
        }

        fn commit_compaction(
            &self,
            tablet_id: i64,
            compaction_type: CompactionType,
            _lease_id: i64,
            output: &RowsetMeta,
        ) -> Result<()> {
            self.committed.lock().push((tablet_id, compaction_type, output.clone()));
            Ok(())
        }

        fn register_compaction_stop_token(&self, tablet_id: i64, initiator: i64) -> Result<()> {
            self.stop_tokens.lock().insert(tablet_id, initiator);
            Ok(())
        }

        fn unregister_compaction_stop_token(&self, tablet_id: i64) -> Result<()> {
            if self.stop_tokens.lock().remove(&tablet_id).is_none() {
                return Err(Error::not_found(format!(
                    "stop token not found for tablet_id={tablet_id}"
                )));
            }
            Ok(())
        }

        fn lease_compaction_stop_token(&self, _tablet_id: i64, _initiator: i64) -> Result<()> {
            self.leases_renewed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn get_tablet_rowsets(
            &self,
            tablet_id: i64,
            from_version: i64,
        ) -> Result<Vec<RowsetMeta>> {
            Ok(self
                .remote_rowsets
                .lock()
                .get(&tablet_id)
                .map(|rowsets| {
                    rowsets
                        .iter()
                        .filter(|rs| rs.version.start > from_version)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }
    }
}
