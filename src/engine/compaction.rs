use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::engine::meta_service::MetaService;
use crate::engine::tablet::Tablet;
use crate::meta::rowset::{RowsetId, RowsetMeta, Version};
use crate::meta::tablet_meta::{
    COMPACTION_POLICY_SIZE_BASED, COMPACTION_POLICY_TIME_SERIES, TabletMeta,
};
use crate::vault::filesystem::VaultFileSystem;
use crate::vault::registry::StorageVaultRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompactionType {
    Base,
    Cumulative,
    Full,
}

impl fmt::Display for CompactionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CompactionType::Base => write!(f, "base"),
            CompactionType::Cumulative => write!(f, "cumulative"),
            CompactionType::Full => write!(f, "full"),
        }
    }
}

/// Picks the input rowsets of one cumulative compaction. Candidates are the
/// live rowsets at or above the cumulative layer point, version-ordered and
/// cut at the first gap.
pub trait CumulativeCompactionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn pick_input_rowsets(
        &self,
        meta: &TabletMeta,
        config: &Config,
    ) -> Result<Vec<Arc<RowsetMeta>>>;
}

/// Contiguous candidate run above the cumulative point, truncated at the
/// first delete-predicate rowset. An immediate delete predicate means the
/// point must move past it first.
fn cumulative_candidates(meta: &TabletMeta) -> Result<Vec<Arc<RowsetMeta>>> {
    let point = meta.cumulative_layer_point.max(0);
    let mut candidates: Vec<Arc<RowsetMeta>> = meta
        .rs_metas()
        .iter()
        .filter(|rs| rs.start_version() >= point)
        .cloned()
        .collect();
    candidates.sort_by_key(|rs| rs.version);

    let mut run: Vec<Arc<RowsetMeta>> = Vec::new();
    for rs in candidates {
        if let Some(last) = run.last() {
            if rs.start_version() != last.end_version() + 1 {
                break;
            }
        }
        if rs.has_delete_predicate {
            if run.is_empty() {
                return Err(Error::cumulative_meet_delete_version(format!(
                    "delete predicate at version {}, tablet={}",
                    rs.version,
                    meta.tablet_id
                )));
            }
            break;
        }
        run.push(rs);
    }
    Ok(run)
}

pub struct SizeBasedCumulativeCompactionPolicy;

impl CumulativeCompactionPolicy for SizeBasedCumulativeCompactionPolicy {
    fn name(&self) -> &'static str {
        COMPACTION_POLICY_SIZE_BASED
    }

    fn pick_input_rowsets(
        &self,
        meta: &TabletMeta,
        config: &Config,
    ) -> Result<Vec<Arc<RowsetMeta>>> {
        let mut run = cumulative_candidates(meta)?;
        if run.len() < config.cumu_compaction_min_rowset_num {
            return Err(Error::cumulative_no_suitable_version(format!(
                "{} candidate rowsets < {} required, tablet={}",
                run.len(),
                config.cumu_compaction_min_rowset_num,
                meta.tablet_id
            )));
        }
        run.truncate(config.cumu_compaction_max_rowset_num);
        Ok(run)
    }
}

pub struct TimeSeriesCumulativeCompactionPolicy;

impl CumulativeCompactionPolicy for TimeSeriesCumulativeCompactionPolicy {
    fn name(&self) -> &'static str {
        COMPACTION_POLICY_TIME_SERIES
    }

    fn pick_input_rowsets(
        &self,
        meta: &TabletMeta,
        config: &Config,
    ) -> Result<Vec<Arc<RowsetMeta>>> {
        let run = cumulative_candidates(meta)?;
        if run.len() < 2 {
            return Err(Error::cumulative_no_suitable_version(format!(
                "{} candidate rowsets, tablet={}",
                run.len(),
                meta.tablet_id
            )));
        }
        let ts = &meta.time_series_compaction;
        let goal_bytes = (ts.goal_size_mbytes as u64) * 1024 * 1024;

        // Reached the goal size: compact the prefix that fills it.
        let mut total = 0u64;
        for (i, rs) in run.iter().enumerate() {
            total += rs.total_size_bytes;
            if total >= goal_bytes {
                let mut picked = run.clone();
                picked.truncate(i + 1);
                return Ok(picked);
            }
        }
        // Too many files outstanding.
        if run.len() as i64 >= ts.file_count_threshold {
            let mut picked = run;
            picked.truncate(config.cumu_compaction_max_rowset_num);
            return Ok(picked);
        }
        // Oldest candidate has waited long enough.
        let oldest_age = Utc::now() - run[0].creation_time;
        if oldest_age.num_seconds() >= ts.time_threshold_seconds {
            return Ok(run);
        }
        // A run of empty rowsets is pure version-count pressure.
        let empty_run = run.iter().take_while(|rs| rs.num_rows == 0).count();
        if empty_run as i64 >= ts.empty_rowsets_threshold {
            let mut picked = run;
            picked.truncate(empty_run);
            return Ok(picked);
        }
        Err(Error::cumulative_no_suitable_version(format!(
            "time series thresholds not met, tablet={}, candidates={}, bytes={}",
            meta.tablet_id,
            run.len(),
            total
        )))
    }
}

pub fn default_cumulative_policies() -> HashMap<String, Arc<dyn CumulativeCompactionPolicy>> {
    let mut policies: HashMap<String, Arc<dyn CumulativeCompactionPolicy>> = HashMap::new();
    policies.insert(
        COMPACTION_POLICY_SIZE_BASED.to_string(),
        Arc::new(SizeBasedCumulativeCompactionPolicy),
    );
    policies.insert(
        COMPACTION_POLICY_TIME_SERIES.to_string(),
        Arc::new(TimeSeriesCumulativeCompactionPolicy),
    );
    policies
}

/// The external segment compactor: streams input rowsets, writes merged
/// segments through the vault filesystem, returns the output rowset meta.
pub trait RowsetCompactor: Send + Sync {
    fn merge(
        &self,
        tablet: &Tablet,
        inputs: &[Arc<RowsetMeta>],
        output_version: Version,
        fs: Option<&VaultFileSystem>,
    ) -> Result<RowsetMeta>;
}

/// Everything a compaction task needs besides its tablet.
pub struct CompactionContext {
    pub config: Arc<Config>,
    pub meta_service: Arc<dyn MetaService>,
    pub vaults: Arc<StorageVaultRegistry>,
    pub compactor: Arc<dyn RowsetCompactor>,
    pub policies: HashMap<String, Arc<dyn CumulativeCompactionPolicy>>,
    /// Node identity sent with global-lock and stop-token requests.
    pub initiator: i64,
}

impl CompactionContext {
    /// Unknown policy names fall back to the size-based default.
    pub fn cumu_policy(&self, name: &str) -> Arc<dyn CumulativeCompactionPolicy> {
        self.policies
            .get(name)
            .or_else(|| self.policies.get(COMPACTION_POLICY_SIZE_BASED))
            .cloned()
            .unwrap_or_else(|| Arc::new(SizeBasedCumulativeCompactionPolicy))
    }
}

/// One in-flight compaction over one tablet: prepare picks inputs and
/// reserves the output range, the global lease serializes against other
/// nodes, execute merges and swaps rowsets.
pub struct CompactionTask {
    compaction_type: CompactionType,
    tablet: Arc<Tablet>,
    ctx: Arc<CompactionContext>,
    input_rowsets: Mutex<Vec<Arc<RowsetMeta>>>,
    output_version: Mutex<Option<Version>>,
    lease_id: AtomicI64,
    start_time: Instant,
}

impl CompactionTask {
    pub fn new(
        compaction_type: CompactionType,
        tablet: Arc<Tablet>,
        ctx: Arc<CompactionContext>,
    ) -> Self {
        CompactionTask {
            compaction_type,
            tablet,
            ctx,
            input_rowsets: Mutex::new(Vec::new()),
            output_version: Mutex::new(None),
            lease_id: AtomicI64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn compaction_type(&self) -> CompactionType {
        self.compaction_type
    }

    pub fn tablet(&self) -> &Arc<Tablet> {
        &self.tablet
    }

    pub fn input_rowsets_bytes(&self) -> u64 {
        self.input_rowsets.lock().iter().map(|rs| rs.total_size_bytes).sum()
    }

    pub fn input_num_rows(&self) -> u64 {
        self.input_rowsets.lock().iter().map(|rs| rs.num_rows).sum()
    }

    pub fn input_rowset_ids(&self) -> Vec<RowsetId> {
        self.input_rowsets.lock().iter().map(|rs| rs.rowset_id).collect()
    }

    pub fn output_version(&self) -> Option<Version> {
        *self.output_version.lock()
    }

    /// Validate the version set, pick input rowsets and write the
    /// "preparing" record to the metadata service.
    pub fn prepare_compact(&self) -> Result<()> {
        let inputs = {
            let meta = self.tablet.meta();
            match self.compaction_type {
                CompactionType::Cumulative => {
                    let policy = self.ctx.cumu_policy(&meta.compaction_policy);
                    policy.pick_input_rowsets(&meta, &self.ctx.config)?
                }
                CompactionType::Base => {
                    let point = meta.cumulative_layer_point;
                    let mut inputs: Vec<Arc<RowsetMeta>> = meta
                        .rs_metas()
                        .iter()
                        .filter(|rs| point >= 0 && rs.end_version() < point)
                        .cloned()
                        .collect();
                    inputs.sort_by_key(|rs| rs.version);
                    if inputs.len() < self.ctx.config.base_compaction_min_rowset_num {
                        return Err(Error::no_suitable_version(format!(
                            "{} rowsets below cumulative point {}, tablet={}",
                            inputs.len(),
                            point,
                            meta.tablet_id
                        )));
                    }
                    inputs
                }
                CompactionType::Full => {
                    let mut inputs: Vec<Arc<RowsetMeta>> = meta.rs_metas().to_vec();
                    inputs.sort_by_key(|rs| rs.version);
                    if inputs.len() < 2 {
                        return Err(Error::no_suitable_version(format!(
                            "{} live rowsets, tablet={}",
                            inputs.len(),
                            meta.tablet_id
                        )));
                    }
                    inputs
                }
            }
        };

        let output_version = Version::new(
            inputs[0].start_version(),
            inputs[inputs.len() - 1].end_version(),
        );
        self.ctx.meta_service.prepare_compaction(
            self.tablet.tablet_id(),
            self.compaction_type,
            output_version,
        )?;
        *self.input_rowsets.lock() = inputs;
        *self.output_version.lock() = Some(output_version);
        Ok(())
    }

    /// Acquire the cluster-wide compaction lease for this tablet.
    pub fn request_global_lock(&self) -> Result<()> {
        let lease_id = self.ctx.meta_service.request_compaction_global_lock(
            self.tablet.tablet_id(),
            self.compaction_type,
            self.ctx.initiator,
        )?;
        self.lease_id.store(lease_id, Ordering::Release);
        Ok(())
    }

    /// Merge inputs into the output rowset, commit it and swap it into the
    /// tablet. The output occupies `[min_input.start, max_input.end]`.
    pub fn execute_compact(&self) -> Result<()> {
        let inputs = self.input_rowsets.lock().clone();
        let output_version = self.output_version().ok_or_else(|| {
            Error::internal(format!(
                "compaction executed before prepare, tablet={}",
                self.tablet.tablet_id()
            ))
        })?;

        let fs = self.ctx.vaults.latest_fs();
        let output = self.ctx.compactor.merge(
            &self.tablet,
            &inputs,
            output_version,
            fs.as_deref(),
        )?;
        self.ctx.meta_service.commit_compaction(
            self.tablet.tablet_id(),
            self.compaction_type,
            self.lease_id.load(Ordering::Acquire),
            &output,
        )?;

        let output = Arc::new(output);
        {
            let mut meta = self.tablet.meta_mut();
            meta.modify_rowsets(vec![output.clone()], &inputs, false);
            if meta.enable_merge_on_write() {
                // Input bitmaps are folded into the output by the compactor;
                // the leftovers would only shadow live keys.
                for rs in &inputs {
                    meta.remove_rowset_delete_bitmap(&rs.rowset_id);
                }
                meta.clear_stale_rowsets();
            }
            match self.compaction_type {
                CompactionType::Cumulative | CompactionType::Full => {
                    if output.end_version() + 1 > meta.cumulative_layer_point {
                        meta.set_cumulative_layer_point(output.end_version() + 1);
                    }
                }
                CompactionType::Base => {}
            }
        }
        info!(
            tablet_id = self.tablet.tablet_id(),
            compaction_type = %self.compaction_type,
            input_rowsets = inputs.len(),
            output_version = %output.version,
            elapsed_ms = self.start_time.elapsed().as_millis() as u64,
            "compaction finished"
        );
        Ok(())
    }

    /// Renew the server-side lease; called from the lease loop. Best effort.
    pub fn do_lease(&self) {
        let lease_id = self.lease_id.load(Ordering::Acquire);
        if lease_id <= 0 {
            return;
        }
        if let Err(e) = self.ctx.meta_service.lease_compaction(self.tablet.tablet_id(), lease_id) {
            warn!(
                tablet_id = self.tablet.tablet_id(),
                compaction_type = %self.compaction_type,
                error = %e,
                "failed to renew compaction lease"
            );
        }
    }
}

/// Tablet-scoped directive halting background compaction until revoked.
pub struct CompactionStopToken {
    tablet: Arc<Tablet>,
    initiator: i64,
    meta_service: Arc<dyn MetaService>,
}

impl CompactionStopToken {
    pub fn new(tablet: Arc<Tablet>, initiator: i64, meta_service: Arc<dyn MetaService>) -> Self {
        CompactionStopToken { tablet, initiator, meta_service }
    }

    pub fn initiator(&self) -> i64 {
        self.initiator
    }

    pub fn tablet_id(&self) -> i64 {
        self.tablet.tablet_id()
    }

    pub fn do_register(&self) -> Result<()> {
        self.meta_service
            .register_compaction_stop_token(self.tablet.tablet_id(), self.initiator)
    }

    pub fn do_unregister(&self) -> Result<()> {
        self.meta_service.unregister_compaction_stop_token(self.tablet.tablet_id())
    }

    pub fn do_lease(&self) {
        if let Err(e) = self
            .meta_service
            .lease_compaction_stop_token(self.tablet.tablet_id(), self.initiator)
        {
            warn!(tablet_id = self.tablet.tablet_id(), error = %e, "failed to lease stop token");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::engine::meta_service::testing::MockMetaService;
    use crate::vault::filesystem::InMemoryClient;

    /// Fabricates the merged rowset: sums rows and bytes, writes one marker
    /// object per merge when a vault is available.
    #[derive(Default)]
    pub struct MockCompactor {
        pub merges: AtomicUsize,
    }

    impl RowsetCompactor for MockCompactor {
        fn merge(
            &self,
            tablet: &Tablet,
            inputs: &[Arc<RowsetMeta>],
            output_version: Version,
            fs: Option<&VaultFileSystem>,
        ) -> Result<RowsetMeta> {
            self.merges.fetch_add(1, Ordering::SeqCst);
            let mut output =
                RowsetMeta::new(RowsetId::generate(), tablet.tablet_id(), output_version);
            output.num_rows = inputs.iter().map(|rs| rs.num_rows).sum();
            output.total_size_bytes = inputs.iter().map(|rs| rs.total_size_bytes).sum();
            output.num_segments = 1;
            if let Some(fs) = fs {
                fs.write(
                    &format!("data/{}/{}_0.dat", tablet.tablet_id(), output.rowset_id),
                    b"merged",
                )?;
            }
            Ok(output)
        }
    }

    pub fn test_context(config: Config) -> (Arc<CompactionContext>, Arc<MockMetaService>) {
        let meta_service = Arc::new(MockMetaService::default());
        let ctx = Arc::new(CompactionContext {
            config: Arc::new(config),
            meta_service: meta_service.clone(),
            vaults: Arc::new(StorageVaultRegistry::new(InMemoryClient::factory())),
            compactor: Arc::new(MockCompactor::default()),
            policies: default_cumulative_policies(),
            initiator: 7,
        });
        (ctx, meta_service)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::test_context;
    use super::*;
    use crate::meta::tablet_meta::testing::{create_request, rowset_at};

    fn tablet(tablet_id: i64, merge_on_write: bool, versions: &[(i64, i64)]) -> Arc<Tablet> {
        let mut meta = TabletMeta::create_from_request(&create_request(tablet_id, merge_on_write));
        for (start, end) in versions {
            meta.add_rowset(rowset_at(tablet_id, *start, *end)).unwrap();
        }
        meta.set_cumulative_layer_point(0);
        Arc::new(Tablet::new(meta))
    }

    fn small_config() -> Config {
        Config { cumu_compaction_min_rowset_num: 2, ..Config::default() }
    }

    #[test]
    fn test_size_based_policy_requires_enough_rowsets() {
        let t = tablet(30, false, &[(0, 0)]);
        let policy = SizeBasedCumulativeCompactionPolicy;
        let err = policy.pick_input_rowsets(&t.meta(), &small_config()).unwrap_err();
        assert!(err.is(crate::core::error::ErrorKind::CumulativeNoSuitableVersion));
    }

    #[test]
    fn test_size_based_policy_stops_at_gap() {
        let t = tablet(31, false, &[(0, 0), (1, 1), (3, 3), (4, 4)]);
        let policy = SizeBasedCumulativeCompactionPolicy;
        let picked = policy.pick_input_rowsets(&t.meta(), &small_config()).unwrap();
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[1].version, Version::new(1, 1));
    }

    #[test]
    fn test_size_based_policy_meets_delete_version() {
        let mut meta = TabletMeta::create_from_request(&create_request(32, false));
        let mut rs = (*rowset_at(32, 0, 0)).clone();
        rs.has_delete_predicate = true;
        meta.add_rowset(Arc::new(rs)).unwrap();
        meta.add_rowset(rowset_at(32, 1, 1)).unwrap();
        meta.set_cumulative_layer_point(0);

        let policy = SizeBasedCumulativeCompactionPolicy;
        let err = policy.pick_input_rowsets(&meta, &small_config()).unwrap_err();
        assert!(err.is(crate::core::error::ErrorKind::CumulativeMeetDeleteVersion));
    }

    #[test]
    fn test_policy_lookup_falls_back_to_size_based() {
        let (ctx, _) = test_context(Config::default());
        assert_eq!(ctx.cumu_policy("no_such_policy").name(), COMPACTION_POLICY_SIZE_BASED);
        assert_eq!(
            ctx.cumu_policy(COMPACTION_POLICY_TIME_SERIES).name(),
            COMPACTION_POLICY_TIME_SERIES
        );
    }

    #[test]
    fn test_prepare_and_execute_cumulative() {
        let (ctx, ms) = test_context(small_config());
        let t = tablet(33, false, &[(0, 0), (1, 1), (2, 2)]);
        let task = CompactionTask::new(CompactionType::Cumulative, t.clone(), ctx);
        task.prepare_compact().unwrap();
        assert_eq!(task.output_version(), Some(Version::new(0, 2)));
        assert_eq!(ms.prepared.lock().len(), 1);

        task.request_global_lock().unwrap();
        task.execute_compact().unwrap();
        assert_eq!(ms.committed.lock().len(), 1);

        let meta = t.meta();
        assert_eq!(meta.rs_metas().len(), 1);
        assert_eq!(meta.rs_metas()[0].version, Version::new(0, 2));
        assert_eq!(meta.stale_rs_metas().len(), 3);
        assert_eq!(meta.cumulative_layer_point, 3);
    }

    #[test]
    fn test_execute_mow_drops_input_bitmaps_and_stale() {
        let (ctx, _) = test_context(small_config());
        let t = tablet(34, true, &[(0, 0), (1, 1)]);
        let first_id = t.meta().rs_metas()[0].rowset_id;
        t.meta().delete_bitmap().set(&(first_id, 0, 1), [4u32].into_iter().collect());

        let task = CompactionTask::new(CompactionType::Cumulative, t.clone(), ctx);
        task.prepare_compact().unwrap();
        task.request_global_lock().unwrap();
        task.execute_compact().unwrap();

        let meta = t.meta();
        assert!(meta.stale_rs_metas().is_empty());
        assert!(meta.delete_bitmap().get(&(first_id, 0, 1)).is_none());
    }

    #[test]
    fn test_base_compaction_needs_region_below_point() {
        let (ctx, _) = test_context(Config::default());
        let t = tablet(35, false, &[(0, 0), (1, 1), (2, 2)]);
        // Point at 0: nothing below it.
        let task = CompactionTask::new(CompactionType::Base, t.clone(), ctx.clone());
        let err = task.prepare_compact().unwrap_err();
        assert!(err.is(crate::core::error::ErrorKind::BeNoSuitableVersion));

        t.meta_mut().set_cumulative_layer_point(2);
        let task = CompactionTask::new(CompactionType::Base, t, ctx);
        task.prepare_compact().unwrap();
        assert_eq!(task.output_version(), Some(Version::new(0, 1)));
    }

    #[test]
    fn test_stop_token_round_trip() {
        let (ctx, ms) = test_context(Config::default());
        let t = tablet(36, false, &[(0, 0)]);
        let token = CompactionStopToken::new(t, 9, ctx.meta_service.clone());
        token.do_register().unwrap();
        assert_eq!(ms.stop_tokens.lock().get(&36), Some(&9));

        // Compactions cannot take the global lock while the token is live.
        assert!(
            ctx.meta_service
                .request_compaction_global_lock(36, CompactionType::Cumulative, 7)
                .is_err()
        );
        token.do_unregister().unwrap();
        assert!(token.do_unregister().is_err());
    }
}
