use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::metrics::EngineMetrics;
use crate::engine::storage_engine::StorageEngine;
use crate::engine::tablet::Tablet;
use crate::meta::rowset::{RowsetMeta, Version};
use crate::meta::tablet_meta::TabletState;

#[derive(Debug, Clone)]
pub struct PartitionVersionInfo {
    pub partition_id: i64,
    pub version: i64,
    /// Tablets whose row deltas are reported back to the frontend; rollup
    /// tablets are excluded.
    pub base_tablet_ids: BTreeSet<i64>,
}

#[derive(Debug, Clone)]
pub struct PublishVersionRequest {
    pub txn_id: i64,
    pub partitions: Vec<PartitionVersionInfo>,
    pub strict_mode: bool,
}

pub struct PublishVersionResult {
    pub error_tablet_ids: BTreeSet<i64>,
    pub succ_tablets: BTreeMap<i64, i64>,
    /// `(partition_id, tablet_id, version)` gaps small enough for the
    /// frontend to retry directly.
    pub discontinuous_version_tablets: Vec<(i64, i64, i64)>,
    pub table_delta_rows: BTreeMap<i64, BTreeMap<i64, i64>>,
    pub status: Result<()>,
}

#[derive(Default)]
pub struct TabletPublishStatistics {
    pub schedule_us: u64,
    pub lock_wait_us: u64,
    pub save_meta_us: u64,
    pub calc_delete_bitmap_us: u64,
    pub partial_update_us: u64,
    pub add_inc_rowset_us: u64,
}

impl TabletPublishStatistics {
    pub fn record_in_metrics(&self) {
        let metrics = EngineMetrics::instance();
        metrics.publish_schedule_latency.record(self.schedule_us);
        metrics.publish_lock_wait_latency.record(self.lock_wait_us);
        metrics.publish_save_meta_latency.record(self.save_meta_us);
        metrics.publish_delete_bitmap_latency.record(self.calc_delete_bitmap_us);
        metrics.publish_partial_update_latency.record(self.partial_update_us);
        metrics.publish_add_inc_rowset_latency.record(self.add_inc_rowset_us);
    }
}

#[derive(Default)]
struct PublishState {
    error_tablet_ids: Mutex<BTreeSet<i64>>,
}

impl PublishState {
    fn add_error_tablet(&self, tablet_id: i64) {
        self.error_tablet_ids.lock().insert(tablet_id);
    }
}

/// Outcome slot for one fanned-out tablet task, kept in submission order so
/// the overall status does not depend on thread scheduling.
type TaskResult = Arc<Mutex<Option<Error>>>;

/// Fan a publish request out across its partitions and tablets, wait for the
/// per-tablet tasks to drain, then confirm every related tablet actually
/// carries the version.
pub fn publish_version(
    engine: &Arc<StorageEngine>,
    request: &PublishVersionRequest,
) -> PublishVersionResult {
    let start = Instant::now();
    let txn_id = request.txn_id;
    let state = Arc::new(PublishState::default());
    let token = engine.publish_pool().new_token();
    let mut res: Result<()> = Ok(());
    let mut discontinuous_version_tablets = Vec::new();
    let mut tablet_delta_rows: HashMap<i64, i64> = HashMap::new();
    let mut tablet_tasks: Vec<TaskResult> = Vec::new();

    for partition in &request.partitions {
        let partition_id = partition.partition_id;
        let related = engine.tablet_mgr().get_partition_related_tablets(partition_id);
        if request.strict_mode && related.is_empty() {
            info!(partition_id, txn_id, "no related tablet for partition, skip publish");
            continue;
        }
        let bindings = engine.txn_mgr().get_txn_related_tablets(txn_id, partition_id);
        let version = Version::single(partition.version);

        for (tablet_id, rowset) in bindings {
            // A missing rowset means this node accepted the write task but
            // failed during write; the publish must surface the tablet.
            let Some(rowset) = rowset else {
                state.add_error_tablet(tablet_id);
                res = Err(Error::new(
                    ErrorKind::PushRowsetNotFound,
                    format!("could not find related rowset for tablet {tablet_id}, txn {txn_id}"),
                ));
                continue;
            };
            let Ok(tablet) = engine.tablet_mgr().get_tablet(tablet_id) else {
                state.add_error_tablet(tablet_id);
                res = Err(Error::new(
                    ErrorKind::PushTableNotExist,
                    format!("can't get tablet when publish version, tablet_id={tablet_id}"),
                ));
                continue;
            };

            // Merge-on-write must observe every prior version before its
            // delete bitmap is updated, so versions publish in order.
            if tablet.enable_merge_on_write() {
                let first_time_update =
                    engine.txn_mgr().get_txn_by_tablet_version(tablet_id, version.end).is_none();
                if first_time_update {
                    engine.txn_mgr().update_tablet_version_txn(tablet_id, version.end, txn_id);
                }
                let (max_version, tablet_state) = {
                    let meta = tablet.meta();
                    (meta.max_version().end, meta.tablet_state())
                };
                if version.start != max_version + 1 {
                    if tablet.check_version_exists(version) {
                        // Duplicate publish: drop the binding and count the
                        // tablet as done.
                        engine.txn_mgr().remove_txn_tablet(txn_id, partition_id, tablet_id);
                        continue;
                    }
                    let discontinuous = if tablet_state == TabletState::NotReady {
                        // Versions stay continuous through a schema change;
                        // only flag the gap once the continuous prefix has
                        // already fallen behind.
                        let max_continuous =
                            tablet.meta().max_continuous_version_from_beginning();
                        max_version > 1
                            && version.start > max_version
                            && max_continuous.end != max_version
                    } else {
                        true
                    };
                    if discontinuous {
                        res = Err(handle_version_not_continuous(
                            engine,
                            &state,
                            &mut discontinuous_version_tablets,
                            partition_id,
                            tablet_id,
                            txn_id,
                            max_version,
                            version,
                            first_time_update,
                        ));
                        continue;
                    }
                }
            }

            if partition.base_tablet_ids.contains(&tablet_id) {
                tablet_delta_rows.insert(tablet_id, rowset.num_rows as i64);
            }

            let engine = engine.clone();
            let state_for_task = state.clone();
            let task_result: TaskResult = Arc::new(Mutex::new(None));
            tablet_tasks.push(task_result.clone());
            let submit_time = Instant::now();
            let submit_result = token.submit(move || {
                tablet_publish_txn_task(
                    &engine,
                    &tablet,
                    rowset,
                    partition_id,
                    txn_id,
                    version,
                    &state_for_task,
                    &task_result,
                    submit_time,
                );
            });
            if let Err(e) = submit_result {
                state.add_error_tablet(tablet_id);
                res = Err(e);
            }
        }
    }
    token.wait();

    // First failure in submission order wins, so the surfaced status is the
    // same on every run regardless of how the pool scheduled the tasks.
    if res.is_ok() {
        for task_result in &tablet_tasks {
            if let Some(task_error) = task_result.lock().take() {
                res = Err(task_error);
                break;
            }
        }
    }

    // Confirmation pass: every partition-related tablet must now carry the
    // version, whether or not this request bound a rowset for it.
    let mut succ_tablets = BTreeMap::new();
    for partition in &request.partitions {
        let version = Version::single(partition.version);
        for tablet in engine.tablet_mgr().get_partition_related_tablets(partition.partition_id) {
            let tablet_id = tablet.tablet_id();
            if state.error_tablet_ids.lock().contains(&tablet_id) {
                continue;
            }
            if tablet.check_version_exists(version) {
                succ_tablets.insert(tablet_id, 0);
            } else {
                state.add_error_tablet(tablet_id);
                let is_gap = matches!(&res, Err(e) if e.is(ErrorKind::PublishVersionNotContinuous));
                if !is_gap {
                    warn!(
                        txn_id,
                        tablet_id,
                        version = partition.version,
                        "publish version failed, tablet version not exists"
                    );
                }
            }
        }
    }

    let mut table_delta_rows: BTreeMap<i64, BTreeMap<i64, i64>> = BTreeMap::new();
    for (tablet_id, rows) in tablet_delta_rows {
        if rows <= 0 {
            continue;
        }
        let Ok(tablet) = engine.tablet_mgr().get_tablet(tablet_id) else {
            warn!(tablet_id, "cannot resolve tablet for delta row report");
            continue;
        };
        *table_delta_rows
            .entry(tablet.table_id())
            .or_default()
            .entry(tablet_id)
            .or_insert(0) += rows;
    }

    let error_tablet_ids = state.error_tablet_ids.lock().clone();
    let is_gap = matches!(&res, Err(e) if e.is(ErrorKind::PublishVersionNotContinuous));
    if !is_gap {
        info!(
            txn_id,
            cost_us = start.elapsed().as_micros() as u64,
            error_tablet_size = error_tablet_ids.len(),
            "finish to publish version on transaction"
        );
    }
    PublishVersionResult {
        error_tablet_ids,
        succ_tablets,
        discontinuous_version_tablets,
        table_delta_rows,
        status: res,
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_version_not_continuous(
    engine: &Arc<StorageEngine>,
    state: &PublishState,
    discontinuous_version_tablets: &mut Vec<(i64, i64, i64)>,
    partition_id: i64,
    tablet_id: i64,
    txn_id: i64,
    max_version: i64,
    version: Version,
    first_time_update: bool,
) -> Error {
    let config = engine.config();
    if config.enable_clone_on_missing_version {
        engine.submit_clone_task(tablet_id, version.start - 1);
    }
    state.add_error_tablet(tablet_id);
    // A gap too wide for the frontend to retry goes to the async publish
    // queue instead; a non-positive threshold disables that path entirely.
    let max_gap = config.mow_publish_max_discontinuous_version_num;
    if max_gap > 0 && version.start > max_version + max_gap {
        engine.add_async_publish_task(partition_id, tablet_id, version.start, txn_id);
    } else {
        discontinuous_version_tablets.push((partition_id, tablet_id, version.start));
    }
    let threshold = config.publish_version_gap_logging_threshold;
    if threshold < 0 || max_version + threshold >= version.end {
        let missed_version = max_version + 1;
        let missed_txn_id = engine.txn_mgr().get_txn_by_tablet_version(tablet_id, missed_version);
        info!(
            tablet_id,
            txn_id,
            missed_version,
            missed_txn_id = missed_txn_id.unwrap_or(-1),
            publish_version = version.end,
            first_time_update,
            "merge-on-write publish version not continuous"
        );
    }
    Error::publish_version_not_continuous(format!(
        "version not continuous for mow, tablet_id={tablet_id}, tablet_max_version={max_version}, \
         txn_version={}",
        version.start
    ))
}

/// Per-tablet publish body, run on the publish pool: take the migration read
/// lock (bounded), the rowset-update lock for merge-on-write, then publish
/// the transaction and attach the rowset.
#[allow(clippy::too_many_arguments)]
fn tablet_publish_txn_task(
    engine: &Arc<StorageEngine>,
    tablet: &Arc<Tablet>,
    rowset: Arc<RowsetMeta>,
    partition_id: i64,
    txn_id: i64,
    version: Version,
    state: &PublishState,
    task_result: &Mutex<Option<Error>>,
    submit_time: Instant,
) {
    let succeeded = {
        let timeout = Duration::from_secs(engine.config().migration_lock_timeout_seconds);
        let lock_wait = Instant::now();
        let Some(_migration_guard) = tablet.migration_lock().try_read_for(timeout) else {
            state.add_error_tablet(tablet.tablet_id());
            *task_result.lock() = Some(Error::try_lock_failed(format!(
                "got migration lock failed, tablet_id={}, txn_id={txn_id}",
                tablet.tablet_id()
            )));
            warn!(
                tablet_id = tablet.tablet_id(),
                txn_id, "failed to take migration lock for publish"
            );
            return;
        };
        let _rowset_update_guard =
            tablet.enable_merge_on_write().then(|| tablet.rowset_update_lock().lock());

        let mut stats = TabletPublishStatistics {
            lock_wait_us: lock_wait.elapsed().as_micros() as u64,
            schedule_us: submit_time.elapsed().as_micros() as u64,
            ..Default::default()
        };
        match publish_version_and_add_rowset(
            engine,
            tablet,
            &rowset,
            partition_id,
            txn_id,
            version,
            &mut stats,
        ) {
            Ok(()) => {
                let cost_us = submit_time.elapsed().as_micros() as u64;
                EngineMetrics::instance().publish_latency.record(cost_us);
                stats.record_in_metrics();
                info!(
                    table_id = tablet.table_id(),
                    tablet_id = tablet.tablet_id(),
                    txn_id,
                    version = version.start,
                    num_rows = rowset.num_rows,
                    cost_us,
                    "publish version succeeded on tablet"
                );
                true
            }
            Err(e) => {
                state.add_error_tablet(tablet.tablet_id());
                *task_result.lock() = Some(e);
                false
            }
        }
    };
    // Outside the tablet locks: a queued async publish for the next version
    // may now be unblocked, and it retakes them itself.
    if succeeded {
        engine.process_async_publish(tablet);
    }
}

/// Publish the transaction through the metadata service, keep the pending
/// rowset guard alive across the attach, and append the rowset to the live
/// list. `VersionAlreadyExists` on the attach is success.
fn publish_version_and_add_rowset(
    engine: &Arc<StorageEngine>,
    tablet: &Arc<Tablet>,
    rowset: &Arc<RowsetMeta>,
    partition_id: i64,
    txn_id: i64,
    version: Version,
    stats: &mut TabletPublishStatistics,
) -> Result<()> {
    let _pending_guard = engine
        .meta_service()
        .publish_txn(partition_id, tablet.tablet_id(), txn_id, version)
        .map_err(|e| {
            warn!(
                rowset_id = %rowset.rowset_id,
                tablet_id = tablet.tablet_id(),
                txn_id,
                error = %e,
                "failed to publish version"
            );
            e
        })?;

    let start = Instant::now();
    let result = tablet.add_inc_rowset(rowset.clone());
    stats.add_inc_rowset_us = start.elapsed().as_micros() as u64;
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is(ErrorKind::VersionAlreadyExists) => Ok(()),
        Err(e) => {
            warn!(
                rowset_id = %rowset.rowset_id,
                tablet_id = tablet.tablet_id(),
                txn_id,
                error = %e,
                "failed to attach visible rowset to tablet"
            );
            Err(e)
        }
    }
}

/// Deferred publish for a version that arrived with missing predecessors.
/// Re-reads the tablet binding and aborts silently if it is gone.
pub(crate) fn run_async_publish_task(
    engine: &Arc<StorageEngine>,
    partition_id: i64,
    tablet_id: i64,
    version: i64,
    txn_id: i64,
) {
    let Ok(tablet) = engine.tablet_mgr().get_tablet(tablet_id) else {
        return;
    };
    let timeout = Duration::from_secs(engine.config().migration_lock_timeout_seconds);
    let Some(_migration_guard) = tablet.migration_lock().try_read_for(timeout) else {
        warn!(tablet_id, txn_id, "failed to take migration lock for async publish");
        return;
    };
    let _rowset_update_guard = tablet.rowset_update_lock().lock();

    let bindings = engine.txn_mgr().get_txn_related_tablets(txn_id, partition_id);
    let Some(Some(rowset)) = bindings.get(&tablet_id).cloned() else {
        return;
    };
    let version = Version::single(version);
    let mut stats = TabletPublishStatistics::default();
    if publish_version_and_add_rowset(
        engine,
        &tablet,
        &rowset,
        partition_id,
        txn_id,
        version,
        &mut stats,
    )
    .is_ok()
    {
        engine.txn_mgr().remove_txn_tablet(txn_id, partition_id, tablet_id);
        EngineMetrics::instance().publish_latency.record(stats.add_inc_rowset_us);
        stats.record_in_metrics();
        info!(
            tablet_id,
            txn_id,
            version = version.start,
            num_rows = rowset.num_rows,
            "async publish version succeeded on tablet"
        );
    }
}
