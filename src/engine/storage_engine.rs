use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::latch::CountDownLatch;
use crate::core::metrics::EngineMetrics;
use crate::engine::compaction::{
    CompactionContext, CompactionStopToken, CompactionTask, CompactionType, RowsetCompactor,
    default_cumulative_policies,
};
use crate::engine::meta_service::MetaService;
use crate::engine::publish;
use crate::engine::tablet::{Tablet, TabletManager};
use crate::engine::txn_manager::TxnManager;
use crate::meta::delete_bitmap::DeleteBitmapAggCache;
use crate::meta::tablet_meta::TabletState;
use crate::parallel::pool::ThreadPool;
use crate::vault::filesystem::ClientFactory;
use crate::vault::registry::StorageVaultRegistry;

const CLUSTER_ID_FILE: &str = "cluster_id";
const CHECK_SCORE_INTERVAL: Duration = Duration::from_secs(5);
// Tablets that reported no suitable cumulative version stay out of the
// candidate set this long.
const CUMU_NO_SUITABLE_VERSION_BACKOFF_MS: i64 = 5000;

fn get_cumu_thread_num(config: &Config) -> usize {
    if config.max_cumu_compaction_threads > 0 {
        return config.max_cumu_compaction_threads as usize;
    }
    let cores = num_cpus::get();
    ((cores as f64 * config.cumu_compaction_thread_num_factor) as usize).clamp(2, 20)
}

fn get_base_thread_num(config: &Config) -> usize {
    if config.max_base_compaction_threads > 0 {
        return config.max_base_compaction_threads as usize;
    }
    let cores = num_cpus::get();
    ((cores as f64 * config.base_compaction_thread_num_factor) as usize).clamp(1, 10)
}

/// Deterministic rule: a large task is delayed iff no small task is running
/// and the other in-flight tasks already occupy every slot but one, i.e.
/// admitting it would leave nothing a small task could take. `used_threads`
/// already counts the candidate.
pub(crate) fn should_delay_large_task(
    used_threads: usize,
    small_tasks_running: usize,
    max_threads: usize,
) -> bool {
    small_tasks_running == 0 && used_threads.saturating_sub(1) >= max_threads.saturating_sub(1)
}

#[derive(Default)]
struct CompactionState {
    preparing_cumu: HashSet<i64>,
    submitted_cumu: HashMap<i64, Vec<Arc<CompactionTask>>>,
    // Placeholder `None` reserves the slot before prepare finishes.
    submitted_base: HashMap<i64, Option<Arc<CompactionTask>>>,
    submitted_full: HashMap<i64, Option<Arc<CompactionTask>>>,
    executing_base: HashMap<i64, Arc<CompactionTask>>,
    executing_cumu: HashMap<i64, Vec<Arc<CompactionTask>>>,
    executing_full: HashMap<i64, Arc<CompactionTask>>,
    active_stop_tokens: HashMap<i64, Option<Arc<CompactionStopToken>>>,
}

#[derive(Default)]
struct CumuDelayState {
    used_threads: usize,
    small_tasks_running: usize,
}

/// Cloud-mode storage engine: owns the tablet registry, the vault registry,
/// the compaction scheduler with its two bounded pools, the publish fan-out
/// pool and the background loops.
pub struct StorageEngine {
    config: Arc<Config>,
    meta_service: Arc<dyn MetaService>,
    tablet_mgr: Arc<TabletManager>,
    txn_mgr: Arc<TxnManager>,
    vaults: Arc<StorageVaultRegistry>,
    compaction_ctx: Arc<CompactionContext>,

    base_pool: Arc<ThreadPool>,
    cumu_pool: Arc<ThreadPool>,
    publish_pool: Arc<ThreadPool>,
    calc_delete_bitmap_pool: Arc<ThreadPool>,

    stop_latch: Arc<CountDownLatch>,
    bg_threads: Mutex<Vec<thread::JoinHandle<()>>>,
    stopped: AtomicBool,

    compaction_state: Mutex<CompactionState>,
    cumu_delay: Mutex<CumuDelayState>,

    // (tablet_id, version) -> (partition_id, txn_id)
    async_publish_tasks: Mutex<BTreeMap<(i64, i64), (i64, i64)>>,
    pending_clone_tasks: Mutex<Vec<(i64, i64)>>,
    effective_cluster_id: Mutex<Option<i32>>,
}

impl StorageEngine {
    pub fn new(
        config: Config,
        meta_service: Arc<dyn MetaService>,
        compactor: Arc<dyn RowsetCompactor>,
        client_factory: ClientFactory,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let vaults = Arc::new(StorageVaultRegistry::new(client_factory));
        let compaction_ctx = Arc::new(CompactionContext {
            config: config.clone(),
            meta_service: meta_service.clone(),
            vaults: vaults.clone(),
            compactor,
            policies: default_cumulative_policies(),
            initiator: std::process::id() as i64,
        });
        Arc::new(StorageEngine {
            base_pool: Arc::new(ThreadPool::new(
                "base_compaction_pool",
                get_base_thread_num(&config),
            )),
            cumu_pool: Arc::new(ThreadPool::new(
                "cumu_compaction_pool",
                get_cumu_thread_num(&config),
            )),
            publish_pool: Arc::new(ThreadPool::new("publish_version_pool", 4)),
            calc_delete_bitmap_pool: Arc::new(ThreadPool::new("calc_delete_bitmap_pool", 2)),
            config,
            meta_service,
            tablet_mgr: Arc::new(TabletManager::new()),
            txn_mgr: Arc::new(TxnManager::new()),
            vaults,
            compaction_ctx,
            stop_latch: Arc::new(CountDownLatch::new(1)),
            bg_threads: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            compaction_state: Mutex::new(CompactionState::default()),
            cumu_delay: Mutex::new(CumuDelayState::default()),
            async_publish_tasks: Mutex::new(BTreeMap::new()),
            pending_clone_tasks: Mutex::new(Vec::new()),
            effective_cluster_id: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tablet_mgr(&self) -> &Arc<TabletManager> {
        &self.tablet_mgr
    }

    pub fn txn_mgr(&self) -> &Arc<TxnManager> {
        &self.txn_mgr
    }

    pub fn meta_service(&self) -> &Arc<dyn MetaService> {
        &self.meta_service
    }

    pub fn vaults(&self) -> &Arc<StorageVaultRegistry> {
        &self.vaults
    }

    pub fn publish_pool(&self) -> &Arc<ThreadPool> {
        &self.publish_pool
    }

    pub fn calc_delete_bitmap_pool(&self) -> &Arc<ThreadPool> {
        &self.calc_delete_bitmap_pool
    }

    /// First-boot setup: agg cache, vault sync, cluster-id validation.
    pub fn open(&self) -> Result<()> {
        DeleteBitmapAggCache::init(
            self.config.delete_bitmap_agg_cache_capacity,
            self.config.enable_agg_cache_version,
            self.config.enable_agg_correctness_check,
        );
        self.sync_storage_vaults();
        self.check_all_store_path_cluster_id()?;
        Ok(())
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Count the latch down, join every background loop and shut the pools
    /// down. In-flight tasks finish their current step and exit.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_latch.count_down();
        let threads = std::mem::take(&mut *self.bg_threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
        self.base_pool.shutdown();
        self.cumu_pool.shutdown();
        self.publish_pool.shutdown();
        self.calc_delete_bitmap_pool.shutdown();
        info!("cloud storage engine is stopped");
    }

    pub fn start_bg_threads(self: &Arc<Self>) {
        let mut threads = self.bg_threads.lock();

        let engine = self.clone();
        threads.push(spawn_loop("refresh_storage_vault_thread", move || {
            let interval = Duration::from_secs(engine.config.refresh_storage_vault_interval_s);
            while !engine.stop_latch.wait_for(interval) {
                engine.sync_storage_vaults();
            }
        }));
        info!("refresh storage vault thread started");

        let engine = self.clone();
        threads.push(spawn_loop("vacuum_stale_rowsets_thread", move || {
            let interval = Duration::from_secs(engine.config.vacuum_stale_rowsets_interval_s);
            while !engine.stop_latch.wait_for(interval) {
                engine.tablet_mgr.vacuum_stale_rowsets(&engine.stop_latch, &engine.config);
            }
        }));
        info!("vacuum stale rowsets thread started");

        let engine = self.clone();
        threads.push(spawn_loop("sync_tablets_thread", move || {
            let interval = Duration::from_secs(engine.config.sync_tablets_interval_s);
            while !engine.stop_latch.wait_for(interval) {
                engine.tablet_mgr.sync_tablets(&engine.stop_latch, engine.meta_service.as_ref());
            }
        }));
        info!("sync tablets thread started");

        let engine = self.clone();
        threads.push(spawn_loop("compaction_tasks_producer_thread", move || {
            engine.compaction_tasks_producer();
        }));
        info!(
            base_threads = get_base_thread_num(&self.config),
            cumu_threads = get_cumu_thread_num(&self.config),
            "compaction tasks producer thread started"
        );

        let engine = self.clone();
        threads.push(spawn_loop("lease_compaction_thread", move || {
            engine.lease_compaction_loop();
        }));
        info!("lease compaction thread started");

        let engine = self.clone();
        threads.push(spawn_loop("check_delete_bitmap_score_thread", move || {
            engine.check_delete_bitmap_score_loop();
        }));
        info!("check tablet delete bitmap score thread started");
    }

    // ---- storage vaults ----

    pub fn sync_storage_vaults(&self) {
        match self.meta_service.get_storage_vault_info() {
            Ok((vault_infos, enable_storage_vault)) => {
                self.vaults.sync(&vault_infos, enable_storage_vault, &self.config);
            }
            Err(e) => warn!(error = %e, "failed to get storage vault info"),
        }
    }

    // ---- cluster id ----

    /// Every store path must agree on one cluster id, and it must match the
    /// configured one when both exist.
    fn check_all_store_path_cluster_id(&self) -> Result<()> {
        let mut cluster_ids = BTreeSet::new();
        for path in &self.config.store_paths {
            let file = path.join(CLUSTER_ID_FILE);
            if !file.exists() {
                continue;
            }
            let content = fs::read_to_string(&file)?;
            let trimmed = content.trim();
            if trimmed.is_empty() {
                continue;
            }
            let id: i32 = trimmed.parse().map_err(|e| {
                Error::corruption(format!("malformed cluster id file {}: {e}", file.display()))
            })?;
            cluster_ids.insert(id);
        }

        let configured = self.config.cluster_id;
        if cluster_ids.is_empty() {
            if configured == -1 {
                return Ok(());
            }
            return self.set_cluster_id(configured);
        }
        if cluster_ids.len() > 1 {
            return Err(Error::internal(format!(
                "all store paths must have the same cluster id, got {cluster_ids:?}"
            )));
        }
        let Some(file_id) = cluster_ids.into_iter().next() else {
            return Ok(());
        };
        if configured != -1 && configured != file_id {
            return Err(Error::corruption(format!(
                "cluster id mismatch: config cluster_id={configured}, store path cluster_id={file_id}"
            )));
        }
        self.set_cluster_id(file_id)
    }

    /// Write the id to every store path still missing the file.
    fn set_cluster_id(&self, cluster_id: i32) -> Result<()> {
        for path in &self.config.store_paths {
            let file = path.join(CLUSTER_ID_FILE);
            if !file.exists() {
                if let Some(parent) = file.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&file, cluster_id.to_string())?;
            }
        }
        *self.effective_cluster_id.lock() = Some(cluster_id);
        Ok(())
    }

    pub fn effective_cluster_id(&self) -> Option<i32> {
        *self.effective_cluster_id.lock()
    }

    // ---- publish ----

    pub fn publish_version(
        self: &Arc<Self>,
        request: &publish::PublishVersionRequest,
    ) -> publish::PublishVersionResult {
        publish::publish_version(self, request)
    }

    pub fn add_async_publish_task(
        &self,
        partition_id: i64,
        tablet_id: i64,
        version: i64,
        txn_id: i64,
    ) {
        self.async_publish_tasks
            .lock()
            .insert((tablet_id, version), (partition_id, txn_id));
        info!(partition_id, tablet_id, version, txn_id, "queued async publish task");
    }

    pub fn async_publish_task_count(&self) -> usize {
        self.async_publish_tasks.lock().len()
    }

    pub fn has_async_publish_task(&self, tablet_id: i64, version: i64) -> bool {
        self.async_publish_tasks.lock().contains_key(&(tablet_id, version))
    }

    /// Run every queued async publish this tablet is now contiguous for.
    /// Called after each successful publish, outside the tablet locks.
    pub fn process_async_publish(self: &Arc<Self>, tablet: &Arc<Tablet>) {
        let tablet_id = tablet.tablet_id();
        loop {
            let next_version = tablet.max_version().end + 1;
            let entry = {
                let mut tasks = self.async_publish_tasks.lock();
                match tasks.remove(&(tablet_id, next_version)) {
                    Some(task) => Some(task),
                    None => {
                        // Bindings for versions already visible are dead.
                        let stale: Vec<(i64, i64)> = tasks
                            .range((tablet_id, i64::MIN)..(tablet_id, next_version))
                            .map(|(k, _)| *k)
                            .collect();
                        for key in stale {
                            tasks.remove(&key);
                        }
                        None
                    }
                }
            };
            let Some((partition_id, txn_id)) = entry else {
                return;
            };
            publish::run_async_publish_task(self, partition_id, tablet_id, next_version, txn_id);
            if tablet.max_version().end + 1 == next_version {
                // No progress: requeue so the next successful publish can
                // retry it, if the binding still exists.
                if engine_binding_alive(self, txn_id, partition_id, tablet_id) {
                    self.async_publish_tasks
                        .lock()
                        .insert((tablet_id, next_version), (partition_id, txn_id));
                }
                return;
            }
        }
    }

    /// Clone orchestration is external; the engine only records and exposes
    /// the requests.
    pub fn submit_clone_task(&self, tablet_id: i64, version: i64) {
        info!(tablet_id, version, "submitting missing rowset clone task");
        self.pending_clone_tasks.lock().push((tablet_id, version));
    }

    pub fn take_pending_clone_tasks(&self) -> Vec<(i64, i64)> {
        std::mem::take(&mut *self.pending_clone_tasks.lock())
    }

    // ---- compaction scheduling ----

    fn adjust_compaction_thread_num(&self) {
        let base_threads = get_base_thread_num(&self.config);
        if self.base_pool.num_threads() != base_threads {
            info!(
                old = self.base_pool.num_threads(),
                new = base_threads,
                "updating base compaction pool thread num"
            );
            self.base_pool.set_num_threads(base_threads);
        }
        let cumu_threads = get_cumu_thread_num(&self.config);
        if self.cumu_pool.num_threads() != cumu_threads {
            info!(
                old = self.cumu_pool.num_threads(),
                new = cumu_threads,
                "updating cumu compaction pool thread num"
            );
            self.cumu_pool.set_num_threads(cumu_threads);
        }
    }

    fn compaction_tasks_producer(self: &Arc<Self>) {
        info!("try to start compaction producer process");
        let mut round: u32 = 0;
        let mut last_cumu_score_update: Option<Instant> = None;
        let mut last_base_score_update: Option<Instant> = None;

        loop {
            let interval;
            if !self.config.disable_auto_compaction {
                self.adjust_compaction_thread_num();

                let mut check_score = false;
                let compaction_type;
                if round < self.config.cumulative_rounds_per_base_round {
                    compaction_type = CompactionType::Cumulative;
                    round += 1;
                    if last_cumu_score_update
                        .is_none_or(|t| t.elapsed() >= CHECK_SCORE_INTERVAL)
                    {
                        check_score = true;
                        last_cumu_score_update = Some(Instant::now());
                    }
                } else {
                    compaction_type = CompactionType::Base;
                    round = 0;
                    if last_base_score_update
                        .is_none_or(|t| t.elapsed() >= CHECK_SCORE_INTERVAL)
                    {
                        check_score = true;
                        last_base_score_update = Some(Instant::now());
                    }
                }

                let tablets = self.generate_compaction_tasks(compaction_type, check_score);
                for tablet in tablets {
                    let tablet_id = tablet.tablet_id();
                    match self.submit_compaction_task(tablet, compaction_type) {
                        Ok(()) => {}
                        Err(e)
                            if e.is(ErrorKind::BeNoSuitableVersion)
                                || e.is(ErrorKind::CumulativeNoSuitableVersion) => {}
                        Err(e) => {
                            warn!(tablet_id, error = %e, "failed to submit compaction task");
                        }
                    }
                }
                interval = Duration::from_millis(self.config.generate_compaction_tasks_interval_ms);
            } else {
                interval =
                    Duration::from_secs(self.config.check_auto_compaction_interval_seconds);
            }
            if self.stop_latch.wait_for(interval) {
                break;
            }
        }
    }

    /// One producer round: snapshot the tracking maps, compute the slot
    /// budget, build the per-type filter and ask the tablet manager for the
    /// top candidates. Runs with zero budget too, so the score metrics stay
    /// fresh.
    fn generate_compaction_tasks(
        &self,
        compaction_type: CompactionType,
        check_score: bool,
    ) -> Vec<Arc<Tablet>> {
        let (preparing_cumu, submitted_cumu, submitted_base, submitted_full) = {
            let state = self.compaction_state.lock();
            let cumu_counts: HashMap<i64, usize> = state
                .submitted_cumu
                .iter()
                .map(|(id, tasks)| (*id, tasks.len()))
                .collect();
            (
                state.preparing_cumu.clone(),
                cumu_counts,
                state.submitted_base.keys().copied().collect::<HashSet<i64>>(),
                state.submitted_full.keys().copied().collect::<HashSet<i64>>(),
            )
        };

        let thread_per_disk = self.config.compaction_task_num_per_fast_disk as i64;
        let num_cumu: i64 = submitted_cumu.values().map(|c| *c as i64).sum();
        let num_base = (submitted_base.len() + submitted_full.len()) as i64;
        let mut n = thread_per_disk - num_cumu - num_base;
        if compaction_type == CompactionType::Base {
            // Keep at least one slot for cumulative compaction; long base
            // compactions would otherwise starve it into "too many rowsets".
            let base_n = (self.config.max_base_compaction_task_num_per_disk as i64)
                .min(thread_per_disk - 1)
                - submitted_base.len() as i64;
            n = n.min(base_n);
        }
        let mut need_pick = true;
        if n <= 0 {
            if !check_score {
                return Vec::new();
            }
            need_pick = false;
            n = 0;
        }

        let config = self.config.clone();
        let now_ms = Utc::now().timestamp_millis();
        let filter_out: Box<dyn Fn(&Tablet) -> bool> = match compaction_type {
            CompactionType::Base | CompactionType::Full => Box::new(move |t: &Tablet| {
                submitted_base.contains(&t.tablet_id())
                    || submitted_full.contains(&t.tablet_id())
                    || t.tablet_state() != TabletState::Running
            }),
            CompactionType::Cumulative => {
                let parallel = config.enable_parallel_cumu_compaction;
                Box::new(move |t: &Tablet| {
                    let not_running = t.tablet_state() != TabletState::Running
                        && (!config.enable_new_tablet_compaction
                            || t.alter_version.load(Ordering::Acquire) == -1);
                    let backing_off = {
                        let stamp = t.last_cumu_no_suitable_version_ms.load(Ordering::Acquire);
                        stamp > 0 && now_ms - stamp < CUMU_NO_SUITABLE_VERSION_BACKOFF_MS
                    };
                    preparing_cumu.contains(&t.tablet_id())
                        || not_running
                        || backing_off
                        || (!parallel && submitted_cumu.contains_key(&t.tablet_id()))
                })
            }
        };

        let mut tablets = Vec::new();
        let mut max_score = 0i64;
        if let Err(e) = self.tablet_mgr.get_topn_tablets_to_compact(
            n as usize,
            compaction_type,
            filter_out.as_ref(),
            &mut tablets,
            &mut max_score,
        ) {
            warn!(error = %e, "failed to get tablets to compact");
            return Vec::new();
        }
        if max_score > 0 {
            let metrics = EngineMetrics::instance();
            match compaction_type {
                CompactionType::Cumulative => {
                    metrics.tablet_cumu_max_compaction_score.set(max_score)
                }
                CompactionType::Base | CompactionType::Full => {
                    metrics.tablet_base_max_compaction_score.set(max_score)
                }
            }
        }
        if need_pick { tablets } else { Vec::new() }
    }

    pub fn submit_compaction_task(
        self: &Arc<Self>,
        tablet: Arc<Tablet>,
        compaction_type: CompactionType,
    ) -> Result<()> {
        match compaction_type {
            CompactionType::Base => self.submit_base_compaction_task(tablet),
            CompactionType::Cumulative => self.submit_cumulative_compaction_task(tablet),
            CompactionType::Full => self.submit_full_compaction_task(tablet),
        }
    }

    /// Acquire the global lease and move the task into the executing map of
    /// its type. A refused lease stamps the tablet's failure time.
    fn request_tablet_global_compaction_lock(&self, task: &Arc<CompactionTask>) -> Result<()> {
        let tablet = task.tablet();
        if let Err(e) = task.request_global_lock() {
            warn!(
                tablet_id = tablet.tablet_id(),
                compaction_type = %task.compaction_type(),
                error = %e,
                "failed to request compaction global lock"
            );
            tablet.set_last_failure_time(task.compaction_type(), Utc::now().timestamp_millis());
            return Err(e);
        }
        let mut state = self.compaction_state.lock();
        match task.compaction_type() {
            CompactionType::Base => {
                state.executing_base.insert(tablet.tablet_id(), task.clone());
            }
            CompactionType::Cumulative => {
                state.executing_cumu.entry(tablet.tablet_id()).or_default().push(task.clone());
            }
            CompactionType::Full => {
                state.executing_full.insert(tablet.tablet_id(), task.clone());
            }
        }
        Ok(())
    }

    fn submit_base_compaction_task(self: &Arc<Self>, tablet: Arc<Tablet>) -> Result<()> {
        let tablet_id = tablet.tablet_id();
        {
            let mut state = self.compaction_state.lock();
            if state.submitted_base.contains_key(&tablet_id) {
                return Err(Error::already_exists(format!(
                    "other base compaction is submitted, tablet_id={tablet_id}"
                )));
            }
            state.submitted_base.insert(tablet_id, None);
        }
        let task = Arc::new(CompactionTask::new(
            CompactionType::Base,
            tablet.clone(),
            self.compaction_ctx.clone(),
        ));
        if let Err(e) = task.prepare_compact() {
            tablet.set_last_failure_time(CompactionType::Base, Utc::now().timestamp_millis());
            self.compaction_state.lock().submitted_base.remove(&tablet_id);
            return Err(e);
        }
        self.compaction_state.lock().submitted_base.insert(tablet_id, Some(task.clone()));

        let engine = self.clone();
        let submit_result = self.base_pool.submit(move || {
            let metrics = EngineMetrics::instance();
            metrics.base_compaction_task_running.add(1);
            metrics.base_compaction_task_pending.set(engine.base_pool.queue_size() as i64);
            if engine.request_tablet_global_compaction_lock(&task).is_ok() {
                if task.execute_compact().is_err() {
                    task.tablet().set_last_failure_time(
                        CompactionType::Base,
                        Utc::now().timestamp_millis(),
                    );
                }
                engine.compaction_state.lock().executing_base.remove(&tablet_id);
            }
            let mut state = engine.compaction_state.lock();
            state.submitted_base.remove(&tablet_id);
            drop(state);
            metrics.base_compaction_task_running.add(-1);
            metrics.base_compaction_task_pending.set(engine.base_pool.queue_size() as i64);
        });
        EngineMetrics::instance()
            .base_compaction_task_pending
            .set(self.base_pool.queue_size() as i64);
        if submit_result.is_err() {
            self.compaction_state.lock().submitted_base.remove(&tablet_id);
            return Err(Error::internal(format!(
                "failed to submit base compaction, tablet_id={tablet_id}"
            )));
        }
        Ok(())
    }

    fn erase_submitted_cumu_compaction(&self, tablet_id: i64, task: &Arc<CompactionTask>) {
        let mut state = self.compaction_state.lock();
        if let Some(tasks) = state.submitted_cumu.get_mut(&tablet_id) {
            tasks.retain(|t| !Arc::ptr_eq(t, task));
            if tasks.is_empty() {
                state.submitted_cumu.remove(&tablet_id);
                // Re-admit the tablet so at least one node keeps trying
                // cumulative compaction on it.
                task.tablet().last_cumu_no_suitable_version_ms.store(0, Ordering::Release);
            }
        }
    }

    fn erase_executing_cumu_compaction(&self, tablet_id: i64, task: &Arc<CompactionTask>) {
        let mut state = self.compaction_state.lock();
        if let Some(tasks) = state.executing_cumu.get_mut(&tablet_id) {
            tasks.retain(|t| !Arc::ptr_eq(t, task));
            if tasks.is_empty() {
                state.executing_cumu.remove(&tablet_id);
            }
        }
    }

    fn submit_cumulative_compaction_task(self: &Arc<Self>, tablet: Arc<Tablet>) -> Result<()> {
        let tablet_id = tablet.tablet_id();
        {
            let mut state = self.compaction_state.lock();
            if !self.config.enable_parallel_cumu_compaction
                && state.submitted_cumu.contains_key(&tablet_id)
            {
                return Err(Error::already_exists(format!(
                    "other cumu compaction is submitted, tablet_id={tablet_id}"
                )));
            }
            if !state.preparing_cumu.insert(tablet_id) {
                return Err(Error::already_exists(format!(
                    "other cumu compaction is preparing, tablet_id={tablet_id}"
                )));
            }
        }
        let task = Arc::new(CompactionTask::new(
            CompactionType::Cumulative,
            tablet.clone(),
            self.compaction_ctx.clone(),
        ));
        if let Err(e) = task.prepare_compact() {
            let now_ms = Utc::now().timestamp_millis();
            if e.is(ErrorKind::CumulativeNoSuitableVersion) {
                // Backoff rather than failure: the versions may simply not
                // have arrived yet.
                tablet.last_cumu_no_suitable_version_ms.store(now_ms, Ordering::Release);
            } else if !e.is(ErrorKind::CumulativeMeetDeleteVersion) {
                tablet.set_last_failure_time(CompactionType::Cumulative, now_ms);
            }
            self.compaction_state.lock().preparing_cumu.remove(&tablet_id);
            return Err(e);
        }
        {
            let mut state = self.compaction_state.lock();
            state.preparing_cumu.remove(&tablet_id);
            state.submitted_cumu.entry(tablet_id).or_default().push(task.clone());
        }

        let engine = self.clone();
        let task_for_pool = task.clone();
        let submit_result = self.cumu_pool.submit(move || {
            let task = task_for_pool;
            let metrics = EngineMetrics::instance();
            metrics.cumu_compaction_task_running.add(1);
            metrics.cumu_compaction_task_pending.set(engine.cumu_pool.queue_size() as i64);

            if engine.request_tablet_global_compaction_lock(&task).is_ok() {
                let config = &engine.compaction_ctx.config;
                let mut is_large_task = true;
                let mut delay = false;
                {
                    let mut delay_state = engine.cumu_delay.lock();
                    delay_state.used_threads += 1;
                    let max_threads = engine.cumu_pool.num_threads();
                    if config.large_cumu_compaction_task_min_thread_num > 1
                        && max_threads >= config.large_cumu_compaction_task_min_thread_num
                    {
                        is_large_task = task.input_rowsets_bytes()
                            > config.large_cumu_compaction_task_bytes_threshold
                            || task.input_num_rows()
                                > config.large_cumu_compaction_task_rows_threshold;
                        if !is_large_task {
                            delay_state.small_tasks_running += 1;
                        } else if should_delay_large_task(
                            delay_state.used_threads,
                            delay_state.small_tasks_running,
                            max_threads,
                        ) {
                            delay = true;
                        }
                    }
                }
                if delay {
                    task.tablet().set_last_failure_time(
                        CompactionType::Cumulative,
                        Utc::now().timestamp_millis(),
                    );
                    engine.erase_executing_cumu_compaction(tablet_id, &task);
                    warn!(
                        tablet_id,
                        input_rows = task.input_num_rows(),
                        input_bytes = task.input_rowsets_bytes(),
                        "cumu pool is intensive, delay large compaction task"
                    );
                } else {
                    if task.execute_compact().is_err() {
                        task.tablet().set_last_failure_time(
                            CompactionType::Cumulative,
                            Utc::now().timestamp_millis(),
                        );
                    }
                    engine.erase_executing_cumu_compaction(tablet_id, &task);
                }
                {
                    let mut delay_state = engine.cumu_delay.lock();
                    delay_state.used_threads -= 1;
                    if !is_large_task {
                        delay_state.small_tasks_running -= 1;
                    }
                }
            }
            engine.erase_submitted_cumu_compaction(tablet_id, &task);
            metrics.cumu_compaction_task_running.add(-1);
            metrics.cumu_compaction_task_pending.set(engine.cumu_pool.queue_size() as i64);
        });
        EngineMetrics::instance()
            .cumu_compaction_task_pending
            .set(self.cumu_pool.queue_size() as i64);
        if let Err(e) = submit_result {
            warn!(tablet_id, error = %e, "failed to submit cumu compaction to pool");
            // The closure never ran; drop the tracking entry here.
            self.erase_submitted_cumu_compaction(tablet_id, &task);
            return Err(Error::internal(format!(
                "failed to submit cumu compaction, tablet_id={tablet_id}"
            )));
        }
        Ok(())
    }

    fn submit_full_compaction_task(self: &Arc<Self>, tablet: Arc<Tablet>) -> Result<()> {
        let tablet_id = tablet.tablet_id();
        {
            let mut state = self.compaction_state.lock();
            if state.submitted_full.contains_key(&tablet_id) {
                return Err(Error::already_exists(format!(
                    "other full compaction is submitted, tablet_id={tablet_id}"
                )));
            }
            state.submitted_full.insert(tablet_id, None);
        }
        let task = Arc::new(CompactionTask::new(
            CompactionType::Full,
            tablet.clone(),
            self.compaction_ctx.clone(),
        ));
        if let Err(e) = task.prepare_compact() {
            tablet.set_last_failure_time(CompactionType::Full, Utc::now().timestamp_millis());
            self.compaction_state.lock().submitted_full.remove(&tablet_id);
            return Err(e);
        }
        self.compaction_state.lock().submitted_full.insert(tablet_id, Some(task.clone()));

        let engine = self.clone();
        // Full compactions share the base pool.
        let submit_result = self.base_pool.submit(move || {
            let metrics = EngineMetrics::instance();
            metrics.full_compaction_task_running.add(1);
            if engine.request_tablet_global_compaction_lock(&task).is_ok() {
                if task.execute_compact().is_err() {
                    task.tablet().set_last_failure_time(
                        CompactionType::Full,
                        Utc::now().timestamp_millis(),
                    );
                }
                engine.compaction_state.lock().executing_full.remove(&tablet_id);
            }
            engine.compaction_state.lock().submitted_full.remove(&tablet_id);
            metrics.full_compaction_task_running.add(-1);
        });
        if submit_result.is_err() {
            self.compaction_state.lock().submitted_full.remove(&tablet_id);
            return Err(Error::internal(format!(
                "failed to submit full compaction, tablet_id={tablet_id}"
            )));
        }
        Ok(())
    }

    pub fn get_cumu_compaction(&self, tablet_id: i64) -> Vec<Arc<CompactionTask>> {
        self.compaction_state
            .lock()
            .submitted_cumu
            .get(&tablet_id)
            .cloned()
            .unwrap_or_default()
    }

    /// JSON snapshot of submitted compactions, one tablet id per entry.
    pub fn get_compaction_status_json(&self) -> String {
        let state = self.compaction_state.lock();
        let mut cumu: Vec<i64> = Vec::new();
        for (tablet_id, tasks) in &state.submitted_cumu {
            cumu.extend(std::iter::repeat_n(*tablet_id, tasks.len()));
        }
        cumu.sort_unstable();
        let mut base: Vec<i64> = state.submitted_base.keys().copied().collect();
        base.sort_unstable();
        let value = serde_json::json!({
            "CumulativeCompaction": cumu,
            "BaseCompaction": base,
        });
        serde_json::to_string_pretty(&value).unwrap_or_default()
    }

    // ---- leases ----

    fn lease_compaction_loop(&self) {
        let interval = Duration::from_secs(self.config.lease_compaction_interval_seconds);
        while !self.stop_latch.wait_for(interval) {
            let (base, cumu, full, tokens) = {
                let state = self.compaction_state.lock();
                (
                    state.executing_base.values().cloned().collect::<Vec<_>>(),
                    state
                        .executing_cumu
                        .values()
                        .flat_map(|tasks| tasks.iter().cloned())
                        .collect::<Vec<_>>(),
                    state.executing_full.values().cloned().collect::<Vec<_>>(),
                    state
                        .active_stop_tokens
                        .values()
                        .filter_map(|token| token.clone())
                        .collect::<Vec<_>>(),
                )
            };
            for token in tokens {
                token.do_lease();
            }
            for task in full.iter().chain(cumu.iter()).chain(base.iter()) {
                task.do_lease();
            }
        }
    }

    // ---- delete bitmap score ----

    fn check_delete_bitmap_score_loop(&self) {
        let interval = Duration::from_secs(self.config.check_delete_bitmap_score_interval_s);
        while !self.stop_latch.wait_for(interval) {
            if !self.config.enable_check_delete_bitmap_score {
                return;
            }
            let mut max_score = 0u64;
            let mut max_base_score = 0u64;
            self.tablet_mgr.get_topn_tablet_delete_bitmap_score(&mut max_score, &mut max_base_score);
            let metrics = EngineMetrics::instance();
            if max_score > 0 {
                metrics.tablet_max_delete_bitmap_score.set(max_score as i64);
            }
            if max_base_score > 0 {
                metrics
                    .tablet_max_base_rowset_delete_bitmap_score
                    .set(max_base_score as i64);
            }
        }
    }

    // ---- stop tokens ----

    pub fn register_compaction_stop_token(
        self: &Arc<Self>,
        tablet: Arc<Tablet>,
        initiator: i64,
    ) -> Result<()> {
        let tablet_id = tablet.tablet_id();
        {
            let mut state = self.compaction_state.lock();
            if state.active_stop_tokens.contains_key(&tablet_id) {
                return Err(Error::already_exists(format!(
                    "stop token already exists for tablet_id={tablet_id}"
                )));
            }
            state.active_stop_tokens.insert(tablet_id, None);
        }
        let token = Arc::new(CompactionStopToken::new(
            tablet,
            initiator,
            self.meta_service.clone(),
        ));
        if let Err(e) = token.do_register() {
            self.compaction_state.lock().active_stop_tokens.remove(&tablet_id);
            return Err(e);
        }
        self.compaction_state
            .lock()
            .active_stop_tokens
            .insert(tablet_id, Some(token));
        info!(tablet_id, initiator, "successfully registered compaction stop token");
        Ok(())
    }

    pub fn unregister_compaction_stop_token(
        &self,
        tablet_id: i64,
        clear_meta_service: bool,
    ) -> Result<()> {
        let token = {
            let mut state = self.compaction_state.lock();
            match state.active_stop_tokens.remove(&tablet_id) {
                Some(token) => token,
                None => {
                    return Err(Error::not_found(format!(
                        "stop token not found for tablet_id={tablet_id}"
                    )));
                }
            }
        };
        info!(tablet_id, "successfully unregistered compaction stop token");
        if clear_meta_service {
            if let Some(token) = token {
                token.do_unregister()?;
                info!(
                    tablet_id,
                    initiator = token.initiator(),
                    "successfully removed compaction stop token from meta service"
                );
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn seed_compaction_state_for_test(
        &self,
        base: &[i64],
        full: &[i64],
        cumu: &[(i64, Arc<CompactionTask>)],
    ) {
        let mut state = self.compaction_state.lock();
        for id in base {
            state.submitted_base.insert(*id, None);
        }
        for id in full {
            state.submitted_full.insert(*id, None);
        }
        for (id, task) in cumu {
            state.submitted_cumu.entry(*id).or_default().push(task.clone());
        }
    }

    #[cfg(test)]
    pub(crate) fn submitted_counts_for_test(&self) -> (usize, usize, usize) {
        let state = self.compaction_state.lock();
        (
            state.submitted_base.len(),
            state.submitted_cumu.values().map(|v| v.len()).sum(),
            state.submitted_full.len(),
        )
    }

    #[cfg(test)]
    pub(crate) fn seed_cumu_delay_for_test(&self, used_threads: usize, small_tasks_running: usize) {
        let mut delay = self.cumu_delay.lock();
        delay.used_threads = used_threads;
        delay.small_tasks_running = small_tasks_running;
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn engine_binding_alive(
    engine: &Arc<StorageEngine>,
    txn_id: i64,
    partition_id: i64,
    tablet_id: i64,
) -> bool {
    engine
        .txn_mgr()
        .get_txn_related_tablets(txn_id, partition_id)
        .get(&tablet_id)
        .is_some_and(|rs| rs.is_some())
}

fn spawn_loop<F>(name: &str, body: F) -> thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .expect("spawn background loop")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::compaction::testing::MockCompactor;
    use crate::engine::meta_service::testing::MockMetaService;
    use crate::engine::publish::{PartitionVersionInfo, PublishVersionRequest};
    use crate::meta::rowset::Version;
    use crate::meta::tablet_meta::TabletMeta;
    use crate::meta::tablet_meta::testing::{create_request, rowset_at};
    use crate::vault::filesystem::InMemoryClient;

    struct TestEngine {
        engine: Arc<StorageEngine>,
        meta_service: Arc<MockMetaService>,
        compactor: Arc<MockCompactor>,
    }

    fn test_engine(config: Config) -> TestEngine {
        let meta_service = Arc::new(MockMetaService::default());
        let compactor = Arc::new(MockCompactor::default());
        let engine = StorageEngine::new(
            config,
            meta_service.clone(),
            compactor.clone(),
            InMemoryClient::factory(),
        );
        TestEngine { engine, meta_service, compactor }
    }

    fn add_tablet(
        engine: &Arc<StorageEngine>,
        tablet_id: i64,
        merge_on_write: bool,
        versions: &[(i64, i64)],
    ) -> Arc<Tablet> {
        let mut meta = TabletMeta::create_from_request(&create_request(tablet_id, merge_on_write));
        for (start, end) in versions {
            meta.add_rowset(rowset_at(tablet_id, *start, *end)).unwrap();
        }
        meta.set_cumulative_layer_point(0);
        let tablet = Arc::new(Tablet::new(meta));
        engine.tablet_mgr().put_tablet(tablet.clone());
        tablet
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn publish_request(partition_id: i64, version: i64, base_tablet_ids: &[i64]) -> PublishVersionRequest {
        PublishVersionRequest {
            txn_id: 1000,
            partitions: vec![PartitionVersionInfo {
                partition_id,
                version,
                base_tablet_ids: base_tablet_ids.iter().copied().collect(),
            }],
            strict_mode: false,
        }
    }

    #[test]
    fn test_should_delay_large_task_rule() {
        // Everything but this task busy with large work, no small running.
        assert!(should_delay_large_task(4, 0, 4));
        // A small task is making progress: no delay.
        assert!(!should_delay_large_task(4, 1, 4));
        // Free slots remain: no delay.
        assert!(!should_delay_large_task(2, 0, 4));
    }

    #[test]
    fn test_publish_contiguous() {
        let t = test_engine(Config::default());
        let tablet = add_tablet(&t.engine, 50, true, &[(0, 1), (2, 5)]);
        assert_eq!(tablet.max_version().end, 5);

        let rowset = rowset_at(50, 6, 6);
        t.engine.txn_mgr().commit_txn(1000, 3, 50, Some(rowset));
        let result = t.engine.publish_version(&publish_request(3, 6, &[50]));

        assert!(result.status.is_ok());
        assert!(result.error_tablet_ids.is_empty());
        assert_eq!(result.succ_tablets.get(&50), Some(&0));
        assert_eq!(tablet.max_version().end, 6);
        assert_eq!(result.table_delta_rows[&1][&50], 100);
        assert_eq!(t.meta_service.published.lock().len(), 1);
    }

    #[test]
    fn test_publish_non_contiguous_mow_goes_async() {
        let config = Config { mow_publish_max_discontinuous_version_num: 2, ..Config::default() };
        let t = test_engine(config);
        let tablet = add_tablet(&t.engine, 51, true, &[(0, 5)]);

        let rowset = rowset_at(51, 8, 8);
        t.engine.txn_mgr().commit_txn(1000, 3, 51, Some(rowset));
        let result = t.engine.publish_version(&publish_request(3, 8, &[]));

        assert!(result.error_tablet_ids.contains(&51));
        assert!(!result.succ_tablets.contains_key(&51));
        assert!(matches!(
            &result.status,
            Err(e) if e.is(ErrorKind::PublishVersionNotContinuous)
        ));
        // Gap of 3 > 2: deferred to async publish rather than frontend retry.
        assert!(t.engine.has_async_publish_task(51, 8));
        assert!(result.discontinuous_version_tablets.is_empty());
        assert_eq!(tablet.max_version().end, 5);
    }

    #[test]
    fn test_publish_small_gap_reports_discontinuous_tablet() {
        let config = Config { mow_publish_max_discontinuous_version_num: 5, ..Config::default() };
        let t = test_engine(config);
        add_tablet(&t.engine, 52, true, &[(0, 5)]);

        t.engine.txn_mgr().commit_txn(1000, 3, 52, Some(rowset_at(52, 8, 8)));
        let result = t.engine.publish_version(&publish_request(3, 8, &[]));

        assert_eq!(result.discontinuous_version_tablets, vec![(3, 52, 8)]);
        assert_eq!(t.engine.async_publish_task_count(), 0);
    }

    #[test]
    fn test_publish_duplicate_version_succeeds() {
        let t = test_engine(Config::default());
        let tablet = add_tablet(&t.engine, 53, true, &[(0, 5), (6, 6)]);

        t.engine.txn_mgr().commit_txn(1000, 3, 53, Some(rowset_at(53, 6, 6)));
        let result = t.engine.publish_version(&publish_request(3, 6, &[]));

        assert!(result.status.is_ok());
        assert_eq!(result.succ_tablets.get(&53), Some(&0));
        assert!(result.error_tablet_ids.is_empty());
        // The txn binding is dropped and no rowset was duplicated.
        assert!(t.engine.txn_mgr().get_txn_related_tablets(1000, 3).is_empty());
        assert_eq!(tablet.meta().rs_metas().len(), 2);
    }

    #[test]
    fn test_publish_missing_rowset_and_tablet() {
        let t = test_engine(Config::default());
        add_tablet(&t.engine, 54, false, &[(0, 5)]);

        // Tablet 54: write failed on this node. Tablet 999: unknown.
        t.engine.txn_mgr().commit_txn(1000, 3, 54, None);
        t.engine.txn_mgr().commit_txn(1000, 3, 999, Some(rowset_at(999, 6, 6)));
        let result = t.engine.publish_version(&publish_request(3, 6, &[]));

        assert!(result.error_tablet_ids.contains(&54));
        assert!(result.error_tablet_ids.contains(&999));
        assert!(result.status.is_err());
    }

    #[test]
    fn test_async_publish_drains_when_contiguous() {
        let config = Config { mow_publish_max_discontinuous_version_num: 1, ..Config::default() };
        let t = test_engine(config);
        let tablet = add_tablet(&t.engine, 55, true, &[(0, 5)]);

        // Version 8 arrives early and is parked.
        t.engine.txn_mgr().commit_txn(1000, 3, 55, Some(rowset_at(55, 8, 8)));
        let result = t.engine.publish_version(&publish_request(3, 8, &[]));
        assert!(result.status.is_err());
        assert!(t.engine.has_async_publish_task(55, 8));

        // Versions 6 and 7 land; the parked publish follows automatically.
        tablet.add_inc_rowset(rowset_at(55, 6, 6)).unwrap();
        tablet.add_inc_rowset(rowset_at(55, 7, 7)).unwrap();
        t.engine.process_async_publish(&tablet);

        assert_eq!(tablet.max_version().end, 8);
        assert_eq!(t.engine.async_publish_task_count(), 0);
        assert!(t.engine.txn_mgr().get_txn_related_tablets(1000, 3).is_empty());
    }

    #[test]
    fn test_clone_task_recorded_on_gap() {
        let config = Config {
            enable_clone_on_missing_version: true,
            mow_publish_max_discontinuous_version_num: 5,
            ..Config::default()
        };
        let t = test_engine(config);
        add_tablet(&t.engine, 56, true, &[(0, 5)]);
        t.engine.txn_mgr().commit_txn(1000, 3, 56, Some(rowset_at(56, 8, 8)));
        let _ = t.engine.publish_version(&publish_request(3, 8, &[]));
        assert_eq!(t.engine.take_pending_clone_tasks(), vec![(56, 7)]);
    }

    #[test]
    fn test_generate_base_tasks_respects_caps() {
        // threadsPerDisk=4, max_base_per_disk=2, |submittedBase|=2, cumu=1:
        // budget is min(2-2, 4-1-2) = 0, so nothing is picked even though a
        // tablet has base work, but the score metric still refreshes.
        let config = Config {
            compaction_task_num_per_fast_disk: 4,
            max_base_compaction_task_num_per_disk: 2,
            ..Config::default()
        };
        let t = test_engine(config);
        let tablet = add_tablet(&t.engine, 57, false, &[(0, 0), (1, 1), (2, 2)]);
        tablet.meta_mut().set_cumulative_layer_point(2);

        let cumu_task = Arc::new(CompactionTask::new(
            CompactionType::Cumulative,
            tablet.clone(),
            t.engine.compaction_ctx.clone(),
        ));
        t.engine.seed_compaction_state_for_test(&[101, 102], &[], &[(103, cumu_task)]);

        EngineMetrics::instance().tablet_base_max_compaction_score.set(0);
        let picked = t.engine.generate_compaction_tasks(CompactionType::Base, true);
        assert!(picked.is_empty());
        assert!(EngineMetrics::instance().tablet_base_max_compaction_score.get() > 0);

        // Without the pre-existing load the same round picks the tablet.
        let t2 = test_engine(Config {
            compaction_task_num_per_fast_disk: 4,
            max_base_compaction_task_num_per_disk: 2,
            ..Config::default()
        });
        let tablet2 = add_tablet(&t2.engine, 57, false, &[(0, 0), (1, 1), (2, 2)]);
        tablet2.meta_mut().set_cumulative_layer_point(2);
        let picked = t2.engine.generate_compaction_tasks(CompactionType::Base, true);
        assert_eq!(picked.len(), 1);
    }

    #[test]
    fn test_submit_cumulative_compaction_end_to_end() {
        let config = Config { cumu_compaction_min_rowset_num: 2, ..Config::default() };
        let t = test_engine(config);
        let tablet = add_tablet(&t.engine, 58, false, &[(0, 0), (1, 1), (2, 2)]);

        t.engine.submit_compaction_task(tablet.clone(), CompactionType::Cumulative).unwrap();
        wait_until(|| t.engine.submitted_counts_for_test().1 == 0);

        assert_eq!(t.compactor.merges.load(Ordering::SeqCst), 1);
        assert_eq!(tablet.meta().rs_metas().len(), 1);
        assert_eq!(tablet.meta().rs_metas()[0].version, Version::new(0, 2));
        assert_eq!(t.meta_service.committed.lock().len(), 1);
    }

    #[test]
    fn test_submit_cumulative_no_suitable_version_backs_off() {
        let t = test_engine(Config::default());
        // One rowset < min_rowset_num: no suitable version.
        let tablet = add_tablet(&t.engine, 59, false, &[(0, 0)]);
        let err = t
            .engine
            .submit_compaction_task(tablet.clone(), CompactionType::Cumulative)
            .unwrap_err();
        assert!(err.is(ErrorKind::CumulativeNoSuitableVersion));
        assert!(tablet.last_cumu_no_suitable_version_ms.load(Ordering::Acquire) > 0);
        // Backed-off tablets are filtered from the next cumulative round.
        let picked = t.engine.generate_compaction_tasks(CompactionType::Cumulative, true);
        assert!(picked.is_empty());
        // But not failed: the failure stamp stays clear.
        assert_eq!(tablet.last_cumu_compaction_failure_ms.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_base_placeholder_blocks_second_submit() {
        let t = test_engine(Config::default());
        let tablet = add_tablet(&t.engine, 60, false, &[(0, 0), (1, 1), (2, 2), (3, 3)]);
        tablet.meta_mut().set_cumulative_layer_point(3);

        t.engine.submit_compaction_task(tablet.clone(), CompactionType::Base).unwrap();
        let second = t.engine.submit_compaction_task(tablet.clone(), CompactionType::Base);
        // Still tracked (AlreadyExists), or the first already finished and
        // left nothing below the point to compact.
        if let Err(e) = second {
            assert!(
                e.is(ErrorKind::AlreadyExists) || e.is(ErrorKind::BeNoSuitableVersion),
                "unexpected error: {e}"
            );
        }
        wait_until(|| t.engine.submitted_counts_for_test().0 == 0);
    }

    #[test]
    fn test_large_cumu_task_delayed() {
        let config = Config {
            cumu_compaction_min_rowset_num: 2,
            large_cumu_compaction_task_min_thread_num: 4,
            max_cumu_compaction_threads: 4,
            // Any input is large.
            large_cumu_compaction_task_bytes_threshold: 1,
            large_cumu_compaction_task_rows_threshold: 1,
            ..Config::default()
        };
        let t = test_engine(config);
        let tablet = add_tablet(&t.engine, 61, false, &[(0, 0), (1, 1), (2, 2)]);

        // Three other large tasks already hold pool threads.
        t.engine.seed_cumu_delay_for_test(3, 0);
        t.engine.submit_compaction_task(tablet.clone(), CompactionType::Cumulative).unwrap();
        wait_until(|| t.engine.submitted_counts_for_test().1 == 0);

        // The task was dropped before execution and the failure time stamped.
        assert_eq!(t.compactor.merges.load(Ordering::SeqCst), 0);
        assert!(tablet.last_cumu_compaction_failure_ms.load(Ordering::Acquire) > 0);
        assert_eq!(tablet.meta().rs_metas().len(), 3);
        // The executing map is clean again.
        assert!(t.engine.compaction_state.lock().executing_cumu.is_empty());
    }

    #[test]
    fn test_stop_token_lifecycle() {
        let t = test_engine(Config::default());
        let tablet = add_tablet(&t.engine, 62, false, &[(0, 0)]);

        t.engine.register_compaction_stop_token(tablet.clone(), 77).unwrap();
        let err = t.engine.register_compaction_stop_token(tablet.clone(), 77).unwrap_err();
        assert!(err.is(ErrorKind::AlreadyExists));
        assert_eq!(t.meta_service.stop_tokens.lock().get(&62), Some(&77));

        t.engine.unregister_compaction_stop_token(62, true).unwrap();
        assert!(t.meta_service.stop_tokens.lock().get(&62).is_none());
        let err = t.engine.unregister_compaction_stop_token(62, true).unwrap_err();
        assert!(err.is(ErrorKind::NotFound));
    }

    #[test]
    fn test_cluster_id_checks() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("store_a");
        let path_b = dir.path().join("store_b");
        fs::create_dir_all(&path_a).unwrap();
        fs::create_dir_all(&path_b).unwrap();

        // Fresh paths, configured id: files get written.
        let config = Config {
            store_paths: vec![path_a.clone(), path_b.clone()],
            cluster_id: 42,
            ..Config::default()
        };
        let t = test_engine(config);
        t.engine.check_all_store_path_cluster_id().unwrap();
        assert_eq!(t.engine.effective_cluster_id(), Some(42));
        assert_eq!(fs::read_to_string(path_a.join(CLUSTER_ID_FILE)).unwrap(), "42");

        // Conflicting configured id: corruption.
        let config = Config {
            store_paths: vec![path_a.clone(), path_b.clone()],
            cluster_id: 43,
            ..Config::default()
        };
        let t = test_engine(config);
        let err = t.engine.check_all_store_path_cluster_id().unwrap_err();
        assert!(err.is(ErrorKind::Corruption));

        // Divergent files across paths: internal error.
        fs::write(path_b.join(CLUSTER_ID_FILE), "7").unwrap();
        let config = Config {
            store_paths: vec![path_a, path_b],
            cluster_id: -1,
            ..Config::default()
        };
        let t = test_engine(config);
        let err = t.engine.check_all_store_path_cluster_id().unwrap_err();
        assert!(err.is(ErrorKind::InternalError));
    }

    #[test]
    fn test_engine_stop_is_idempotent() {
        let t = test_engine(Config::default());
        t.engine.start_bg_threads();
        assert!(!t.engine.stopped());
        t.engine.stop();
        assert!(t.engine.stopped());
        t.engine.stop();
        assert!(t.engine.publish_pool().submit(|| {}).is_err());
    }

    #[test]
    fn test_compaction_status_json() {
        let t = test_engine(Config::default());
        let tablet = add_tablet(&t.engine, 63, false, &[(0, 0)]);
        let task = Arc::new(CompactionTask::new(
            CompactionType::Cumulative,
            tablet,
            t.engine.compaction_ctx.clone(),
        ));
        t.engine.seed_compaction_state_for_test(&[64], &[], &[(63, task)]);
        let json = t.engine.get_compaction_status_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["CumulativeCompaction"], serde_json::json!([63]));
        assert_eq!(value["BaseCompaction"], serde_json::json!([64]));
        assert_eq!(t.engine.get_cumu_compaction(63).len(), 1);
    }
}
