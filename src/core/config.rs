use std::path::PathBuf;

/// Node-level configuration. All durations are in the unit named by the field.
#[derive(Debug, Clone)]
pub struct Config {
    pub store_paths: Vec<PathBuf>,
    pub cluster_id: i32,
    /// Rowset metas live in the metadata service instead of the local
    /// persisted descriptor.
    pub cloud_mode: bool,

    // Compaction producer
    pub disable_auto_compaction: bool,
    pub generate_compaction_tasks_interval_ms: u64,
    pub check_auto_compaction_interval_seconds: u64,
    pub cumulative_rounds_per_base_round: u32,
    pub compaction_task_num_per_fast_disk: usize,
    pub max_base_compaction_task_num_per_disk: usize,
    pub enable_parallel_cumu_compaction: bool,
    pub enable_new_tablet_compaction: bool,

    // Compaction pools
    pub max_cumu_compaction_threads: i32,       // <= 0: derive from cores
    pub max_base_compaction_threads: i32,       // <= 0: derive from cores
    pub cumu_compaction_thread_num_factor: f64,
    pub base_compaction_thread_num_factor: f64,

    // Large cumulative task delaying
    pub large_cumu_compaction_task_bytes_threshold: u64,
    pub large_cumu_compaction_task_rows_threshold: u64,
    pub large_cumu_compaction_task_min_thread_num: usize,

    // Cumulative policy
    pub cumu_compaction_min_rowset_num: usize,
    pub cumu_compaction_max_rowset_num: usize,
    pub base_compaction_min_rowset_num: usize,

    // Leases
    pub lease_compaction_interval_seconds: u64,

    // Publish
    pub mow_publish_max_discontinuous_version_num: i64,
    pub publish_version_gap_logging_threshold: i64,
    pub enable_clone_on_missing_version: bool,
    pub migration_lock_timeout_seconds: u64,

    // Storage vaults
    pub refresh_storage_vault_interval_s: u64,
    pub enable_check_storage_vault: bool,

    // Background loops
    pub vacuum_stale_rowsets_interval_s: u64,
    pub stale_rowset_sweep_ttl_s: u64,
    pub sync_tablets_interval_s: u64,
    pub check_delete_bitmap_score_interval_s: u64,
    pub enable_check_delete_bitmap_score: bool,

    // Tablet meta persistence
    pub tablet_meta_serialize_size_limit: usize,

    // Delete bitmap aggregation cache
    pub delete_bitmap_agg_cache_capacity: usize,
    pub enable_agg_cache_version: bool,
    pub enable_agg_correctness_check: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            store_paths: vec![PathBuf::from("./data")],
            cluster_id: -1,
            cloud_mode: true,

            disable_auto_compaction: false,
            generate_compaction_tasks_interval_ms: 100,
            check_auto_compaction_interval_seconds: 5,
            cumulative_rounds_per_base_round: 9,
            compaction_task_num_per_fast_disk: 8,
            max_base_compaction_task_num_per_disk: 2,
            enable_parallel_cumu_compaction: false,
            enable_new_tablet_compaction: false,

            max_cumu_compaction_threads: -1,
            max_base_compaction_threads: -1,
            cumu_compaction_thread_num_factor: 0.5,
            base_compaction_thread_num_factor: 0.25,

            large_cumu_compaction_task_bytes_threshold: 1024 * 1024 * 1024, // 1GB
            large_cumu_compaction_task_rows_threshold: 1_000_000,
            large_cumu_compaction_task_min_thread_num: 5,

            cumu_compaction_min_rowset_num: 5,
            cumu_compaction_max_rowset_num: 1000,
            base_compaction_min_rowset_num: 2,

            lease_compaction_interval_seconds: 20,

            mow_publish_max_discontinuous_version_num: 20,
            publish_version_gap_logging_threshold: 200,
            enable_clone_on_missing_version: false,
            migration_lock_timeout_seconds: 5,

            refresh_storage_vault_interval_s: 60,
            enable_check_storage_vault: true,

            vacuum_stale_rowsets_interval_s: 300,
            stale_rowset_sweep_ttl_s: 1800,
            sync_tablets_interval_s: 600,
            check_delete_bitmap_score_interval_s: 300,
            enable_check_delete_bitmap_score: true,

            tablet_meta_serialize_size_limit: 512 * 1024 * 1024, // 512MB

            delete_bitmap_agg_cache_capacity: 100 * 1024 * 1024, // 100MB
            enable_agg_cache_version: true,
            enable_agg_correctness_check: false,
        }
    }
}
