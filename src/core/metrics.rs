use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Latency recorder: running count / total / max, all in microseconds.
#[derive(Default)]
pub struct LatencyRecorder {
    count: AtomicU64,
    total_us: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyRecorder {
    pub fn record(&self, us: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn avg_us(&self) -> u64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            0
        } else {
            self.total_us.load(Ordering::Relaxed) / count
        }
    }

    pub fn max_us(&self) -> u64 {
        self.max_us.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn add(&self, v: i64) {
        self.0.fetch_add(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Process-wide metrics for the storage engine.
#[derive(Default)]
pub struct EngineMetrics {
    pub base_compaction_task_running: Gauge,
    pub base_compaction_task_pending: Gauge,
    pub cumu_compaction_task_running: Gauge,
    pub cumu_compaction_task_pending: Gauge,
    pub full_compaction_task_running: Gauge,

    pub tablet_base_max_compaction_score: Gauge,
    pub tablet_cumu_max_compaction_score: Gauge,

    pub tablet_max_delete_bitmap_score: Gauge,
    pub tablet_max_base_rowset_delete_bitmap_score: Gauge,

    pub publish_schedule_latency: LatencyRecorder,
    pub publish_lock_wait_latency: LatencyRecorder,
    pub publish_save_meta_latency: LatencyRecorder,
    pub publish_delete_bitmap_latency: LatencyRecorder,
    pub publish_partial_update_latency: LatencyRecorder,
    pub publish_add_inc_rowset_latency: LatencyRecorder,
    pub publish_latency: LatencyRecorder,
}

static METRICS: OnceLock<EngineMetrics> = OnceLock::new();

impl EngineMetrics {
    pub fn instance() -> &'static EngineMetrics {
        METRICS.get_or_init(EngineMetrics::default)
    }
}
