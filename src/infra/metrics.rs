//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that resets anything (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering. They are statistical counters only;
//! evaluation and retry logic must never read them to make decisions.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    // At least one sample must be covered, otherwise empty leading buckets match
    let target = ((total as f64 * percentile) as u64).max(1);
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Presence updates accepted from a presence source (monotonic)
    presence_received: AtomicU64,
    /// Presence updates dropped because the worker queue was full (monotonic)
    presence_dropped: AtomicU64,
    /// Presence messages that could not be parsed (monotonic)
    presence_invalid: AtomicU64,
    /// Queued snapshots replaced by a newer one for the same site (monotonic)
    presence_superseded: AtomicU64,
    /// Evaluations completed, any outcome (monotonic)
    evaluations_total: AtomicU64,
    /// Evaluations since last report (reset on report)
    evaluations_since_report: AtomicU64,
    /// Sum of evaluation latencies (reset on report)
    eval_latency_sum_us: AtomicU64,
    /// Max evaluation latency (reset on report)
    eval_latency_max_us: AtomicU64,
    /// Evaluation latency histogram (reset on report)
    eval_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Evaluation latency histogram, never reset (Prometheus)
    eval_latency_buckets_total: [AtomicU64; NUM_BUCKETS],
    eval_latency_sum_total_us: AtomicU64,
    /// Evaluations short-circuited (no presence, site/panel missing, disabled)
    skipped_total: AtomicU64,
    /// Evaluations that decided nothing needed doing
    no_action_total: AtomicU64,
    /// Auto-arm actions applied
    auto_arms_total: AtomicU64,
    /// Partitions moved from disarmed to armed
    partitions_armed_total: AtomicU64,
    arm_prompts_total: AtomicU64,
    disarm_prompts_total: AtomicU64,
    /// Evaluation attempts that failed and were retried
    evaluation_retries_total: AtomicU64,
    /// Evaluations that failed after exhausting retries
    evaluation_failures_total: AtomicU64,
    notifications_dispatched: AtomicU64,
    notifications_dropped: AtomicU64,
    /// Queue delay histogram: presence received -> evaluation start (reset on report)
    queue_delay_buckets: [AtomicU64; NUM_BUCKETS],
    queue_delay_max_us: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            presence_received: AtomicU64::new(0),
            presence_dropped: AtomicU64::new(0),
            presence_invalid: AtomicU64::new(0),
            presence_superseded: AtomicU64::new(0),
            evaluations_total: AtomicU64::new(0),
            evaluations_since_report: AtomicU64::new(0),
            eval_latency_sum_us: AtomicU64::new(0),
            eval_latency_max_us: AtomicU64::new(0),
            eval_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            eval_latency_buckets_total: std::array::from_fn(|_| AtomicU64::new(0)),
            eval_latency_sum_total_us: AtomicU64::new(0),
            skipped_total: AtomicU64::new(0),
            no_action_total: AtomicU64::new(0),
            auto_arms_total: AtomicU64::new(0),
            partitions_armed_total: AtomicU64::new(0),
            arm_prompts_total: AtomicU64::new(0),
            disarm_prompts_total: AtomicU64::new(0),
            evaluation_retries_total: AtomicU64::new(0),
            evaluation_failures_total: AtomicU64::new(0),
            notifications_dispatched: AtomicU64::new(0),
            notifications_dropped: AtomicU64::new(0),
            queue_delay_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            queue_delay_max_us: AtomicU64::new(0),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_presence_received(&self) {
        self.presence_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_presence_dropped(&self) {
        self.presence_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_presence_invalid(&self) {
        self.presence_invalid.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_presence_superseded(&self) {
        self.presence_superseded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an evaluation finished with given latency (lock-free)
    #[inline]
    pub fn record_evaluation(&self, latency_us: u64) {
        self.evaluations_total.fetch_add(1, Ordering::Relaxed);
        self.evaluations_since_report.fetch_add(1, Ordering::Relaxed);
        self.eval_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.eval_latency_sum_total_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.eval_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.eval_latency_buckets_total[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.eval_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_skipped(&self) {
        self.skipped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_no_action(&self) {
        self.no_action_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_auto_arm(&self, newly_armed: usize) {
        self.auto_arms_total.fetch_add(1, Ordering::Relaxed);
        self.partitions_armed_total.fetch_add(newly_armed as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_arm_prompt(&self) {
        self.arm_prompts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_disarm_prompt(&self) {
        self.disarm_prompts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_evaluation_retry(&self) {
        self.evaluation_retries_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_evaluation_failed(&self) {
        self.evaluation_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_dispatched(&self) {
        self.notifications_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_dropped(&self) {
        self.notifications_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time from presence receipt to evaluation start
    #[inline]
    pub fn record_queue_delay(&self, delay_us: u64) {
        let bucket = bucket_index(delay_us);
        self.queue_delay_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.queue_delay_max_us, delay_us);
    }

    #[inline]
    pub fn evaluations_total(&self) -> u64 {
        self.evaluations_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn presence_dropped(&self) -> u64 {
        self.presence_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn presence_superseded(&self) -> u64 {
        self.presence_superseded.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn evaluation_failures_total(&self) -> u64 {
        self.evaluation_failures_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn evaluation_retries_total(&self) -> u64 {
        self.evaluation_retries_total.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let evaluations_count = self.evaluations_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.eval_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.eval_latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.eval_latency_buckets);
        let queue_delay_buckets = swap_buckets(&self.queue_delay_buckets);
        let queue_delay_max = self.queue_delay_max_us.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let evaluations_per_sec = if elapsed.as_secs_f64() > 0.0 {
            evaluations_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        self.summarize(SummaryWindow {
            evaluations_count,
            evaluations_per_sec,
            latency_sum,
            max_latency,
            lat_buckets,
            queue_delay_buckets,
            queue_delay_max,
        })
    }

    /// Summary without resetting anything (used by the Prometheus endpoint)
    pub fn snapshot(&self) -> MetricsSummary {
        self.summarize(SummaryWindow {
            evaluations_count: self.evaluations_since_report.load(Ordering::Relaxed),
            evaluations_per_sec: 0.0,
            latency_sum: self.eval_latency_sum_us.load(Ordering::Relaxed),
            max_latency: self.eval_latency_max_us.load(Ordering::Relaxed),
            lat_buckets: load_buckets(&self.eval_latency_buckets),
            queue_delay_buckets: load_buckets(&self.queue_delay_buckets),
            queue_delay_max: self.queue_delay_max_us.load(Ordering::Relaxed),
        })
    }

    fn summarize(&self, window: SummaryWindow) -> MetricsSummary {
        let avg_latency = if window.evaluations_count > 0 {
            window.latency_sum / window.evaluations_count
        } else {
            0
        };

        MetricsSummary {
            presence_received: self.presence_received.load(Ordering::Relaxed),
            presence_dropped: self.presence_dropped.load(Ordering::Relaxed),
            presence_invalid: self.presence_invalid.load(Ordering::Relaxed),
            presence_superseded: self.presence_superseded.load(Ordering::Relaxed),
            evaluations_total: self.evaluations_total.load(Ordering::Relaxed),
            evaluations_per_sec: window.evaluations_per_sec,
            avg_eval_latency_us: avg_latency,
            max_eval_latency_us: window.max_latency,
            lat_p50_us: percentile_from_buckets(&window.lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&window.lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&window.lat_buckets, 0.99),
            lat_buckets: window.lat_buckets,
            lat_buckets_total: load_buckets(&self.eval_latency_buckets_total),
            lat_sum_total_us: self.eval_latency_sum_total_us.load(Ordering::Relaxed),
            skipped_total: self.skipped_total.load(Ordering::Relaxed),
            no_action_total: self.no_action_total.load(Ordering::Relaxed),
            auto_arms_total: self.auto_arms_total.load(Ordering::Relaxed),
            partitions_armed_total: self.partitions_armed_total.load(Ordering::Relaxed),
            arm_prompts_total: self.arm_prompts_total.load(Ordering::Relaxed),
            disarm_prompts_total: self.disarm_prompts_total.load(Ordering::Relaxed),
            evaluation_retries_total: self.evaluation_retries_total.load(Ordering::Relaxed),
            evaluation_failures_total: self.evaluation_failures_total.load(Ordering::Relaxed),
            notifications_dispatched: self.notifications_dispatched.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
            queue_delay_p99_us: percentile_from_buckets(&window.queue_delay_buckets, 0.99),
            queue_delay_max_us: window.queue_delay_max,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic values collected either by swap (report) or load (snapshot)
struct SummaryWindow {
    evaluations_count: u64,
    evaluations_per_sec: f64,
    latency_sum: u64,
    max_latency: u64,
    lat_buckets: [u64; NUM_BUCKETS],
    queue_delay_buckets: [u64; NUM_BUCKETS],
    queue_delay_max: u64,
}

/// Number of histogram buckets (exported for Prometheus)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;
/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub presence_received: u64,
    pub presence_dropped: u64,
    pub presence_invalid: u64,
    pub presence_superseded: u64,
    pub evaluations_total: u64,
    pub evaluations_per_sec: f64,
    pub avg_eval_latency_us: u64,
    pub max_eval_latency_us: u64,
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    /// Evaluation latency buckets for the current window
    pub lat_buckets: [u64; NUM_BUCKETS],
    /// Evaluation latency buckets since startup
    pub lat_buckets_total: [u64; NUM_BUCKETS],
    pub lat_sum_total_us: u64,
    pub skipped_total: u64,
    pub no_action_total: u64,
    pub auto_arms_total: u64,
    pub partitions_armed_total: u64,
    pub arm_prompts_total: u64,
    pub disarm_prompts_total: u64,
    pub evaluation_retries_total: u64,
    pub evaluation_failures_total: u64,
    pub notifications_dispatched: u64,
    pub notifications_dropped: u64,
    pub queue_delay_p99_us: u64,
    pub queue_delay_max_us: u64,
}

impl MetricsSummary {
    /// Log the summary as a single structured record
    pub fn log(&self) {
        info!(
            presence_received = %self.presence_received,
            presence_dropped = %self.presence_dropped,
            presence_superseded = %self.presence_superseded,
            evaluations = %self.evaluations_total,
            evals_per_sec = %format!("{:.2}", self.evaluations_per_sec),
            avg_lat_us = %self.avg_eval_latency_us,
            max_lat_us = %self.max_eval_latency_us,
            lat_p99_us = %self.lat_p99_us,
            auto_arms = %self.auto_arms_total,
            arm_prompts = %self.arm_prompts_total,
            disarm_prompts = %self.disarm_prompts_total,
            skipped = %self.skipped_total,
            retries = %self.evaluation_retries_total,
            failures = %self.evaluation_failures_total,
            notifications_dropped = %self.notifications_dropped,
            "metrics"
        );
    }
}
