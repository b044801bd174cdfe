//! Presence worker - runs geofence evaluations off the listener path
//!
//! Presence sources enqueue updates via an mpsc channel. Each site has at most
//! one evaluation in flight, so slow store I/O for one site never holds up
//! another while updates for the same site are applied in arrival order.
//! Snapshots are full state: an update that arrives while its site is busy
//! waits in a single per-site slot, and a newer one replaces it. Store failures
//! are retried with exponential backoff unless a newer snapshot for the site is
//! waiting; exhausted retries are logged and counted, never silently dropped.

use crate::domain::{PresenceUpdate, PromptKind, SiteId};
use crate::infra::metrics::Metrics;
use crate::services::evaluator::{EvaluateError, Evaluation, GeofenceEvaluator};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Retry schedule for failed evaluations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1)
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, initial_backoff: Duration::from_millis(200) }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), initial_backoff }
    }

    /// Delay before retry number `retry` (1-based): initial, 2x, 4x, ...
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1u32 << shift)
    }
}

/// Latest snapshot per site waiting behind that site's in-flight evaluation
type PendingUpdates = Arc<Mutex<FxHashMap<SiteId, PresenceUpdate>>>;

/// In-flight evaluations, at most one per site
struct SiteLanes {
    tasks: JoinSet<()>,
    sites: FxHashMap<Id, SiteId>,
}

impl SiteLanes {
    fn new() -> Self {
        Self { tasks: JoinSet::new(), sites: FxHashMap::default() }
    }

    fn is_busy(&self, site_id: &SiteId) -> bool {
        self.sites.values().any(|busy| busy == site_id)
    }
}

/// Worker that evaluates presence updates asynchronously
pub struct PresenceWorker {
    evaluator: Arc<GeofenceEvaluator>,
    rx: mpsc::Receiver<PresenceUpdate>,
    metrics: Arc<Metrics>,
    retry: RetryPolicy,
    pending: PendingUpdates,
}

impl PresenceWorker {
    pub fn new(
        evaluator: Arc<GeofenceEvaluator>,
        rx: mpsc::Receiver<PresenceUpdate>,
        metrics: Arc<Metrics>,
        retry: RetryPolicy,
    ) -> Self {
        Self { evaluator, rx, metrics, retry, pending: PendingUpdates::default() }
    }

    /// Run until the channel closes, then wait for in-flight and waiting evaluations
    pub async fn run(mut self) {
        info!(
            max_attempts = %self.retry.max_attempts,
            initial_backoff_ms = %self.retry.initial_backoff.as_millis(),
            "presence_worker_started"
        );

        let mut lanes = SiteLanes::new();

        loop {
            tokio::select! {
                maybe_update = self.rx.recv() => {
                    let Some(update) = maybe_update else { break };
                    if lanes.is_busy(&update.site_id) {
                        self.defer(update);
                    } else {
                        self.spawn_evaluation(&mut lanes, update);
                    }
                }
                Some(joined) = lanes.tasks.join_next_with_id(), if !lanes.tasks.is_empty() => {
                    self.finish_evaluation(&mut lanes, joined);
                }
            }
        }

        while let Some(joined) = lanes.tasks.join_next_with_id().await {
            self.finish_evaluation(&mut lanes, joined);
        }

        info!("presence_worker_stopped");
    }

    /// Park an update until its site is free, replacing any older waiting snapshot
    fn defer(&self, update: PresenceUpdate) {
        let site_id = update.site_id.clone();
        if self.pending.lock().insert(site_id.clone(), update).is_some() {
            self.metrics.record_presence_superseded();
            debug!(site_id = %site_id, "presence_superseded");
        }
    }

    fn spawn_evaluation(&self, lanes: &mut SiteLanes, update: PresenceUpdate) {
        let queue_delay_us = update.received_at.elapsed().as_micros() as u64;
        self.metrics.record_queue_delay(queue_delay_us);
        if queue_delay_us > 100_000 {
            warn!(
                site_id = %update.site_id,
                queue_delay_us = %queue_delay_us,
                "presence_queue_delay_high"
            );
        }

        let site_id = update.site_id.clone();
        let evaluator = self.evaluator.clone();
        let metrics = self.metrics.clone();
        let retry = self.retry;
        let pending = self.pending.clone();
        let waiting_site = site_id.clone();

        let handle = lanes.tasks.spawn(async move {
            let superseded = move || pending.lock().contains_key(&waiting_site);
            process_update(&evaluator, &metrics, retry, update, superseded).await;
        });
        lanes.sites.insert(handle.id(), site_id);
    }

    /// Free the finished site's lane, or hand it the snapshot waiting for it
    fn finish_evaluation(&self, lanes: &mut SiteLanes, joined: Result<(Id, ()), JoinError>) {
        let id = match joined {
            Ok((id, ())) => id,
            Err(e) => {
                error!(error = %e, "presence_evaluation_task_failed");
                e.id()
            }
        };

        let Some(site_id) = lanes.sites.remove(&id) else { return };
        let next = self.pending.lock().remove(&site_id);
        if let Some(update) = next {
            self.spawn_evaluation(lanes, update);
        }
    }
}

/// Evaluate one update with retries and record the outcome
///
/// `superseded` reports whether a newer snapshot for the same site is waiting.
/// A failed attempt is not retried once that holds; the newer snapshot decides.
pub async fn process_update<F>(
    evaluator: &GeofenceEvaluator,
    metrics: &Metrics,
    retry: RetryPolicy,
    update: PresenceUpdate,
    superseded: F,
) -> Option<Evaluation>
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    let result = evaluate_with_retry(evaluator, metrics, retry, &update, superseded).await;
    metrics.record_evaluation(start.elapsed().as_micros() as u64);

    match result {
        Ok(Some(evaluation)) => {
            record_outcome(metrics, &evaluation);
            Some(evaluation)
        }
        Ok(None) => None,
        Err(e) => {
            metrics.record_evaluation_failed();
            error!(
                site_id = %update.site_id,
                attempts = %retry.max_attempts,
                error = %e,
                "geofence_evaluation_failed"
            );
            None
        }
    }
}

/// Run the evaluator until it succeeds, the attempts are used up, or a newer
/// snapshot makes this one stale (`Ok(None)`)
pub async fn evaluate_with_retry<F>(
    evaluator: &GeofenceEvaluator,
    metrics: &Metrics,
    retry: RetryPolicy,
    update: &PresenceUpdate,
    superseded: F,
) -> Result<Option<Evaluation>, EvaluateError>
where
    F: Fn() -> bool,
{
    let mut attempt = 1;
    loop {
        match evaluator.evaluate(&update.site_id, update.presence.as_ref()).await {
            Ok(evaluation) => return Ok(Some(evaluation)),
            Err(e) if attempt < retry.max_attempts => {
                let delay = retry.backoff(attempt);
                warn!(
                    site_id = %update.site_id,
                    attempt = %attempt,
                    retry_in_ms = %delay.as_millis(),
                    error = %e,
                    "geofence_evaluation_retry"
                );
                tokio::time::sleep(delay).await;

                if superseded() {
                    metrics.record_presence_superseded();
                    warn!(
                        site_id = %update.site_id,
                        attempt = %attempt,
                        error = %e,
                        "geofence_retry_abandoned_for_newer_presence"
                    );
                    return Ok(None);
                }

                metrics.record_evaluation_retry();
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn record_outcome(metrics: &Metrics, evaluation: &Evaluation) {
    match evaluation {
        Evaluation::Skipped(_) => metrics.record_skipped(),
        Evaluation::NoAction { .. } => metrics.record_no_action(),
        Evaluation::AutoArmed { newly_armed, .. } => metrics.record_auto_arm(*newly_armed),
        Evaluation::Prompted { kind: PromptKind::ArmPrompt, .. } => metrics.record_arm_prompt(),
        Evaluation::Prompted { kind: PromptKind::DisarmPrompt, .. } => {
            metrics.record_disarm_prompt()
        }
    }
}

/// Create a presence channel and worker
///
/// Returns the sender (for presence sources) and the worker (to be spawned)
pub fn create_presence_worker(
    evaluator: Arc<GeofenceEvaluator>,
    metrics: Arc<Metrics>,
    retry: RetryPolicy,
    buffer_size: usize,
) -> (mpsc::Sender<PresenceUpdate>, PresenceWorker) {
    let (tx, rx) = mpsc::channel(buffer_size);
    let worker = PresenceWorker::new(evaluator, rx, metrics, retry);
    (tx, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Event, GeofenceConfig, GeofenceMode, NewEvent, Panel, PanelId, Partition, PartitionState,
        PresenceState, Site, SiteId,
    };
    use crate::io::memory_store::MemoryStore;
    use crate::io::store::{EventStore, PanelStore, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Event store that fails the first `failures` appends
    struct FlakyEventStore {
        inner: Arc<MemoryStore>,
        failures: AtomicU32,
    }

    #[async_trait]
    impl EventStore for FlakyEventStore {
        async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("flaky".to_string()));
            }
            self.inner.append_event(event).await
        }
    }

    /// Panel store whose first partition write fails
    struct FlakyPanels {
        inner: Arc<MemoryStore>,
        failures: AtomicU32,
    }

    #[async_trait]
    impl PanelStore for FlakyPanels {
        async fn find_panel_by_site(
            &self,
            site_id: &SiteId,
        ) -> Result<Option<(PanelId, Panel)>, StoreError> {
            self.inner.find_panel_by_site(site_id).await
        }

        async fn update_panel_partitions(
            &self,
            panel_id: &PanelId,
            partitions: Vec<Partition>,
        ) -> Result<(), StoreError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("flaky".to_string()));
            }
            self.inner.update_panel_partitions(panel_id, partitions).await
        }
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert_site(Site::new(
            "S1",
            Some(GeofenceConfig { enabled: true, mode: GeofenceMode::Auto }),
        ));
        store.insert_panel(Panel::new("P1", "S1", vec![Partition::new("A", "disarmed")]));
        store
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    fn everyone_out() -> PresenceUpdate {
        PresenceUpdate::new(SiteId::from("S1"), Some(PresenceState::from_members([("a", false)])))
    }

    fn someone_home() -> PresenceUpdate {
        PresenceUpdate::new(SiteId::from("S1"), Some(PresenceState::from_members([("a", true)])))
    }

    fn event_types(store: &MemoryStore) -> Vec<String> {
        store.events().iter().map(|e| e.event_type.as_str().to_string()).collect()
    }

    #[test]
    fn test_backoff_doubles() {
        let retry = RetryPolicy::new(5, Duration::from_millis(200));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
        assert_eq!(retry.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_retry_policy_needs_one_attempt() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_failure() {
        let store = seeded_store();
        let events =
            Arc::new(FlakyEventStore { inner: store.clone(), failures: AtomicU32::new(1) });
        let evaluator = GeofenceEvaluator::new(store.clone(), store.clone(), events);
        let metrics = Metrics::new();

        let outcome = process_update(&evaluator, &metrics, fast_retry(3), everyone_out(), || false).await;

        // First attempt armed the panel but failed to log; the retry arms
        // nothing new and logs once.
        assert_eq!(
            outcome,
            Some(Evaluation::AutoArmed { panel_id: PanelId::from("P1"), newly_armed: 0 })
        );
        assert_eq!(metrics.evaluation_retries_total(), 1);
        assert_eq!(metrics.evaluation_failures_total(), 0);
        assert_eq!(store.events().len(), 1);
        let panel = store.panel(&PanelId::from("P1")).unwrap();
        assert_eq!(panel.partitions[0].state, PartitionState::Armed);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_counted() {
        let store = seeded_store();
        let events =
            Arc::new(FlakyEventStore { inner: store.clone(), failures: AtomicU32::new(10) });
        let evaluator = GeofenceEvaluator::new(store.clone(), store.clone(), events);
        let metrics = Metrics::new();

        let outcome = process_update(&evaluator, &metrics, fast_retry(2), everyone_out(), || false).await;

        assert_eq!(outcome, None);
        assert_eq!(metrics.evaluation_retries_total(), 1);
        assert_eq!(metrics.evaluation_failures_total(), 1);
        assert!(store.events().is_empty());
    }

    #[tokio::test]
    async fn test_worker_drains_channel_on_close() {
        let store = seeded_store();
        let evaluator =
            Arc::new(GeofenceEvaluator::new(store.clone(), store.clone(), store.clone()));
        let metrics = Arc::new(Metrics::new());
        let (tx, worker) = create_presence_worker(evaluator, metrics.clone(), fast_retry(1), 8);

        tx.send(everyone_out()).await.unwrap();
        tx.send(PresenceUpdate::new(SiteId::from("S1"), None)).await.unwrap();
        drop(tx);

        worker.run().await;

        assert_eq!(metrics.evaluations_total(), 2);
        let summary = metrics.snapshot();
        assert_eq!(summary.auto_arms_total, 1);
        assert_eq!(summary.skipped_total, 1);
    }

    #[tokio::test]
    async fn test_failed_arm_is_not_retried_after_arrival() {
        let store = seeded_store();
        let panels =
            Arc::new(FlakyPanels { inner: store.clone(), failures: AtomicU32::new(1) });
        let evaluator = Arc::new(GeofenceEvaluator::new(store.clone(), panels, store.clone()));
        let metrics = Arc::new(Metrics::new());
        let retry = RetryPolicy::new(3, Duration::from_millis(50));
        let (tx, worker) = create_presence_worker(evaluator, metrics.clone(), retry, 8);

        // The arm write fails; alice is back before the retry fires
        tx.send(everyone_out()).await.unwrap();
        tx.send(someone_home()).await.unwrap();
        drop(tx);

        worker.run().await;

        let panel = store.panel(&PanelId::from("P1")).unwrap();
        assert_eq!(panel.partitions[0].state, PartitionState::Disarmed);
        assert!(event_types(&store).is_empty());
        assert_eq!(metrics.presence_superseded(), 1);
        assert_eq!(metrics.evaluation_retries_total(), 0);
        assert_eq!(metrics.snapshot().no_action_total, 1);
    }

    #[tokio::test]
    async fn test_same_site_updates_apply_in_order() {
        let store = seeded_store();
        let evaluator =
            Arc::new(GeofenceEvaluator::new(store.clone(), store.clone(), store.clone()));
        let metrics = Arc::new(Metrics::new());
        let (tx, worker) = create_presence_worker(evaluator, metrics.clone(), fast_retry(1), 8);

        tx.send(everyone_out()).await.unwrap();
        tx.send(someone_home()).await.unwrap();
        drop(tx);

        worker.run().await;

        // Arrival is evaluated against the armed panel and only prompts
        assert_eq!(event_types(&store), vec!["arm", "geofence_prompt"]);
        let panel = store.panel(&PanelId::from("P1")).unwrap();
        assert_eq!(panel.partitions[0].state, PartitionState::Armed);
    }

    #[tokio::test]
    async fn test_waiting_snapshot_is_replaced_by_newer() {
        let store = seeded_store();
        let panels =
            Arc::new(FlakyPanels { inner: store.clone(), failures: AtomicU32::new(1) });
        let evaluator = Arc::new(GeofenceEvaluator::new(store.clone(), panels, store.clone()));
        let metrics = Arc::new(Metrics::new());
        let retry = RetryPolicy::new(3, Duration::from_millis(50));
        let (tx, worker) = create_presence_worker(evaluator, metrics.clone(), retry, 8);

        // Site busy retrying; the arrival waits and is replaced by a second departure
        tx.send(everyone_out()).await.unwrap();
        tx.send(someone_home()).await.unwrap();
        tx.send(everyone_out()).await.unwrap();
        drop(tx);

        worker.run().await;

        assert_eq!(event_types(&store), vec!["arm"]);
        assert_eq!(metrics.presence_superseded(), 2);
        assert_eq!(metrics.evaluations_total(), 2);
    }
}
