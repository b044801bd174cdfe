//! End-to-end geofence evaluation scenarios against the in-memory and JSONL stores

use async_trait::async_trait;
use geofence_gateway::domain::{
    Event, EventType, GeofenceConfig, GeofenceMode, NewEvent, Panel, PanelId, Partition,
    PartitionState, PresenceState, PromptKind, Site, SiteId,
};
use geofence_gateway::io::event_log::read_events;
use geofence_gateway::io::{
    EventStore, JsonlEventStore, MemoryStore, Notification, NotificationDispatcher, PanelStore,
    StoreError,
};
use geofence_gateway::services::{EvaluateError, Evaluation, GeofenceEvaluator, SkipReason};
use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::tempdir;

#[derive(Default)]
struct RecordingDispatcher {
    sent: Mutex<Vec<(String, Notification)>>,
}

impl NotificationDispatcher for RecordingDispatcher {
    fn notify(&self, topic: &str, notification: Notification) {
        self.sent.lock().push((topic.to_string(), notification));
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    dispatcher: Arc<RecordingDispatcher>,
    evaluator: GeofenceEvaluator,
}

impl Harness {
    fn new(geofence: Option<GeofenceConfig>, partitions: Vec<Partition>) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.insert_site(Site::new("S1", geofence));
        store.insert_panel(Panel::new("P1", "S1", partitions));
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let evaluator = GeofenceEvaluator::new(store.clone(), store.clone(), store.clone())
            .with_notifier(dispatcher.clone());
        Self { store, dispatcher, evaluator }
    }

    async fn evaluate(&self, presence: Option<&PresenceState>) -> Evaluation {
        self.evaluator.evaluate(&SiteId::from("S1"), presence).await.unwrap()
    }

    fn partitions(&self) -> Vec<Partition> {
        self.store.panel(&PanelId::from("P1")).unwrap().partitions
    }

    fn event_types(&self) -> Vec<EventType> {
        self.store.events().into_iter().map(|e| e.event_type).collect()
    }
}

fn enabled(mode: GeofenceMode) -> Option<GeofenceConfig> {
    Some(GeofenceConfig { enabled: true, mode })
}

fn mixed_partitions() -> Vec<Partition> {
    vec![Partition::new("A", "disarmed"), Partition::new("B", "armed_away")]
}

fn everyone_left() -> PresenceState {
    PresenceState::from_members([("alice", false), ("bob", false)])
}

fn someone_home() -> PresenceState {
    PresenceState::from_members([("alice", true), ("bob", false)])
}

fn states(partitions: &[Partition]) -> Vec<(Option<&str>, &str)> {
    partitions.iter().map(|p| (p.id.as_deref(), p.state.as_str())).collect()
}

#[tokio::test]
async fn test_everyone_left_auto_mode_arms_disarmed_partitions() {
    let h = Harness::new(enabled(GeofenceMode::Auto), mixed_partitions());

    let result = h.evaluate(Some(&everyone_left())).await;

    assert_eq!(result, Evaluation::AutoArmed { panel_id: PanelId::from("P1"), newly_armed: 1 });
    assert_eq!(states(&h.partitions()), vec![(Some("A"), "armed"), (Some("B"), "armed_away")]);

    let events = h.store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Arm);
    assert_eq!(events[0].panel_id, PanelId::from("P1"));
    assert_eq!(events[0].site_id, SiteId::from("S1"));
    assert_eq!(events[0].source, "geofence");
    assert_eq!(events[0].details, "Auto-armed: everyone left the geofence");
    assert_eq!(events[0].user_id, None);
    assert_eq!(events[0].partition_id, None);
    assert!(h.dispatcher.sent.lock().is_empty());
}

#[tokio::test]
async fn test_everyone_left_prompt_mode_only_prompts() {
    let h = Harness::new(enabled(GeofenceMode::Prompt), mixed_partitions());

    let result = h.evaluate(Some(&everyone_left())).await;

    assert_eq!(
        result,
        Evaluation::Prompted { panel_id: PanelId::from("P1"), kind: PromptKind::ArmPrompt }
    );
    assert_eq!(h.partitions(), mixed_partitions());

    let events = h.store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::GeofencePrompt);
    assert_eq!(events[0].details, "Everyone left \u{2014} arm prompt sent");

    let sent = h.dispatcher.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "site_S1");
    assert_eq!(sent[0].1.kind, "arm_prompt");
    assert_eq!(sent[0].1.panel, "P1");
}

#[tokio::test]
async fn test_unknown_mode_behaves_like_prompt() {
    let h = Harness::new(enabled(GeofenceMode::Other("vacation".to_string())), mixed_partitions());

    h.evaluate(Some(&everyone_left())).await;

    assert_eq!(h.partitions(), mixed_partitions());
    assert_eq!(h.event_types(), vec![EventType::GeofencePrompt]);
}

#[tokio::test]
async fn test_arrival_on_armed_panel_prompts_and_never_disarms() {
    for mode in [GeofenceMode::Auto, GeofenceMode::Prompt] {
        let h = Harness::new(enabled(mode), vec![Partition::new("A", "armed")]);

        let result = h.evaluate(Some(&someone_home())).await;

        assert_eq!(
            result,
            Evaluation::Prompted { panel_id: PanelId::from("P1"), kind: PromptKind::DisarmPrompt }
        );
        assert_eq!(states(&h.partitions()), vec![(Some("A"), "armed")]);
        let events = h.store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::GeofencePrompt);
        assert_eq!(events[0].details, "Someone arrived \u{2014} disarm prompt sent");
        assert_eq!(h.dispatcher.sent.lock()[0].1.kind, "disarm_prompt");
    }
}

#[tokio::test]
async fn test_arrival_with_mixed_partitions_leaves_states_alone() {
    let h = Harness::new(enabled(GeofenceMode::Auto), mixed_partitions());

    h.evaluate(Some(&someone_home())).await;

    assert_eq!(h.partitions(), mixed_partitions());
    assert!(h.partitions().iter().any(|p| p.state.is_armed()));
    assert_eq!(h.event_types(), vec![EventType::GeofencePrompt]);
}

#[tokio::test]
async fn test_arrival_on_disarmed_panel_does_nothing() {
    let partitions = vec![Partition::new("A", "disarmed"), Partition::new("B", "disarmed")];
    let h = Harness::new(enabled(GeofenceMode::Auto), partitions.clone());

    let result = h.evaluate(Some(&someone_home())).await;

    assert_eq!(result, Evaluation::NoAction { panel_id: PanelId::from("P1") });
    assert_eq!(h.partitions(), partitions);
    assert!(h.store.events().is_empty());
    assert!(h.dispatcher.sent.lock().is_empty());
}

#[tokio::test]
async fn test_auto_arm_twice_converges() {
    let h = Harness::new(enabled(GeofenceMode::Auto), mixed_partitions());

    h.evaluate(Some(&everyone_left())).await;
    let once = h.partitions();
    let second = h.evaluate(Some(&everyone_left())).await;

    assert_eq!(second, Evaluation::AutoArmed { panel_id: PanelId::from("P1"), newly_armed: 0 });
    assert_eq!(h.partitions(), once);
    // Each evaluation logs its own arm event
    assert_eq!(h.event_types(), vec![EventType::Arm, EventType::Arm]);
}

#[tokio::test]
async fn test_empty_membership_counts_as_everyone_left() {
    let h = Harness::new(enabled(GeofenceMode::Auto), mixed_partitions());
    let empty: PresenceState = serde_json::from_str(r#"{"members": {}}"#).unwrap();

    h.evaluate(Some(&empty)).await;

    assert_eq!(h.partitions()[0].state, PartitionState::Armed);
    assert_eq!(h.event_types(), vec![EventType::Arm]);
}

#[tokio::test]
async fn test_non_boolean_inside_is_not_presence() {
    let h = Harness::new(enabled(GeofenceMode::Auto), mixed_partitions());
    let presence: PresenceState =
        serde_json::from_str(r#"{"members": {"alice": {"inside": "yes"}, "bob": {}}}"#).unwrap();

    let result = h.evaluate(Some(&presence)).await;

    assert!(matches!(result, Evaluation::AutoArmed { .. }));
}

#[tokio::test]
async fn test_skips_produce_no_mutation_or_events() {
    let cases: Vec<(Option<GeofenceConfig>, Option<PresenceState>, SkipReason)> = vec![
        (enabled(GeofenceMode::Auto), None, SkipReason::NoPresence),
        (enabled(GeofenceMode::Auto), Some(PresenceState::default()), SkipReason::NoPresence),
        (None, Some(everyone_left()), SkipReason::GeofenceDisabled),
        (
            Some(GeofenceConfig { enabled: false, mode: GeofenceMode::Auto }),
            Some(everyone_left()),
            SkipReason::GeofenceDisabled,
        ),
    ];

    for (geofence, presence, reason) in cases {
        let h = Harness::new(geofence, mixed_partitions());
        let result = h.evaluate(presence.as_ref()).await;

        assert_eq!(result, Evaluation::Skipped(reason));
        assert_eq!(h.partitions(), mixed_partitions());
        assert!(h.store.events().is_empty());
        assert!(h.dispatcher.sent.lock().is_empty());
    }
}

#[tokio::test]
async fn test_missing_site_or_panel_is_skipped() {
    let store = Arc::new(MemoryStore::new());
    store.insert_site(Site::new("S2", enabled(GeofenceMode::Auto)));
    let evaluator = GeofenceEvaluator::new(store.clone(), store.clone(), store.clone());

    let unknown = evaluator.evaluate(&SiteId::from("S9"), Some(&everyone_left())).await.unwrap();
    assert_eq!(unknown, Evaluation::Skipped(SkipReason::SiteNotFound));

    let no_panel = evaluator.evaluate(&SiteId::from("S2"), Some(&everyone_left())).await.unwrap();
    assert_eq!(no_panel, Evaluation::Skipped(SkipReason::PanelNotFound));
    assert!(store.events().is_empty());
}

struct FailingEventStore;

#[async_trait]
impl EventStore for FailingEventStore {
    async fn append_event(&self, _event: NewEvent) -> Result<Event, StoreError> {
        Err(StoreError::Unavailable("event store down".to_string()))
    }
}

struct FailingPanelWrites {
    inner: Arc<MemoryStore>,
}

#[async_trait]
impl PanelStore for FailingPanelWrites {
    async fn find_panel_by_site(
        &self,
        site_id: &SiteId,
    ) -> Result<Option<(PanelId, Panel)>, StoreError> {
        self.inner.find_panel_by_site(site_id).await
    }

    async fn update_panel_partitions(
        &self,
        panel_id: &PanelId,
        _partitions: Vec<Partition>,
    ) -> Result<(), StoreError> {
        Err(StoreError::Conflict { entity: "panel", id: panel_id.0.clone() })
    }
}

#[tokio::test]
async fn test_failed_event_append_keeps_arm_and_surfaces_error() {
    let h = Harness::new(enabled(GeofenceMode::Auto), mixed_partitions());
    let evaluator =
        GeofenceEvaluator::new(h.store.clone(), h.store.clone(), Arc::new(FailingEventStore));

    let result = evaluator.evaluate(&SiteId::from("S1"), Some(&everyone_left())).await;

    assert!(matches!(result, Err(EvaluateError::EventAppend { .. })));
    assert_eq!(h.partitions()[0].state, PartitionState::Armed);

    // A redelivery against a healthy event store converges and logs once
    h.evaluate(Some(&everyone_left())).await;
    assert_eq!(h.partitions()[0].state, PartitionState::Armed);
    assert_eq!(h.event_types(), vec![EventType::Arm]);
}

#[tokio::test]
async fn test_failed_panel_update_logs_nothing() {
    let h = Harness::new(enabled(GeofenceMode::Auto), mixed_partitions());
    let panels = Arc::new(FailingPanelWrites { inner: h.store.clone() });
    let evaluator = GeofenceEvaluator::new(h.store.clone(), panels, h.store.clone());

    let result = evaluator.evaluate(&SiteId::from("S1"), Some(&everyone_left())).await;

    let Err(EvaluateError::PanelUpdate { panel_id, source }) = result else {
        panic!("expected PanelUpdate error, got {result:?}");
    };
    assert_eq!(panel_id, PanelId::from("P1"));
    assert!(matches!(source, StoreError::Conflict { .. }));
    assert_eq!(h.partitions(), mixed_partitions());
    assert!(h.store.events().is_empty());
}

#[tokio::test]
async fn test_failed_prompt_log_sends_no_notification() {
    let h = Harness::new(enabled(GeofenceMode::Prompt), mixed_partitions());
    let evaluator =
        GeofenceEvaluator::new(h.store.clone(), h.store.clone(), Arc::new(FailingEventStore))
            .with_notifier(h.dispatcher.clone());

    let result = evaluator.evaluate(&SiteId::from("S1"), Some(&everyone_left())).await;

    assert!(matches!(result, Err(EvaluateError::EventAppend { .. })));
    assert!(h.dispatcher.sent.lock().is_empty());
}

#[tokio::test]
async fn test_events_written_to_jsonl() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("audit").join("events.jsonl");

    let store = Arc::new(MemoryStore::new());
    store.insert_site(Site::new("S1", enabled(GeofenceMode::Auto)));
    store.insert_panel(Panel::new("P1", "S1", mixed_partitions()));
    let events = Arc::new(JsonlEventStore::new(&path));
    let evaluator = GeofenceEvaluator::new(store.clone(), store.clone(), events);

    evaluator.evaluate(&SiteId::from("S1"), Some(&everyone_left())).await.unwrap();
    evaluator.evaluate(&SiteId::from("S1"), Some(&someone_home())).await.unwrap();

    let logged = read_events(&path).unwrap();
    assert_eq!(logged.len(), 2);
    assert_eq!(logged[0].event_type, EventType::Arm);
    assert_eq!(logged[1].event_type, EventType::GeofencePrompt);
    assert!(logged[0].timestamp <= logged[1].timestamp);
    assert_ne!(logged[0].id, logged[1].id);
}
