//! End-to-end scenarios against the assembled engine with in-memory stores
//! and a recording dispatcher. Each test drives the public surface only:
//! submit, post events, report executor outcomes, and observe dispatches.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use flywheel_testing::{
    cancel_path_machine, event, join_machine, linear_machine, InMemoryBackend,
    RecordingDispatcher,
};

use flywheel_core::{
    async_trait, Engine, EngineConfig, EngineError, EventData, EventDefinition, EventScope,
    EventStatus, ExecutionUpdate, ExecutionVersion, MachineStatus, State, StateDefinition,
    StateId, StateMachineDefinition, StateStatus, StateStore,
};

/// Constant short delay so redrive scenarios run in test time.
struct FixedBackoff(Duration);

impl flywheel_core::BackoffPolicy for FixedBackoff {
    fn redrive_delay(&self, _retry_count: u32, _timeout_ms: u64) -> Duration {
        self.0
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        max_retry_count: 10,
        max_replayable_retries: 5,
        redriver_poll_interval: Duration::from_millis(50),
        redriver_batch_size: 10,
        redriver_initial_delay: Duration::ZERO,
        removal_batch_size: 10,
        removal_max_wait: Duration::from_millis(50),
        scheduler_poll_interval: Duration::from_millis(50),
        scheduler_batch_size: 10,
        backoff_step_ms: 1_000,
    }
}

fn harness() -> (Engine, Arc<InMemoryBackend>, Arc<RecordingDispatcher>) {
    let backend = InMemoryBackend::new();
    let dispatcher = RecordingDispatcher::new();
    let engine = Engine::builder(backend.stores(), dispatcher.clone())
        .config(test_config())
        .endpoint("default", "http://localhost:9997")
        .build();
    (engine, backend, dispatcher)
}

/// Same harness but with near-immediate redrive timers.
fn redriving_harness() -> (Engine, Arc<InMemoryBackend>, Arc<RecordingDispatcher>) {
    let backend = InMemoryBackend::new();
    let dispatcher = RecordingDispatcher::new();
    let engine = Engine::builder(backend.stores(), dispatcher.clone())
        .config(test_config())
        .backoff(Arc::new(FixedBackoff(Duration::from_millis(10))))
        .endpoint("default", "http://localhost:9997")
        .build();
    (engine, backend, dispatcher)
}

fn machine_scope(sm_id: &str) -> EventScope {
    EventScope::MachineId(sm_id.to_string())
}

fn state_def(
    name: &str,
    deps: Vec<EventDefinition>,
    output: Option<EventDefinition>,
) -> StateDefinition {
    StateDefinition {
        name: name.to_string(),
        description: None,
        task: format!("task.{name}"),
        on_entry_hook: None,
        on_exit_hook: None,
        dependencies: deps,
        retry_count: 2,
        timeout_ms: 1_000,
        output_event: output,
        replayable_retries: 5,
    }
}

fn definition(name: &str, states: Vec<StateDefinition>) -> StateMachineDefinition {
    StateMachineDefinition {
        name: name.to_string(),
        version: 1,
        description: None,
        correlation_id: None,
        callback_endpoint_id: "default".to_string(),
        states,
        seed_events: Vec::new(),
    }
}

/// A chain whose middle link hangs off a replayable event:
/// `start -> fetch -> payload(replayable) -> transform -> transformed -> load`.
fn replay_machine() -> StateMachineDefinition {
    definition(
        "replay",
        vec![
            state_def(
                "fetch",
                vec![EventDefinition::new("start", "json")],
                Some(EventDefinition::new("payload", "json")),
            ),
            state_def(
                "transform",
                vec![EventDefinition::replayable("payload", "json")],
                Some(EventDefinition::new("transformed", "json")),
            ),
            state_def(
                "load",
                vec![EventDefinition::new("transformed", "json")],
                None,
            ),
        ],
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn submission_persists_graph_and_audits_every_state() {
    let (engine, backend, dispatcher) = harness();
    let machine = engine.submit(&linear_machine()).await.unwrap();

    assert_eq!(machine.status, MachineStatus::Initialized);
    assert_eq!(machine.states.len(), 3);
    let stored = backend.machine(&machine.id).unwrap();
    assert_eq!(stored.states[0].id, 1);
    assert_eq!(backend.event(&machine.id, "start").unwrap().status, EventStatus::Pending);

    let records = backend.audit_records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == StateStatus::Initialized));
    // Nothing runs before an event arrives.
    assert_eq!(dispatcher.sent_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn seed_events_dispatch_before_submit_returns() {
    let (engine, _backend, dispatcher) = harness();
    let mut definition = linear_machine();
    definition.seed_events = vec![event("start")];

    let machine = engine.submit(&definition).await.unwrap();
    assert_eq!(machine.status, MachineStatus::Running);
    assert_eq!(dispatcher.sent_for_state(1).len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn dependency_free_state_dispatches_at_submission() {
    let (engine, backend, dispatcher) = harness();
    let machine = engine
        .submit(&definition(
            "bootstrap",
            vec![
                state_def("boot", vec![], Some(EventDefinition::new("booted", "json"))),
                state_def("serve", vec![EventDefinition::new("booted", "json")], None),
            ],
        ))
        .await
        .unwrap();

    // No gating event exists for "boot", so submission itself must run it.
    assert_eq!(machine.status, MachineStatus::Running);
    assert_eq!(dispatcher.sent_for_state(1).len(), 1);
    assert_eq!(dispatcher.sent_for_state(2).len(), 0);
    assert_eq!(
        backend.machine(&machine.id).unwrap().state(1).unwrap().status,
        StateStatus::Running
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn join_dispatches_only_when_every_gate_is_open() {
    let (engine, _backend, dispatcher) = harness();
    let machine = engine.submit(&join_machine()).await.unwrap();
    let scope = machine_scope(&machine.id);

    engine.post_event(&scope, &event("event1")).await.unwrap();
    // "left" runs, the two-input "gated" state does not.
    assert_eq!(dispatcher.sent_for_state(1).len(), 1);
    assert_eq!(dispatcher.sent_for_state(4).len(), 0);

    engine.post_event(&scope, &event("event2")).await.unwrap();
    assert_eq!(dispatcher.sent_for_state(2).len(), 1);
    assert_eq!(dispatcher.sent_for_state(4).len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_event_delivery_does_not_double_dispatch() {
    let (engine, _backend, dispatcher) = harness();
    let machine = engine.submit(&join_machine()).await.unwrap();
    let scope = machine_scope(&machine.id);

    engine.post_event(&scope, &event("event1")).await.unwrap();
    engine.post_event(&scope, &event("event1")).await.unwrap();
    assert_eq!(dispatcher.sent_for_state(1).len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn completion_triggers_output_event_and_finishes_the_machine() {
    let (engine, backend, dispatcher) = harness();
    let machine = engine.submit(&linear_machine()).await.unwrap();
    let scope = machine_scope(&machine.id);

    engine.post_event(&scope, &event("start")).await.unwrap();
    assert_eq!(dispatcher.sent_for_state(1).len(), 1);

    engine
        .update_task_status(&machine.id, 1, 0, &ExecutionUpdate::completed(Some(event("e1"))))
        .await
        .unwrap();
    // The output event propagated the wave to the second state.
    assert_eq!(backend.event(&machine.id, "e1").unwrap().status, EventStatus::Triggered);
    assert_eq!(dispatcher.sent_for_state(2).len(), 1);

    engine
        .update_task_status(&machine.id, 2, 0, &ExecutionUpdate::completed(Some(event("e2"))))
        .await
        .unwrap();
    engine
        .update_task_status(&machine.id, 3, 0, &ExecutionUpdate::completed(None))
        .await
        .unwrap();

    let finished = backend.machine(&machine.id).unwrap();
    assert_eq!(finished.status, MachineStatus::Completed);
    assert!(finished.states.iter().all(|s| s.status == StateStatus::Completed));

    // Redrive records drain through the deferred removal queue.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(backend.scheduled_message_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_execution_version_is_a_no_op() {
    let (engine, backend, _dispatcher) = harness();
    let machine = engine.submit(&linear_machine()).await.unwrap();
    let scope = machine_scope(&machine.id);
    engine.post_event(&scope, &event("start")).await.unwrap();

    engine
        .update_task_status(&machine.id, 1, 5, &ExecutionUpdate::completed(None))
        .await
        .unwrap();
    let state = backend.machine(&machine.id).unwrap().state(1).unwrap().clone();
    assert_eq!(state.status, StateStatus::Running);
}

#[tokio::test(flavor = "multi_thread")]
async fn executor_error_with_budget_left_marks_errored() {
    let (engine, backend, _dispatcher) = harness();
    let machine = engine.submit(&linear_machine()).await.unwrap();
    let scope = machine_scope(&machine.id);
    engine.post_event(&scope, &event("start")).await.unwrap();

    engine
        .update_task_status(&machine.id, 1, 0, &ExecutionUpdate::errored("boom"))
        .await
        .unwrap();
    let state = backend.machine(&machine.id).unwrap().state(1).unwrap().clone();
    assert_eq!(state.status, StateStatus::Errored);

    let audits = backend.audit_records();
    let errored = audits
        .iter()
        .find(|r| r.state_id == 1 && r.status == StateStatus::Errored)
        .unwrap();
    assert_eq!(errored.error_message.as_deref(), Some("boom"));
}

#[tokio::test(flavor = "multi_thread")]
async fn unacknowledged_task_is_redriven_then_sidelined() {
    let (engine, backend, dispatcher) = redriving_harness();
    let machine = engine.submit(&linear_machine()).await.unwrap();
    let scope = machine_scope(&machine.id);

    // Dispatch and never acknowledge. The fixtures give each state a retry
    // budget of 2, so after the initial attempt and two redrives the state
    // must be sidelined.
    engine.post_event(&scope, &event("start")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let state = backend.machine(&machine.id).unwrap().state(1).unwrap().clone();
    assert_eq!(state.status, StateStatus::Sidelined);
    assert!(dispatcher.sent_for_state(1).len() >= 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn unsideline_resets_the_budget_and_redispatches() {
    let (engine, backend, dispatcher) = redriving_harness();
    let machine = engine.submit(&linear_machine()).await.unwrap();
    let scope = machine_scope(&machine.id);

    engine.post_event(&scope, &event("start")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(
        backend.machine(&machine.id).unwrap().state(1).unwrap().status,
        StateStatus::Sidelined
    );
    let dispatches_before = dispatcher.sent_for_state(1).len();

    engine.unsideline(&machine.id, 1).await.unwrap();
    let state = backend.machine(&machine.id).unwrap().state(1).unwrap().clone();
    assert_eq!(state.attempted_retries, 0);
    assert_eq!(state.status, StateStatus::Running);
    assert_eq!(dispatcher.sent_for_state(1).len(), dispatches_before + 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unsideline_rejects_states_that_are_not_stuck() {
    let (engine, _backend, _dispatcher) = harness();
    let machine = engine.submit(&linear_machine()).await.unwrap();

    let error = engine.unsideline(&machine.id, 1).await.unwrap_err();
    assert!(matches!(error, EngineError::UpdateForbidden(_)));
    assert_eq!(error.status_code(), 403);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_cascades_but_stops_at_the_surviving_join() {
    let (engine, backend, dispatcher) = harness();
    let machine = engine.submit(&cancel_path_machine()).await.unwrap();
    let scope = machine_scope(&machine.id);

    // Drive the upper branch to completion: event1 and event2 triggered.
    engine.post_event(&scope, &event("start")).await.unwrap();
    engine
        .update_task_status(&machine.id, 1, 0, &ExecutionUpdate::completed(Some(event("event1"))))
        .await
        .unwrap();
    engine
        .update_task_status(&machine.id, 2, 0, &ExecutionUpdate::completed(Some(event("event2"))))
        .await
        .unwrap();

    // Cancel the lower branch at its source.
    engine.cancel_event(&scope, "event3").await.unwrap();

    let cancelled = backend.machine(&machine.id).unwrap();
    for state_id in [5, 6, 7] {
        assert_eq!(
            cancelled.state(state_id).unwrap().status,
            StateStatus::Cancelled,
            "state {state_id} should be cancelled"
        );
    }
    for event_name in ["event3", "event4", "event5", "event6"] {
        assert_eq!(
            backend.event(&machine.id, event_name).unwrap().status,
            EventStatus::Cancelled,
            "{event_name} should be cancelled"
        );
    }
    // state3 survives on its triggered input and runs on partial input.
    assert_eq!(cancelled.state(3).unwrap().status, StateStatus::Running);
    let dispatched = dispatcher.sent_for_state(3);
    assert_eq!(dispatched.len(), 1);
    let statuses: Vec<bool> = dispatched[0].events.iter().map(|e| e.cancelled).collect();
    // Payloads arrive in dependency order: triggered event2, cancelled event6.
    assert_eq!(dispatched[0].events[0].name, "event2");
    assert_eq!(statuses, vec![false, true]);
}

#[tokio::test(flavor = "multi_thread")]
async fn machine_with_a_cancelled_state_finishes_cancelled() {
    let (engine, backend, _dispatcher) = harness();
    let machine = engine.submit(&join_machine()).await.unwrap();
    let scope = machine_scope(&machine.id);

    engine.post_event(&scope, &event("event1")).await.unwrap();
    engine
        .update_task_status(&machine.id, 1, 0, &ExecutionUpdate::completed(Some(event("left_done"))))
        .await
        .unwrap();
    // Cancelling event2 sweeps "right", then "merge" runs on the surviving
    // branch and "gated" runs as a join with one triggered input.
    engine.cancel_event(&scope, "event2").await.unwrap();
    engine
        .update_task_status(&machine.id, 3, 0, &ExecutionUpdate::completed(None))
        .await
        .unwrap();
    engine
        .update_task_status(&machine.id, 4, 0, &ExecutionUpdate::completed(None))
        .await
        .unwrap();

    let finished = backend.machine(&machine.id).unwrap();
    assert_eq!(finished.state(2).unwrap().status, StateStatus::Cancelled);
    assert_eq!(finished.status, MachineStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_correlation_id_is_rejected() {
    let (engine, _backend, _dispatcher) = harness();
    let mut definition = linear_machine();
    definition.correlation_id = Some("order-42".to_string());

    engine.submit(&definition).await.unwrap();
    let error = engine.submit(&definition).await.unwrap_err();
    assert!(matches!(error, EngineError::DuplicateMachine(_)));
    assert_eq!(error.status_code(), 409);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_machine_and_event_are_not_found() {
    let (engine, _backend, _dispatcher) = harness();
    let error = engine
        .post_event(&machine_scope("no-such-machine"), &event("start"))
        .await
        .unwrap_err();
    assert_eq!(error.status_code(), 404);

    let machine = engine.submit(&linear_machine()).await.unwrap();
    let error = engine
        .post_event(&machine_scope(&machine.id), &event("undeclared"))
        .await
        .unwrap_err();
    assert!(matches!(error, EngineError::EventNotFound(_, _)));
}

#[tokio::test(flavor = "multi_thread")]
async fn delayed_event_requires_correlation_scope() {
    let (engine, _backend, _dispatcher) = harness();
    let machine = engine.submit(&linear_machine()).await.unwrap();

    let error = engine
        .post_delayed_event(&machine_scope(&machine.id), &event("start"), 0)
        .await
        .unwrap_err();
    assert!(matches!(error, EngineError::Malformed(_)));
    assert_eq!(error.status_code(), 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn delayed_event_fires_once_its_time_passes() {
    let (engine, backend, dispatcher) = harness();
    let mut definition = linear_machine();
    definition.correlation_id = Some("order-42".to_string());
    engine.submit(&definition).await.unwrap();

    let scope = EventScope::CorrelationId("order-42".to_string());
    engine
        .post_delayed_event(&scope, &event("start"), chrono::Utc::now().timestamp() - 1)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(dispatcher.sent_for_state(1).len(), 1);
    assert_eq!(backend.scheduled_event_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn event_data_update_is_forbidden_while_the_consumer_could_run() {
    let (engine, backend, _dispatcher) = harness();
    let machine = engine.submit(&linear_machine()).await.unwrap();
    let scope = machine_scope(&machine.id);

    let error = engine
        .update_event_data(&scope, &event("start"))
        .await
        .unwrap_err();
    assert!(matches!(error, EngineError::UpdateForbidden(_)));

    // Once the consumer has errored, the payload may be replaced; the
    // consumer then resumes against the corrected data with a fresh budget.
    engine.post_event(&scope, &event("start")).await.unwrap();
    engine
        .update_task_status(&machine.id, 1, 0, &ExecutionUpdate::errored("bad input"))
        .await
        .unwrap();
    let replacement = EventData::new("start", "json", Some(serde_json::json!({"fixed": true})));
    engine.update_event_data(&scope, &replacement).await.unwrap();
    assert_eq!(
        backend.event(&machine.id, "start").unwrap().data,
        Some(serde_json::json!({"fixed": true}))
    );
    let state = backend.machine(&machine.id).unwrap().state(1).unwrap().clone();
    assert_eq!(state.status, StateStatus::Running);
    assert_eq!(state.attempted_retries, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn event_data_update_without_data_is_malformed() {
    let (engine, _backend, _dispatcher) = harness();
    let machine = engine.submit(&linear_machine()).await.unwrap();
    let scope = machine_scope(&machine.id);

    let empty = EventData::new("start", "json", None);
    let error = engine.update_event_data(&scope, &empty).await.unwrap_err();
    assert!(matches!(error, EngineError::Malformed(_)));
    assert_eq!(error.status_code(), 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_workflow_finishes_everything_cancelled() {
    let (engine, backend, _dispatcher) = harness();
    let machine = engine.submit(&join_machine()).await.unwrap();
    let scope = machine_scope(&machine.id);

    engine.post_event(&scope, &event("event1")).await.unwrap();
    engine
        .update_task_status(&machine.id, 1, 0, &ExecutionUpdate::completed(Some(event("left_done"))))
        .await
        .unwrap();

    engine.cancel_workflow(&scope).await.unwrap();

    let cancelled = backend.machine(&machine.id).unwrap();
    assert_eq!(cancelled.status, MachineStatus::Cancelled);
    // The completed state keeps its outcome; everything unfinished falls.
    assert_eq!(cancelled.state(1).unwrap().status, StateStatus::Completed);
    for state_id in [2, 3, 4] {
        assert_eq!(cancelled.state(state_id).unwrap().status, StateStatus::Cancelled);
    }
    assert_eq!(
        backend.event(&machine.id, "event2").unwrap().status,
        EventStatus::Cancelled
    );
    // A machine that finished cancelled ignores further events.
    engine.post_event(&scope, &event("event2")).await.unwrap();
    assert_eq!(
        backend.machine(&machine.id).unwrap().state(2).unwrap().status,
        StateStatus::Cancelled
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn graph_snapshot_reflects_progress() {
    let (engine, _backend, _dispatcher) = harness();
    let machine = engine.submit(&linear_machine()).await.unwrap();
    let scope = machine_scope(&machine.id);
    engine.post_event(&scope, &event("start")).await.unwrap();

    let graph = engine.fsm_graph(&machine.id).await.unwrap();
    assert_eq!(graph.states.len(), 3);
    let first = graph.states.iter().find(|s| s.id == 1).unwrap();
    assert_eq!(first.status, StateStatus::Running);
    let start = graph.events.iter().find(|e| e.name == "start").unwrap();
    assert_eq!(start.status, EventStatus::Triggered);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_storm_dispatches_each_state_at_most_once() {
    let (engine, _backend, dispatcher) = harness();
    let machine = engine.submit(&join_machine()).await.unwrap();
    let scope = machine_scope(&machine.id);

    engine.post_event(&scope, &event("event1")).await.unwrap();
    engine.post_event(&scope, &event("event2")).await.unwrap();
    for _ in 0..50 {
        let name = if fastrand::bool() { "event1" } else { "event2" };
        engine.post_event(&scope, &event(name)).await.unwrap();
    }

    for state_id in [1, 2, 4] {
        assert_eq!(
            dispatcher.sent_for_state(state_id).len(),
            1,
            "state {state_id} dispatched more than once"
        );
    }
    // "merge" waits on branch outputs that never triggered.
    assert_eq!(dispatcher.sent_for_state(3).len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn errored_states_query_finds_stuck_work() {
    let (engine, _backend, _dispatcher) = harness();
    let machine = engine.submit(&linear_machine()).await.unwrap();
    let scope = machine_scope(&machine.id);
    engine.post_event(&scope, &event("start")).await.unwrap();
    engine
        .update_task_status(&machine.id, 1, 0, &ExecutionUpdate::errored("boom"))
        .await
        .unwrap();

    let from = chrono::Utc::now() - chrono::Duration::minutes(1);
    let to = chrono::Utc::now() + chrono::Duration::minutes(1);
    let stuck = engine.errored_states("linear", from, to).await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].id, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn status_write_requires_the_expected_status() {
    let (engine, backend, _dispatcher) = harness();
    let machine = engine.submit(&linear_machine()).await.unwrap();

    // State 1 is Initialized: a write expecting Running must not land.
    let stores = backend.stores();
    let wrote = stores
        .states
        .update_status(&machine.id, 1, &[StateStatus::Running], StateStatus::Completed)
        .await
        .unwrap();
    assert!(!wrote);
    assert_eq!(
        backend.machine(&machine.id).unwrap().state(1).unwrap().status,
        StateStatus::Initialized
    );

    let wrote = stores
        .states
        .update_status(&machine.id, 1, &[StateStatus::Initialized], StateStatus::Running)
        .await
        .unwrap();
    assert!(wrote);
    assert_eq!(
        backend.machine(&machine.id).unwrap().state(1).unwrap().status,
        StateStatus::Running
    );
}

/// Delegates to the in-memory backend but holds each state read open for a
/// while before returning it, so a concurrent transition can land in between
/// the snapshot and the write that acts on it.
struct SlowReadStateStore {
    inner: Arc<InMemoryBackend>,
    read_delay: Duration,
}

#[async_trait]
impl StateStore for SlowReadStateStore {
    async fn find_by_id(&self, sm_id: &str, state_id: StateId) -> anyhow::Result<Option<State>> {
        let state = StateStore::find_by_id(self.inner.as_ref(), sm_id, state_id).await?;
        tokio::time::sleep(self.read_delay).await;
        Ok(state)
    }

    async fn update_status(
        &self,
        sm_id: &str,
        state_id: StateId,
        expected: &[StateStatus],
        to: StateStatus,
    ) -> anyhow::Result<bool> {
        StateStore::update_status(self.inner.as_ref(), sm_id, state_id, expected, to).await
    }

    async fn increment_attempted_retries(
        &self,
        sm_id: &str,
        state_id: StateId,
    ) -> anyhow::Result<u32> {
        self.inner.increment_attempted_retries(sm_id, state_id).await
    }

    async fn reset_attempted_retries(&self, sm_id: &str, state_id: StateId) -> anyhow::Result<()> {
        self.inner.reset_attempted_retries(sm_id, state_id).await
    }

    async fn update_execution_version(
        &self,
        sm_id: &str,
        state_id: StateId,
        execution_version: ExecutionVersion,
    ) -> anyhow::Result<()> {
        self.inner
            .update_execution_version(sm_id, state_id, execution_version)
            .await
    }

    async fn increment_attempted_replayable_retries(
        &self,
        sm_id: &str,
        state_id: StateId,
    ) -> anyhow::Result<u32> {
        self.inner
            .increment_attempted_replayable_retries(sm_id, state_id)
            .await
    }

    async fn find_errored_states(
        &self,
        machine_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<State>> {
        self.inner.find_errored_states(machine_name, from, to).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_racing_a_dispatch_snapshot_wins() {
    let backend = InMemoryBackend::new();
    let dispatcher = RecordingDispatcher::new();
    let mut stores = backend.stores();
    stores.states = Arc::new(SlowReadStateStore {
        inner: Arc::clone(&backend),
        read_delay: Duration::from_millis(200),
    });
    let engine = Arc::new(
        Engine::builder(stores, dispatcher.clone())
            .config(test_config())
            .endpoint("default", "http://localhost:9997")
            .build(),
    );
    let machine = engine.submit(&linear_machine()).await.unwrap();
    let scope = machine_scope(&machine.id);

    // The event post snapshots state 1 as dispatchable and then stalls; the
    // workflow cancel lands mid-stall. The stale dispatch must be dropped.
    let poster = {
        let engine = Arc::clone(&engine);
        let scope = scope.clone();
        tokio::spawn(async move { engine.post_event(&scope, &event("start")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.cancel_workflow(&scope).await.unwrap();
    poster.await.unwrap().unwrap();

    let raced = backend.machine(&machine.id).unwrap();
    assert_eq!(raced.status, MachineStatus::Cancelled);
    assert_eq!(raced.state(1).unwrap().status, StateStatus::Cancelled);
    assert_eq!(dispatcher.sent_for_state(1).len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn replay_restarts_the_downstream_subgraph_at_a_new_version() {
    let (engine, backend, dispatcher) = harness();
    let machine = engine.submit(&replay_machine()).await.unwrap();
    let scope = machine_scope(&machine.id);

    engine.post_event(&scope, &event("start")).await.unwrap();
    engine
        .update_task_status(&machine.id, 1, 0, &ExecutionUpdate::completed(Some(event("payload"))))
        .await
        .unwrap();
    engine
        .update_task_status(&machine.id, 2, 0, &ExecutionUpdate::completed(Some(event("transformed"))))
        .await
        .unwrap();
    assert_eq!(dispatcher.sent_for_state(3).len(), 1);

    let corrected = EventData::new("payload", "json", Some(serde_json::json!({"take": 2})));
    engine.post_replay_event(&scope, &corrected).await.unwrap();

    let replayed = backend.machine(&machine.id).unwrap();
    // The consumer re-runs at the bumped version with the corrected payload.
    let transform = replayed.state(2).unwrap();
    assert_eq!(transform.execution_version, 1);
    assert_eq!(transform.status, StateStatus::Running);
    assert_eq!(transform.attempted_replayable_retries, 1);
    let sent = dispatcher.sent_for_state(2);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].execution_version, 1);
    assert_eq!(
        sent[1].events[0].data,
        Some(serde_json::json!({"take": 2}))
    );

    // Downstream of the consumer is reset, waiting on the new wave.
    let load = replayed.state(3).unwrap();
    assert_eq!(load.execution_version, 1);
    assert_eq!(load.status, StateStatus::Initialized);
    assert_eq!(
        backend.event(&machine.id, "transformed").unwrap().status,
        EventStatus::Pending
    );
    // Upstream of the replayed event is untouched.
    assert_eq!(replayed.state(1).unwrap().status, StateStatus::Completed);

    // A late callback for the pre-replay generation is stale and ignored.
    engine
        .update_task_status(&machine.id, 2, 0, &ExecutionUpdate::completed(None))
        .await
        .unwrap();
    assert_eq!(
        backend.machine(&machine.id).unwrap().state(2).unwrap().status,
        StateStatus::Running
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn replay_budget_exhaustion_is_rejected() {
    let (engine, _backend, _dispatcher) = harness();
    let mut def = replay_machine();
    def.states[1].replayable_retries = 1;
    let machine = engine.submit(&def).await.unwrap();
    let scope = machine_scope(&machine.id);

    engine.post_event(&scope, &event("start")).await.unwrap();
    engine
        .update_task_status(&machine.id, 1, 0, &ExecutionUpdate::completed(Some(event("payload"))))
        .await
        .unwrap();

    engine.post_replay_event(&scope, &event("payload")).await.unwrap();
    let error = engine
        .post_replay_event(&scope, &event("payload"))
        .await
        .unwrap_err();
    assert!(matches!(error, EngineError::ReplayRetriesExhausted(_, _)));
    assert_eq!(error.status_code(), 403);
}

#[tokio::test(flavor = "multi_thread")]
async fn replay_rejects_non_replayable_events_and_finished_machines() {
    let (engine, _backend, _dispatcher) = harness();
    let machine = engine.submit(&replay_machine()).await.unwrap();
    let scope = machine_scope(&machine.id);

    // "start" was never declared replayable.
    let error = engine
        .post_replay_event(&scope, &event("start"))
        .await
        .unwrap_err();
    assert!(matches!(error, EngineError::UpdateForbidden(_)));

    // A cancelled machine is final; replay cannot resurrect it.
    engine.cancel_workflow(&scope).await.unwrap();
    let error = engine
        .post_replay_event(&scope, &event("payload"))
        .await
        .unwrap_err();
    assert!(matches!(error, EngineError::UpdateForbidden(_)));
}
