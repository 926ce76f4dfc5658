//! Test doubles and fixtures for the Flywheel engine.
//!
//! [`InMemoryBackend`] implements every store trait over plain hash maps, so
//! engine behavior can be exercised without a database. [`RecordingDispatcher`]
//! captures every execution message instead of making network calls. The
//! fixture functions build the workflow shapes the scenario tests revolve
//! around: a linear chain, a join, and a cancellation diamond.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use flywheel_core::{
    AuditRecord, AuditStore, Event, EventData, EventDefinition, EventStatus, ExecutionDispatcher,
    ExecutionVersion, MachineStatus, ScheduledEvent, ScheduledEventStore, ScheduledMessage,
    ScheduledMessageStore, State, StateDefinition, StateId, StateMachine, StateMachineDefinition,
    StateMachineStore, StateStatus, StateStore, Stores, TaskExecutionMessage,
};

/// Whole persistence layer in memory. One instance backs all six store
/// handles; clone the [`Stores`] bundle from [`InMemoryBackend::stores`].
#[derive(Default)]
pub struct InMemoryBackend {
    machines: Mutex<HashMap<String, StateMachine>>,
    events: Mutex<HashMap<(String, String), Event>>,
    audit: Mutex<Vec<AuditRecord>>,
    state_transitions: Mutex<HashMap<(String, StateId), DateTime<Utc>>>,
    scheduled_messages: Mutex<Vec<ScheduledMessage>>,
    scheduled_events: Mutex<Vec<ScheduledEvent>>,
}

impl InMemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stores(self: &Arc<Self>) -> Stores {
        Stores {
            machines: Arc::clone(self) as Arc<dyn StateMachineStore>,
            states: Arc::clone(self) as Arc<dyn StateStore>,
            events: Arc::clone(self) as Arc<dyn flywheel_core::EventStore>,
            audit: Arc::clone(self) as Arc<dyn AuditStore>,
            scheduled_messages: Arc::clone(self) as Arc<dyn ScheduledMessageStore>,
            scheduled_events: Arc::clone(self) as Arc<dyn ScheduledEventStore>,
        }
    }

    pub fn machine(&self, sm_id: &str) -> Option<StateMachine> {
        self.machines.lock().unwrap().get(sm_id).cloned()
    }

    pub fn event(&self, sm_id: &str, name: &str) -> Option<Event> {
        self.events
            .lock()
            .unwrap()
            .get(&(sm_id.to_string(), name.to_string()))
            .cloned()
    }

    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.audit.lock().unwrap().clone()
    }

    pub fn scheduled_message_count(&self) -> usize {
        self.scheduled_messages.lock().unwrap().len()
    }

    pub fn scheduled_event_count(&self) -> usize {
        self.scheduled_events.lock().unwrap().len()
    }

    fn with_state<T>(
        &self,
        sm_id: &str,
        state_id: StateId,
        f: impl FnOnce(&mut State) -> T,
    ) -> Result<T> {
        let mut machines = self.machines.lock().unwrap();
        let machine = match machines.get_mut(sm_id) {
            Some(machine) => machine,
            None => bail!("machine {sm_id} not found"),
        };
        match machine.states.iter_mut().find(|s| s.id == state_id) {
            Some(state) => Ok(f(state)),
            None => bail!("state {state_id} not found in {sm_id}"),
        }
    }
}

#[async_trait]
impl StateMachineStore for InMemoryBackend {
    async fn create(&self, machine: &StateMachine) -> Result<()> {
        let mut machines = self.machines.lock().unwrap();
        if machines.contains_key(&machine.id) {
            bail!("machine {} already exists", machine.id);
        }
        machines.insert(machine.id.clone(), machine.clone());
        Ok(())
    }

    async fn find_by_id(&self, sm_id: &str) -> Result<Option<StateMachine>> {
        Ok(self.machines.lock().unwrap().get(sm_id).cloned())
    }

    async fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Option<StateMachine>> {
        Ok(self
            .machines
            .lock()
            .unwrap()
            .values()
            .find(|m| m.correlation_id.as_deref() == Some(correlation_id))
            .cloned())
    }

    async fn update_status(&self, sm_id: &str, status: MachineStatus) -> Result<()> {
        let mut machines = self.machines.lock().unwrap();
        match machines.get_mut(sm_id) {
            Some(machine) => {
                machine.status = status;
                Ok(())
            }
            None => bail!("machine {sm_id} not found"),
        }
    }
}

#[async_trait]
impl StateStore for InMemoryBackend {
    async fn find_by_id(&self, sm_id: &str, state_id: StateId) -> Result<Option<State>> {
        Ok(self
            .machines
            .lock()
            .unwrap()
            .get(sm_id)
            .and_then(|m| m.states.iter().find(|s| s.id == state_id).cloned()))
    }

    async fn update_status(
        &self,
        sm_id: &str,
        state_id: StateId,
        expected: &[StateStatus],
        to: StateStatus,
    ) -> Result<bool> {
        let written = self.with_state(sm_id, state_id, |state| {
            if expected.contains(&state.status) {
                state.status = to;
                true
            } else {
                false
            }
        })?;
        if written {
            self.state_transitions
                .lock()
                .unwrap()
                .insert((sm_id.to_string(), state_id), Utc::now());
        }
        Ok(written)
    }

    async fn increment_attempted_retries(&self, sm_id: &str, state_id: StateId) -> Result<u32> {
        self.with_state(sm_id, state_id, |state| {
            state.attempted_retries += 1;
            state.attempted_retries
        })
    }

    async fn reset_attempted_retries(&self, sm_id: &str, state_id: StateId) -> Result<()> {
        self.with_state(sm_id, state_id, |state| state.attempted_retries = 0)
    }

    async fn update_execution_version(
        &self,
        sm_id: &str,
        state_id: StateId,
        execution_version: ExecutionVersion,
    ) -> Result<()> {
        self.with_state(sm_id, state_id, |state| {
            state.execution_version = execution_version;
        })
    }

    async fn increment_attempted_replayable_retries(
        &self,
        sm_id: &str,
        state_id: StateId,
    ) -> Result<u32> {
        self.with_state(sm_id, state_id, |state| {
            state.attempted_replayable_retries += 1;
            state.attempted_replayable_retries
        })
    }

    async fn find_errored_states(
        &self,
        machine_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<State>> {
        let transitions = self.state_transitions.lock().unwrap();
        Ok(self
            .machines
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.name == machine_name)
            .flat_map(|m| m.states.iter())
            .filter(|s| {
                matches!(s.status, StateStatus::Errored | StateStatus::Sidelined)
                    && transitions
                        .get(&(s.state_machine_id.clone(), s.id))
                        .is_some_and(|at| *at >= from && *at <= to)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl flywheel_core::EventStore for InMemoryBackend {
    async fn create(&self, event: &Event) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .insert((event.state_machine_id.clone(), event.name.clone()), event.clone());
        Ok(())
    }

    async fn find_by_name(&self, sm_id: &str, name: &str) -> Result<Option<Event>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .get(&(sm_id.to_string(), name.to_string()))
            .cloned())
    }

    async fn find_by_names(&self, sm_id: &str, names: &[String]) -> Result<Vec<Event>> {
        let events = self.events.lock().unwrap();
        Ok(names
            .iter()
            .filter_map(|n| events.get(&(sm_id.to_string(), n.clone())).cloned())
            .collect())
    }

    async fn triggered_or_cancelled_names(&self, sm_id: &str) -> Result<Vec<String>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .values()
            .filter(|e| {
                e.state_machine_id == sm_id
                    && matches!(e.status, EventStatus::Triggered | EventStatus::Cancelled)
            })
            .map(|e| e.name.clone())
            .collect())
    }

    async fn statuses_by_name(&self, sm_id: &str) -> Result<HashMap<String, EventStatus>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.state_machine_id == sm_id)
            .map(|e| (e.name.clone(), e.status))
            .collect())
    }

    async fn mark_triggered(
        &self,
        sm_id: &str,
        name: &str,
        data: Option<&Value>,
        source: Option<&str>,
    ) -> Result<()> {
        let mut events = self.events.lock().unwrap();
        match events.get_mut(&(sm_id.to_string(), name.to_string())) {
            Some(event) => {
                event.status = EventStatus::Triggered;
                event.data = data.cloned();
                event.source = source.map(|s| s.to_string());
                Ok(())
            }
            None => bail!("event {name} not found in {sm_id}"),
        }
    }

    async fn mark_cancelled(&self, sm_id: &str, name: &str) -> Result<()> {
        let mut events = self.events.lock().unwrap();
        match events.get_mut(&(sm_id.to_string(), name.to_string())) {
            Some(event) => {
                event.status = EventStatus::Cancelled;
                Ok(())
            }
            None => bail!("event {name} not found in {sm_id}"),
        }
    }

    async fn mark_pending(&self, sm_id: &str, name: &str) -> Result<()> {
        let mut events = self.events.lock().unwrap();
        match events.get_mut(&(sm_id.to_string(), name.to_string())) {
            Some(event) => {
                event.status = EventStatus::Pending;
                event.data = None;
                event.source = None;
                event.execution_version += 1;
                Ok(())
            }
            None => bail!("event {name} not found in {sm_id}"),
        }
    }

    async fn update_data(
        &self,
        sm_id: &str,
        name: &str,
        data: Option<&Value>,
        source: Option<&str>,
    ) -> Result<()> {
        let mut events = self.events.lock().unwrap();
        match events.get_mut(&(sm_id.to_string(), name.to_string())) {
            Some(event) => {
                event.data = data.cloned();
                event.source = source.map(|s| s.to_string());
                Ok(())
            }
            None => bail!("event {name} not found in {sm_id}"),
        }
    }
}

#[async_trait]
impl AuditStore for InMemoryBackend {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        self.audit.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn records_for_machine(&self, sm_id: &str) -> Result<Vec<AuditRecord>> {
        Ok(self
            .audit
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.state_machine_id == sm_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ScheduledMessageStore for InMemoryBackend {
    async fn save(&self, message: &ScheduledMessage) -> Result<()> {
        let mut rows = self.scheduled_messages.lock().unwrap();
        rows.retain(|m| {
            !(m.state_machine_id == message.state_machine_id && m.task_id == message.task_id)
        });
        rows.push(message.clone());
        rows.sort_by_key(|m| m.scheduled_time);
        Ok(())
    }

    async fn retrieve_oldest(&self, offset: i64, count: i64) -> Result<Vec<ScheduledMessage>> {
        Ok(self
            .scheduled_messages
            .lock()
            .unwrap()
            .iter()
            .skip(offset as usize)
            .take(count as usize)
            .cloned()
            .collect())
    }

    async fn delete_in_batch(&self, pairs: &[(String, StateId)]) -> Result<()> {
        self.scheduled_messages.lock().unwrap().retain(|m| {
            !pairs
                .iter()
                .any(|(sm, task)| *sm == m.state_machine_id && *task == m.task_id)
        });
        Ok(())
    }
}

#[async_trait]
impl ScheduledEventStore for InMemoryBackend {
    async fn save(&self, event: &ScheduledEvent) -> Result<()> {
        let mut rows = self.scheduled_events.lock().unwrap();
        rows.push(event.clone());
        rows.sort_by_key(|e| e.scheduled_time_secs);
        Ok(())
    }

    async fn retrieve_oldest(&self, count: i64) -> Result<Vec<ScheduledEvent>> {
        Ok(self
            .scheduled_events
            .lock()
            .unwrap()
            .iter()
            .take(count as usize)
            .cloned()
            .collect())
    }

    async fn delete(&self, correlation_id: &str, event_name: &str) -> Result<()> {
        self.scheduled_events
            .lock()
            .unwrap()
            .retain(|e| !(e.correlation_id == correlation_id && e.event_name == event_name));
        Ok(())
    }
}

/// Dispatcher that records instead of sending. Acknowledges with a settable
/// status (202 by default) or fails outright when told to.
pub struct RecordingDispatcher {
    sent: Mutex<Vec<(String, TaskExecutionMessage)>>,
    status: AtomicU16,
    fail: AtomicBool,
}

impl Default for RecordingDispatcher {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            status: AtomicU16::new(202),
            fail: AtomicBool::new(false),
        }
    }
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<(String, TaskExecutionMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Messages dispatched for one state, in order.
    pub fn sent_for_state(&self, state_id: StateId) -> Vec<TaskExecutionMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m)| m.state_id == state_id)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExecutionDispatcher for RecordingDispatcher {
    async fn forward_execution_message(
        &self,
        endpoint: &str,
        message: &TaskExecutionMessage,
    ) -> Result<u16> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("dispatcher offline");
        }
        self.sent
            .lock()
            .unwrap()
            .push((endpoint.to_string(), message.clone()));
        Ok(self.status.load(Ordering::SeqCst))
    }
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

/// Three states in a chain: `start -> e1 -> e2 -> e3`.
pub fn linear_machine() -> StateMachineDefinition {
    definition(
        "linear",
        vec![
            state_def(
                "first",
                vec![EventDefinition::new("start", "json")],
                Some(EventDefinition::new("e1", "json")),
            ),
            state_def(
                "second",
                vec![EventDefinition::new("e1", "json")],
                Some(EventDefinition::new("e2", "json")),
            ),
            state_def("third", vec![EventDefinition::new("e2", "json")], None),
        ],
    )
}

/// Two branches feeding a join: the join waits for both branch outputs.
///
/// ```text
///   event1 -> left  -> left_done  --\
///                                    >-> merge
///   event2 -> right -> right_done --/
/// ```
pub fn join_machine() -> StateMachineDefinition {
    definition(
        "join",
        vec![
            state_def(
                "left",
                vec![EventDefinition::new("event1", "json")],
                Some(EventDefinition::new("left_done", "json")),
            ),
            state_def(
                "right",
                vec![EventDefinition::new("event2", "json")],
                Some(EventDefinition::new("right_done", "json")),
            ),
            state_def(
                "merge",
                vec![
                    EventDefinition::new("left_done", "json"),
                    EventDefinition::new("right_done", "json"),
                ],
                None,
            ),
            state_def(
                "gated",
                vec![
                    EventDefinition::new("event1", "json"),
                    EventDefinition::new("event2", "json"),
                ],
                None,
            ),
        ],
    )
}

/// The seven-state cancellation topology: two branches out of a fan-out
/// rejoin twice, so a cancel on the lower branch must stop at the join fed
/// by the surviving upper branch.
///
/// ```text
/// state1 ──(event1)──► state2 ──(event2)──────────────────► state3
///    │                                                        ▲
///    │              ┌─(event3)─► state5 ──(event4)─┐       (event6)
///    │              │                              │          │
///    └──(event1)─► state4                          ├─► state7─┘
///                   │                              │
///                   └─(event3)─► state6 ──(event5)─┘
/// ```
pub fn cancel_path_machine() -> StateMachineDefinition {
    definition(
        "cancel-path",
        vec![
            state_def(
                "state1",
                vec![EventDefinition::new("start", "json")],
                Some(EventDefinition::new("event1", "json")),
            ),
            state_def(
                "state2",
                vec![EventDefinition::new("event1", "json")],
                Some(EventDefinition::new("event2", "json")),
            ),
            state_def(
                "state3",
                vec![
                    EventDefinition::new("event2", "json"),
                    EventDefinition::new("event6", "json"),
                ],
                None,
            ),
            state_def(
                "state4",
                vec![EventDefinition::new("event1", "json")],
                Some(EventDefinition::new("event3", "json")),
            ),
            state_def(
                "state5",
                vec![EventDefinition::new("event3", "json")],
                Some(EventDefinition::new("event4", "json")),
            ),
            state_def(
                "state6",
                vec![EventDefinition::new("event3", "json")],
                Some(EventDefinition::new("event5", "json")),
            ),
            state_def(
                "state7",
                vec![
                    EventDefinition::new("event4", "json"),
                    EventDefinition::new("event5", "json"),
                ],
                Some(EventDefinition::new("event6", "json")),
            ),
        ],
    )
}

/// An event payload with a small JSON body.
pub fn event(name: &str) -> EventData {
    EventData::new(name, "json", Some(serde_json::json!({ "fixture": name })))
}
