//! Domain model: state machines, states, events and the durable scheduler
//! records.
//!
//! These are pure data types plus validation helpers. All behavior lives in
//! the execution controller; nothing here performs IO. Graph structure is
//! kept single-directional (a state lists the event names it depends on and
//! at most one output event) so entities serialize without back-pointers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

/// Identifier of a state machine instance (UUID rendered as a string).
pub type StateMachineId = String;

/// Identifier of a state within its machine. Unique per machine, assigned
/// sequentially at submission.
pub type StateId = i64;

/// Generation counter distinguishing a state or event's current run from
/// stale prior attempts. Incremented on replay; stale deliveries carrying an
/// old version are ignored.
pub type ExecutionVersion = i64;

/// Lifecycle of a state machine. Transitions only move forward; a completed
/// or cancelled machine is never resurrected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Initialized,
    Running,
    Completed,
    Cancelled,
}

/// Lifecycle of a single state (unit of work).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateStatus {
    Initialized,
    Running,
    Completed,
    Errored,
    /// Terminal failure after retries are exhausted. Requires an explicit
    /// unsideline action to resume.
    Sidelined,
    Cancelled,
}

/// Lifecycle of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Triggered,
    Cancelled,
}

/// Declaration of an event: its name (unique within the machine) and an
/// opaque type tag the executor uses to interpret the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDefinition {
    pub name: String,
    pub event_type: String,
    /// A replayable event may be re-posted to re-run its dependent state at
    /// a bumped execution version. At most one per state, and no two states
    /// may share one (prevents ambiguous replay fan-out).
    #[serde(default)]
    pub replayable: bool,
}

impl EventDefinition {
    pub fn new(name: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event_type: event_type.into(),
            replayable: false,
        }
    }

    pub fn replayable(name: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event_type: event_type.into(),
            replayable: true,
        }
    }
}

/// A workflow instance: the unit of submission and cancellation.
///
/// Identity and `version` are immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachine {
    pub id: StateMachineId,
    pub version: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: MachineStatus,
    /// Caller-supplied alternate key for locating this instance.
    pub correlation_id: Option<String>,
    /// Id of the callback endpoint tasks are dispatched to. Resolved to a
    /// base URL through the endpoint registry at dispatch time.
    pub callback_endpoint_id: String,
    pub states: Vec<State>,
    pub created_at: DateTime<Utc>,
}

impl StateMachine {
    pub fn state(&self, state_id: StateId) -> Option<&State> {
        self.states.iter().find(|s| s.id == state_id)
    }

    /// States whose dependency list contains the given event name.
    pub fn states_dependent_on<'a>(
        &'a self,
        event_name: &'a str,
    ) -> impl Iterator<Item = &'a State> {
        self.states
            .iter()
            .filter(move |s| s.dependencies.iter().any(|d| d == event_name))
    }

    /// The state producing the given event, if any. Output events are unique
    /// per machine (enforced at submission).
    pub fn producer_of(&self, event_name: &str) -> Option<&State> {
        self.states
            .iter()
            .find(|s| s.output_event.as_ref().is_some_and(|e| e.name == event_name))
    }
}

/// A unit of work in the workflow graph, gated by event dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub state_machine_id: StateMachineId,
    pub id: StateId,
    pub version: i64,
    pub name: String,
    pub description: Option<String>,
    /// Opaque executable identifier. The router registry maps this to the
    /// executor-side router; the engine never interprets it.
    pub task: String,
    pub on_entry_hook: Option<String>,
    pub on_exit_hook: Option<String>,
    /// Names of the events this state waits on, in declaration order. Every
    /// name references an event declared in the same machine.
    pub dependencies: SmallVec<[String; 4]>,
    /// Maximum retries for this state. Clamped to the system-wide maximum at
    /// submission.
    pub retry_count: u32,
    pub timeout_ms: u64,
    /// Event marked triggered when this state completes, propagating the
    /// execution wave.
    pub output_event: Option<EventDefinition>,
    pub status: StateStatus,
    pub execution_version: ExecutionVersion,
    pub attempted_retries: u32,
    /// Budget for replays of this state's replayable dependency. Clamped to
    /// the system-wide maximum at submission.
    pub replayable_retries: u32,
    pub attempted_replayable_retries: u32,
}

impl State {
    /// Whether `post_event` may dispatch this state. Running, completed and
    /// cancelled states are never re-dispatched; sidelined states require an
    /// explicit unsideline.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self.status, StateStatus::Initialized | StateStatus::Errored)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, StateStatus::Completed | StateStatus::Cancelled)
    }
}

/// A named signal within one machine. Exactly one event exists per name per
/// execution version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub state_machine_id: StateMachineId,
    pub name: String,
    pub event_type: String,
    pub status: EventStatus,
    pub data: Option<Value>,
    pub source: Option<String>,
    pub execution_version: ExecutionVersion,
    pub replayable: bool,
}

/// Append-only log entry written on every state status transition. Used for
/// observability and test assertions, never for control decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub state_machine_id: StateMachineId,
    pub state_id: StateId,
    pub execution_version: ExecutionVersion,
    pub status: StateStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        state_machine_id: impl Into<StateMachineId>,
        state_id: StateId,
        execution_version: ExecutionVersion,
        status: StateStatus,
        error_message: Option<String>,
    ) -> Self {
        Self {
            state_machine_id: state_machine_id.into(),
            state_id,
            execution_version,
            status,
            error_message,
            created_at: Utc::now(),
        }
    }
}

/// Durable record of a pending redrive deadline. Written when a dispatch
/// arms the redrive timer, removed (via deferred batch deletion) when the
/// task legitimately completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub task_id: StateId,
    pub state_machine_id: StateMachineId,
    /// Absolute deadline after which the task is considered unacknowledged.
    pub scheduled_time: DateTime<Utc>,
    pub execution_version: ExecutionVersion,
}

/// Durable record of an externally-posted event to be fired at a future
/// wall-clock time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub correlation_id: String,
    pub event_name: String,
    /// Trigger time as epoch seconds. Millisecond inputs are normalized at
    /// the API boundary.
    pub scheduled_time_secs: i64,
    /// The serialized `EventData` to re-submit through the normal post-event
    /// path once the time passes.
    pub event_json: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn state_with_status(status: StateStatus) -> State {
        State {
            state_machine_id: "sm-1".to_string(),
            id: 1,
            version: 1,
            name: "s1".to_string(),
            description: None,
            task: "task1".to_string(),
            on_entry_hook: None,
            on_exit_hook: None,
            dependencies: smallvec!["e1".to_string()],
            retry_count: 3,
            timeout_ms: 1000,
            output_event: None,
            status,
            execution_version: 0,
            attempted_retries: 0,
            replayable_retries: 5,
            attempted_replayable_retries: 0,
        }
    }

    #[test]
    fn dispatchable_statuses() {
        assert!(state_with_status(StateStatus::Initialized).is_dispatchable());
        assert!(state_with_status(StateStatus::Errored).is_dispatchable());
        assert!(!state_with_status(StateStatus::Running).is_dispatchable());
        assert!(!state_with_status(StateStatus::Completed).is_dispatchable());
        assert!(!state_with_status(StateStatus::Sidelined).is_dispatchable());
        assert!(!state_with_status(StateStatus::Cancelled).is_dispatchable());
    }

    #[test]
    fn machine_lookups() {
        let mut s1 = state_with_status(StateStatus::Initialized);
        s1.output_event = Some(EventDefinition::new("e2", "json"));
        let mut s2 = state_with_status(StateStatus::Initialized);
        s2.id = 2;
        s2.dependencies = smallvec!["e2".to_string()];
        let machine = StateMachine {
            id: "sm-1".to_string(),
            version: 1,
            name: "m".to_string(),
            description: None,
            status: MachineStatus::Running,
            correlation_id: None,
            callback_endpoint_id: "default".to_string(),
            states: vec![s1, s2],
            created_at: Utc::now(),
        };

        assert_eq!(machine.producer_of("e2").map(|s| s.id), Some(1));
        let dependents: Vec<StateId> =
            machine.states_dependent_on("e2").map(|s| s.id).collect();
        assert_eq!(dependents, vec![2]);
    }
}
