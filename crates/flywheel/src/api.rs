//! Inbound data-transfer types: what the (external) resource layer hands to
//! the engine, and what comes back out for graph queries.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{
    EventDefinition, EventStatus, ExecutionVersion, StateId, StateStatus,
};

/// How an inbound call addresses a state machine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventScope {
    MachineId(String),
    /// Caller-supplied alternate key. Required scoping for delayed events.
    CorrelationId(String),
}

/// A workflow submission: converted to the domain graph and persisted
/// atomically, or rejected without partial persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachineDefinition {
    pub name: String,
    pub version: i64,
    pub description: Option<String>,
    pub correlation_id: Option<String>,
    pub callback_endpoint_id: String,
    pub states: Vec<StateDefinition>,
    /// Payloads for events already known at submission. Such events are
    /// persisted as triggered, so states gated only on them run immediately.
    #[serde(default)]
    pub seed_events: Vec<EventData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,
    pub description: Option<String>,
    pub task: String,
    pub on_entry_hook: Option<String>,
    pub on_exit_hook: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<EventDefinition>,
    pub retry_count: u32,
    pub timeout_ms: u64,
    pub output_event: Option<EventDefinition>,
    /// Replay budget for this state's replayable dependency, if it has one.
    /// Clamped to the system-wide maximum at submission.
    #[serde(default = "default_replayable_retries")]
    pub replayable_retries: u32,
}

fn default_replayable_retries() -> u32 {
    5
}

/// Payload of a posted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub name: String,
    pub event_type: String,
    pub data: Option<Value>,
    pub source: Option<String>,
    /// Set on a cancel signal: routes the post through the cancellation
    /// path resolver instead of triggering the event.
    #[serde(default)]
    pub cancelled: bool,
}

impl EventData {
    pub fn new(name: impl Into<String>, event_type: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            name: name.into(),
            event_type: event_type.into(),
            data,
            source: None,
            cancelled: false,
        }
    }

    pub fn cancellation(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event_type: String::new(),
            data: None,
            source: None,
            cancelled: true,
        }
    }
}

/// Status reported by the executor for one task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskUpdateStatus {
    Running,
    Completed,
    Errored,
}

/// A task status transition reported by the executor.
///
/// `event_data`, when present on a completion, carries the payload for the
/// state's output event (the executor posts event and execution data
/// together).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    pub status: TaskUpdateStatus,
    pub current_retry_count: u32,
    pub error_message: Option<String>,
    /// Whether the now-obsolete redrive record should be scheduled for
    /// deferred deletion.
    pub delete_from_redriver: bool,
    pub event_data: Option<EventData>,
}

impl ExecutionUpdate {
    pub fn running() -> Self {
        Self {
            status: TaskUpdateStatus::Running,
            current_retry_count: 0,
            error_message: None,
            delete_from_redriver: false,
            event_data: None,
        }
    }

    pub fn completed(event_data: Option<EventData>) -> Self {
        Self {
            status: TaskUpdateStatus::Completed,
            current_retry_count: 0,
            error_message: None,
            delete_from_redriver: true,
            event_data,
        }
    }

    pub fn errored(message: impl Into<String>) -> Self {
        Self {
            status: TaskUpdateStatus::Errored,
            current_retry_count: 0,
            error_message: Some(message.into()),
            delete_from_redriver: false,
            event_data: None,
        }
    }
}

/// Snapshot of a machine's graph for the external visualization layer.
#[derive(Debug, Clone, Serialize)]
pub struct FsmGraph {
    pub state_machine_id: String,
    pub name: String,
    pub version: i64,
    pub status: crate::domain::MachineStatus,
    pub states: Vec<FsmGraphState>,
    pub events: Vec<FsmGraphEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FsmGraphState {
    pub id: StateId,
    pub name: String,
    pub status: StateStatus,
    pub execution_version: ExecutionVersion,
    pub dependencies: Vec<String>,
    pub output_event: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FsmGraphEvent {
    pub name: String,
    pub status: EventStatus,
}
