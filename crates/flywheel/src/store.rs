//! Persistence gateway: the abstract read/write contract the engine depends
//! on.
//!
//! Every method is transactional per call. Implementations route each call
//! to a shard resolved from the state-machine id; the engine never holds a
//! persistence transaction open across an executor network call.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::{
    AuditRecord, Event, EventStatus, ExecutionVersion, MachineStatus, ScheduledEvent,
    ScheduledMessage, State, StateId, StateMachine, StateStatus,
};

#[async_trait]
pub trait StateMachineStore: Send + Sync {
    async fn create(&self, machine: &StateMachine) -> Result<()>;
    async fn find_by_id(&self, sm_id: &str) -> Result<Option<StateMachine>>;
    async fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Option<StateMachine>>;
    async fn update_status(&self, sm_id: &str, status: MachineStatus) -> Result<()>;
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn find_by_id(&self, sm_id: &str, state_id: StateId) -> Result<Option<State>>;

    /// Compare-and-set on the persisted status: writes `to` only while the
    /// current status is one of `expected`, and reports whether it did. This
    /// is the optimistic guard that linearizes transitions for one
    /// `(state_id, execution_version)` — a caller acting on a stale snapshot
    /// gets `false` instead of clobbering a concurrent transition.
    async fn update_status(
        &self,
        sm_id: &str,
        state_id: StateId,
        expected: &[StateStatus],
        to: StateStatus,
    ) -> Result<bool>;

    async fn increment_attempted_retries(&self, sm_id: &str, state_id: StateId) -> Result<u32>;
    async fn reset_attempted_retries(&self, sm_id: &str, state_id: StateId) -> Result<()>;

    /// Set the state's execution version. Bumped on replay so stale
    /// deliveries for the previous generation are ignored.
    async fn update_execution_version(
        &self,
        sm_id: &str,
        state_id: StateId,
        execution_version: ExecutionVersion,
    ) -> Result<()>;

    async fn increment_attempted_replayable_retries(
        &self,
        sm_id: &str,
        state_id: StateId,
    ) -> Result<u32>;

    /// Errored or sidelined states of machines with the given name, whose
    /// last transition falls within the time range.
    async fn find_errored_states(
        &self,
        machine_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<State>>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn create(&self, event: &Event) -> Result<()>;
    async fn find_by_name(&self, sm_id: &str, name: &str) -> Result<Option<Event>>;
    async fn find_by_names(&self, sm_id: &str, names: &[String]) -> Result<Vec<Event>>;

    /// Names of every triggered or cancelled event in the machine — the
    /// satisfied set the dispatch computation works from.
    async fn triggered_or_cancelled_names(&self, sm_id: &str) -> Result<Vec<String>>;

    /// Status of every event in the machine, keyed by name.
    async fn statuses_by_name(&self, sm_id: &str) -> Result<HashMap<String, EventStatus>>;

    async fn mark_triggered(
        &self,
        sm_id: &str,
        name: &str,
        data: Option<&Value>,
        source: Option<&str>,
    ) -> Result<()>;

    async fn mark_cancelled(&self, sm_id: &str, name: &str) -> Result<()>;

    /// Reset a downstream event to `Pending` at the next execution version,
    /// clearing its payload. Used by replay.
    async fn mark_pending(&self, sm_id: &str, name: &str) -> Result<()>;

    async fn update_data(
        &self,
        sm_id: &str,
        name: &str,
        data: Option<&Value>,
        source: Option<&str>,
    ) -> Result<()>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append-only; records are never mutated or deleted.
    async fn append(&self, record: &AuditRecord) -> Result<()>;
    async fn records_for_machine(&self, sm_id: &str) -> Result<Vec<AuditRecord>>;
}

#[async_trait]
pub trait ScheduledMessageStore: Send + Sync {
    async fn save(&self, message: &ScheduledMessage) -> Result<()>;

    /// Page of redrive records ordered by deadline ascending.
    async fn retrieve_oldest(&self, offset: i64, count: i64) -> Result<Vec<ScheduledMessage>>;

    /// One batched delete for the given `(state_machine_id, task_id)` pairs.
    async fn delete_in_batch(&self, pairs: &[(String, StateId)]) -> Result<()>;
}

#[async_trait]
pub trait ScheduledEventStore: Send + Sync {
    async fn save(&self, event: &ScheduledEvent) -> Result<()>;

    /// Oldest pending rows ordered by scheduled time ascending.
    async fn retrieve_oldest(&self, count: i64) -> Result<Vec<ScheduledEvent>>;

    async fn delete(&self, correlation_id: &str, event_name: &str) -> Result<()>;
}

/// Bundle of store handles the engine is wired with.
#[derive(Clone)]
pub struct Stores {
    pub machines: Arc<dyn StateMachineStore>,
    pub states: Arc<dyn StateStore>,
    pub events: Arc<dyn EventStore>,
    pub audit: Arc<dyn AuditStore>,
    pub scheduled_messages: Arc<dyn ScheduledMessageStore>,
    pub scheduled_events: Arc<dyn ScheduledEventStore>,
}
