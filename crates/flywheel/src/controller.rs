//! Execution controller: the single writer of orchestration state.
//!
//! Every inbound signal converges here — posted events, executor status
//! callbacks, redrive deliveries, unsideline requests, cancellations. The
//! controller reads the persisted graph, decides which states become
//! runnable, and dispatches them. It holds no graph state of its own, so
//! any node that can reach the stores can process any signal.
//!
//! Duplicate and stale deliveries are absorbed, not rejected: a state that
//! is not dispatchable is skipped, and an update carrying an old execution
//! version is a no-op. This is what makes the redundant redrive layers and
//! at-least-once delivery safe.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::api::{EventData, EventScope, ExecutionUpdate, TaskUpdateStatus};
use crate::backoff::BackoffPolicy;
use crate::cancel::resolve_cancel_path;
use crate::dispatch::{
    EndpointRegistry, ExecutionDispatcher, RouterRegistry, TaskExecutionMessage,
};
use crate::domain::{
    AuditRecord, EventStatus, ExecutionVersion, MachineStatus, State, StateId, StateMachine,
    StateStatus,
};
use crate::error::{EngineError, Result};
use crate::eventscheduler::DelayedEventSink;
use crate::redrive::RedriverRegistry;
use crate::store::Stores;

pub struct ExecutionController {
    stores: Stores,
    dispatcher: Arc<dyn ExecutionDispatcher>,
    routers: Arc<RouterRegistry>,
    endpoints: Arc<EndpointRegistry>,
    backoff: Arc<dyn BackoffPolicy>,
    redriver: Arc<RedriverRegistry>,
}

// Expected-status sets for the stores' compare-and-set writes. A write whose
// guard fails lost a race to a concurrent transition and is dropped.
const DISPATCHABLE: &[StateStatus] = &[StateStatus::Initialized, StateStatus::Errored];
const ACTIVE: &[StateStatus] = &[
    StateStatus::Initialized,
    StateStatus::Running,
    StateStatus::Errored,
];
const UNFINISHED: &[StateStatus] = &[
    StateStatus::Initialized,
    StateStatus::Running,
    StateStatus::Errored,
    StateStatus::Sidelined,
];
const ANY_STATUS: &[StateStatus] = &[
    StateStatus::Initialized,
    StateStatus::Running,
    StateStatus::Completed,
    StateStatus::Errored,
    StateStatus::Sidelined,
    StateStatus::Cancelled,
];

/// Whether a state's dependencies permit dispatch.
///
/// Triggered dependencies satisfy directly. A cancelled dependency counts as
/// satisfied only when at least one sibling is triggered: the state is then a
/// join whose surviving path succeeded and it runs on partial input. A state
/// whose dependencies all cancelled never runs (the cancellation cascade owns
/// it instead).
pub(crate) fn dependencies_satisfied(
    state: &State,
    statuses: &HashMap<String, EventStatus>,
) -> bool {
    if state.dependencies.is_empty() {
        return true;
    }
    let status_of = |name: &String| statuses.get(name).copied().unwrap_or(EventStatus::Pending);
    let any_triggered = state
        .dependencies
        .iter()
        .any(|d| status_of(d) == EventStatus::Triggered);
    state.dependencies.iter().all(|d| match status_of(d) {
        EventStatus::Triggered => true,
        EventStatus::Cancelled => any_triggered,
        EventStatus::Pending => false,
    })
}

impl ExecutionController {
    pub fn new(
        stores: Stores,
        dispatcher: Arc<dyn ExecutionDispatcher>,
        routers: Arc<RouterRegistry>,
        endpoints: Arc<EndpointRegistry>,
        backoff: Arc<dyn BackoffPolicy>,
        redriver: Arc<RedriverRegistry>,
    ) -> Self {
        Self {
            stores,
            dispatcher,
            routers,
            endpoints,
            backoff,
            redriver,
        }
    }

    async fn resolve_machine(&self, scope: &EventScope) -> Result<StateMachine> {
        let machine = match scope {
            EventScope::MachineId(id) => self.stores.machines.find_by_id(id).await?,
            EventScope::CorrelationId(cid) => {
                self.stores.machines.find_by_correlation_id(cid).await?
            }
        };
        machine.ok_or_else(|| {
            let key = match scope {
                EventScope::MachineId(id) => id.clone(),
                EventScope::CorrelationId(cid) => cid.clone(),
            };
            EngineError::MachineNotFound(key)
        })
    }

    /// Post an event into a machine. Cancel signals route through the
    /// cancellation path; ordinary events are marked triggered and every
    /// dependent state whose gates are now open is dispatched.
    ///
    /// Posting an already-triggered event refreshes its payload and
    /// re-evaluates dependents; states past `Initialized`/`Errored` are not
    /// dispatchable, so duplicate delivery cannot double-run a task.
    pub async fn post_event(&self, scope: &EventScope, event: &EventData) -> Result<()> {
        let machine = self.resolve_machine(scope).await?;
        if matches!(
            machine.status,
            MachineStatus::Completed | MachineStatus::Cancelled
        ) {
            debug!(sm_id = %machine.id, event = %event.name, "event on finished machine ignored");
            return Ok(());
        }
        if event.cancelled {
            return self.cancel_event(&machine, &event.name).await;
        }

        let stored = self
            .stores
            .events
            .find_by_name(&machine.id, &event.name)
            .await?
            .ok_or_else(|| EngineError::EventNotFound(machine.id.clone(), event.name.clone()))?;
        if stored.status == EventStatus::Cancelled {
            debug!(sm_id = %machine.id, event = %event.name, "event already cancelled, ignoring");
            return Ok(());
        }
        self.stores
            .events
            .mark_triggered(
                &machine.id,
                &event.name,
                event.data.as_ref(),
                event.source.as_deref(),
            )
            .await?;
        info!(sm_id = %machine.id, event = %event.name, "event triggered");

        if machine.status == MachineStatus::Initialized {
            self.stores
                .machines
                .update_status(&machine.id, MachineStatus::Running)
                .await?;
        }
        self.dispatch_dependents(&machine, &event.name).await
    }

    /// Dispatch every dependent of `event_name` whose dependencies are now
    /// satisfied. Reloads each state so concurrent transitions are seen.
    async fn dispatch_dependents(&self, machine: &StateMachine, event_name: &str) -> Result<()> {
        // First pass over the satisfied set (triggered or cancelled); the
        // per-name status map then decides join-skip for the survivors.
        let satisfied: HashSet<String> = self
            .stores
            .events
            .triggered_or_cancelled_names(&machine.id)
            .await?
            .into_iter()
            .collect();
        let statuses = self.stores.events.statuses_by_name(&machine.id).await?;
        for state in machine.states_dependent_on(event_name) {
            if !state.dependencies.iter().all(|d| satisfied.contains(d)) {
                continue;
            }
            self.try_dispatch(machine, state.id, &statuses).await?;
        }
        Ok(())
    }

    /// Dispatch every state with an empty dependency list. Such states have
    /// no gating event, so they run as soon as the machine exists.
    pub async fn start_machine(&self, sm_id: &str) -> Result<()> {
        let machine = self
            .stores
            .machines
            .find_by_id(sm_id)
            .await?
            .ok_or_else(|| EngineError::MachineNotFound(sm_id.to_string()))?;
        let free: Vec<StateId> = machine
            .states
            .iter()
            .filter(|s| s.dependencies.is_empty())
            .map(|s| s.id)
            .collect();
        if free.is_empty() {
            return Ok(());
        }
        if machine.status == MachineStatus::Initialized {
            self.stores
                .machines
                .update_status(sm_id, MachineStatus::Running)
                .await?;
        }
        let statuses = self.stores.events.statuses_by_name(sm_id).await?;
        for state_id in free {
            self.try_dispatch(&machine, state_id, &statuses).await?;
        }
        Ok(())
    }

    /// Dispatch one state if it is currently dispatchable and gated open.
    async fn try_dispatch(
        &self,
        machine: &StateMachine,
        state_id: StateId,
        statuses: &HashMap<String, EventStatus>,
    ) -> Result<()> {
        let state = self
            .stores
            .states
            .find_by_id(&machine.id, state_id)
            .await?
            .ok_or_else(|| EngineError::StateNotFound(machine.id.clone(), state_id))?;
        if !state.is_dispatchable() || !dependencies_satisfied(&state, statuses) {
            return Ok(());
        }
        self.dispatch_state(machine, &state).await
    }

    /// Dispatch one state: claim it running, arm the redrive timer, forward
    /// the execution message. The timer is armed before the network call so
    /// a crash mid-dispatch still redrives. The claim is a compare-and-set,
    /// so a dispatch computed from a snapshot that a concurrent transition
    /// (e.g. a cancel) has overtaken is dropped here.
    async fn dispatch_state(&self, machine: &StateMachine, state: &State) -> Result<()> {
        let claimed = self
            .stores
            .states
            .update_status(&machine.id, state.id, DISPATCHABLE, StateStatus::Running)
            .await?;
        if !claimed {
            debug!(sm_id = %machine.id, state_id = state.id, "dispatch lost the status race, skipped");
            return Ok(());
        }
        self.stores
            .audit
            .append(&AuditRecord::new(
                machine.id.clone(),
                state.id,
                state.execution_version,
                StateStatus::Running,
                None,
            ))
            .await?;

        let delay = self.backoff.redrive_delay(state.retry_count, state.timeout_ms);
        self.redriver
            .register_task(&machine.id, state.id, delay, state.execution_version)
            .await?;

        let message = self.build_execution_message(machine, state).await?;
        let Some(base) = self.endpoints.resolve(&machine.callback_endpoint_id) else {
            // Redrive retries once the endpoint is registered.
            warn!(
                sm_id = %machine.id,
                state_id = state.id,
                endpoint_id = %machine.callback_endpoint_id,
                "no endpoint registered, dispatch deferred to redrive"
            );
            return Ok(());
        };
        let url = EndpointRegistry::execution_url(&base);
        match self
            .dispatcher
            .forward_execution_message(&url, &message)
            .await
        {
            Ok(status) if (200..300).contains(&status) => {
                debug!(sm_id = %machine.id, state_id = state.id, status, "task dispatched");
            }
            Ok(status) if (400..500).contains(&status) => {
                // Outright rejection: audited as errored, left to redrive.
                warn!(sm_id = %machine.id, state_id = state.id, status, "executor rejected task");
                self.stores
                    .audit
                    .append(&AuditRecord::new(
                        machine.id.clone(),
                        state.id,
                        state.execution_version,
                        StateStatus::Errored,
                        Some(format!("executor rejected dispatch with status {status}")),
                    ))
                    .await?;
            }
            Ok(status) => {
                warn!(sm_id = %machine.id, state_id = state.id, status, "dispatch failed, will redrive");
            }
            Err(error) => {
                warn!(sm_id = %machine.id, state_id = state.id, %error, "dispatch transport error, will redrive");
            }
        }
        Ok(())
    }

    async fn build_execution_message(
        &self,
        machine: &StateMachine,
        state: &State,
    ) -> Result<TaskExecutionMessage> {
        let names: Vec<String> = state.dependencies.iter().cloned().collect();
        let stored = self.stores.events.find_by_names(&machine.id, &names).await?;
        // Payloads in dependency declaration order.
        let events = names
            .iter()
            .filter_map(|name| stored.iter().find(|e| &e.name == name))
            .map(|e| EventData {
                name: e.name.clone(),
                event_type: e.event_type.clone(),
                data: e.data.clone(),
                source: e.source.clone(),
                cancelled: e.status == EventStatus::Cancelled,
            })
            .collect();
        Ok(TaskExecutionMessage {
            router_name: self.routers.resolve(&state.task),
            state_machine_id: machine.id.clone(),
            state_machine_name: machine.name.clone(),
            state_id: state.id,
            state_name: state.name.clone(),
            task: state.task.clone(),
            events,
            output_event: state.output_event.clone(),
            retry_count: state.retry_count,
            execution_version: state.execution_version,
        })
    }

    /// Executor status callback for one task attempt. Stale execution
    /// versions are ignored.
    pub async fn update_task_status(
        &self,
        sm_id: &str,
        state_id: StateId,
        execution_version: ExecutionVersion,
        update: &ExecutionUpdate,
    ) -> Result<()> {
        let machine = self
            .stores
            .machines
            .find_by_id(sm_id)
            .await?
            .ok_or_else(|| EngineError::MachineNotFound(sm_id.to_string()))?;
        let state = machine
            .state(state_id)
            .ok_or_else(|| EngineError::StateNotFound(sm_id.to_string(), state_id))?
            .clone();
        if state.execution_version != execution_version {
            debug!(
                sm_id,
                state_id,
                reported = execution_version,
                current = state.execution_version,
                "stale execution version, update ignored"
            );
            return Ok(());
        }
        if state.is_terminal() {
            debug!(sm_id, state_id, "update on terminal state ignored");
            return Ok(());
        }

        if update.delete_from_redriver {
            self.redriver
                .de_register_task(sm_id, state_id, execution_version);
        }

        match update.status {
            TaskUpdateStatus::Running => {
                if self
                    .stores
                    .states
                    .update_status(sm_id, state_id, ACTIVE, StateStatus::Running)
                    .await?
                {
                    self.stores
                        .audit
                        .append(&AuditRecord::new(
                            sm_id,
                            state_id,
                            execution_version,
                            StateStatus::Running,
                            None,
                        ))
                        .await?;
                }
            }
            TaskUpdateStatus::Completed => {
                let finished = self
                    .stores
                    .states
                    .update_status(sm_id, state_id, UNFINISHED, StateStatus::Completed)
                    .await?;
                if !finished {
                    debug!(sm_id, state_id, "completion lost the status race, ignored");
                    return Ok(());
                }
                self.stores
                    .audit
                    .append(&AuditRecord::new(
                        sm_id,
                        state_id,
                        execution_version,
                        StateStatus::Completed,
                        None,
                    ))
                    .await?;
                info!(sm_id, state_id, "task completed");
                if let Some(output) = &state.output_event {
                    let payload = update.event_data.clone().unwrap_or_else(|| {
                        EventData::new(output.name.clone(), output.event_type.clone(), None)
                    });
                    // Propagate the wave: the output event behaves exactly
                    // like an externally posted event.
                    self.post_event(&EventScope::MachineId(sm_id.to_string()), &payload)
                        .await?;
                }
                self.check_machine_completion(sm_id).await?;
            }
            TaskUpdateStatus::Errored => {
                // A reported failure consumes retry budget just like an
                // unacknowledged attempt does.
                let attempts = self
                    .stores
                    .states
                    .increment_attempted_retries(sm_id, state_id)
                    .await?;
                if attempts > state.retry_count {
                    self.sideline(sm_id, &state, update.error_message.clone())
                        .await?;
                } else if self
                    .stores
                    .states
                    .update_status(sm_id, state_id, ACTIVE, StateStatus::Errored)
                    .await?
                {
                    self.stores
                        .audit
                        .append(&AuditRecord::new(
                            sm_id,
                            state_id,
                            execution_version,
                            StateStatus::Errored,
                            update.error_message.clone(),
                        ))
                        .await?;
                    // The redrive timer armed at dispatch stays armed and
                    // will retry this attempt.
                }
            }
        }
        Ok(())
    }

    /// Redrive delivery: the deadline armed at dispatch passed without the
    /// task legitimately finishing. Re-dispatches with the retry budget, or
    /// sidelines when the budget is spent.
    pub async fn redrive_task(
        &self,
        sm_id: &str,
        state_id: StateId,
        execution_version: ExecutionVersion,
    ) -> Result<()> {
        let machine = match self.stores.machines.find_by_id(sm_id).await? {
            Some(machine) => machine,
            None => return Ok(()),
        };
        let state = match machine.state(state_id) {
            Some(state) => state.clone(),
            None => return Ok(()),
        };
        let obsolete = state.execution_version != execution_version
            || state.is_terminal()
            || state.status == StateStatus::Sidelined
            || machine.status != MachineStatus::Running;
        if obsolete {
            // The persisted deadline no longer matters; clean it up so the
            // sweep stops finding it.
            self.redriver.de_register_task(sm_id, state_id, execution_version);
            return Ok(());
        }

        let attempts = self
            .stores
            .states
            .increment_attempted_retries(sm_id, state_id)
            .await?;
        if attempts > state.retry_count {
            self.sideline(sm_id, &state, Some("retry budget exhausted".to_string()))
                .await?;
            return Ok(());
        }

        info!(sm_id, state_id, attempt = attempts, "redriving task");
        self.stores
            .audit
            .append(&AuditRecord::new(
                sm_id,
                state_id,
                execution_version,
                StateStatus::Running,
                Some(format!("redrive attempt {attempts}")),
            ))
            .await?;
        // Re-forward only. The persisted deadline stays in place, so the
        // sweep keeps redriving until completion or sidelining; no new
        // in-memory timer is armed.
        let message = self.build_execution_message(&machine, &state).await?;
        if let Some(base) = self.endpoints.resolve(&machine.callback_endpoint_id) {
            let url = EndpointRegistry::execution_url(&base);
            if let Err(error) = self
                .dispatcher
                .forward_execution_message(&url, &message)
                .await
            {
                warn!(sm_id, state_id, %error, "redrive dispatch failed");
            }
        }
        Ok(())
    }

    async fn sideline(
        &self,
        sm_id: &str,
        state: &State,
        error_message: Option<String>,
    ) -> Result<()> {
        if self
            .stores
            .states
            .update_status(sm_id, state.id, ACTIVE, StateStatus::Sidelined)
            .await?
        {
            self.stores
                .audit
                .append(&AuditRecord::new(
                    sm_id,
                    state.id,
                    state.execution_version,
                    StateStatus::Sidelined,
                    error_message,
                ))
                .await?;
            warn!(sm_id, state_id = state.id, "task sidelined");
        }
        self.redriver
            .de_register_task(sm_id, state.id, state.execution_version);
        Ok(())
    }

    /// Operator action: resume a sidelined task with a fresh retry budget at
    /// the same execution version.
    pub async fn unsideline(&self, sm_id: &str, state_id: StateId) -> Result<()> {
        let machine = self
            .stores
            .machines
            .find_by_id(sm_id)
            .await?
            .ok_or_else(|| EngineError::MachineNotFound(sm_id.to_string()))?;
        let state = machine
            .state(state_id)
            .ok_or_else(|| EngineError::StateNotFound(sm_id.to_string(), state_id))?;
        if state.status != StateStatus::Sidelined && state.status != StateStatus::Errored {
            return Err(EngineError::UpdateForbidden(format!(
                "state {state_id} is not sidelined or errored"
            )));
        }
        let resumed = self
            .stores
            .states
            .update_status(
                sm_id,
                state_id,
                &[StateStatus::Sidelined, StateStatus::Errored],
                StateStatus::Initialized,
            )
            .await?;
        if !resumed {
            debug!(sm_id, state_id, "unsideline lost the status race, ignored");
            return Ok(());
        }
        self.stores
            .states
            .reset_attempted_retries(sm_id, state_id)
            .await?;
        self.stores
            .audit
            .append(&AuditRecord::new(
                sm_id,
                state_id,
                state.execution_version,
                StateStatus::Initialized,
                Some("unsidelined".to_string()),
            ))
            .await?;
        info!(sm_id, state_id, "task unsidelined");

        let statuses = self.stores.events.statuses_by_name(sm_id).await?;
        self.try_dispatch(&machine, state_id, &statuses).await
    }

    /// Replace an event's payload without changing its status, then resume
    /// the consumers that were stuck on the old payload. Forbidden while any
    /// dependent state could still consume the old payload mid-flight.
    pub async fn update_event_data(&self, scope: &EventScope, event: &EventData) -> Result<()> {
        if event.data.is_none() {
            return Err(EngineError::Malformed(format!(
                "event data update for '{}' carries no data",
                event.name
            )));
        }
        let machine = self.resolve_machine(scope).await?;
        self.stores
            .events
            .find_by_name(&machine.id, &event.name)
            .await?
            .ok_or_else(|| EngineError::EventNotFound(machine.id.clone(), event.name.clone()))?;
        for state in machine.states_dependent_on(&event.name) {
            let eligible = matches!(
                state.status,
                StateStatus::Errored | StateStatus::Sidelined | StateStatus::Cancelled
            );
            if !eligible {
                return Err(EngineError::UpdateForbidden(format!(
                    "dependent state {} is {:?}",
                    state.id, state.status
                )));
            }
        }
        self.stores
            .events
            .update_data(
                &machine.id,
                &event.name,
                event.data.as_ref(),
                event.source.as_deref(),
            )
            .await?;
        info!(sm_id = %machine.id, event = %event.name, "event data updated");

        // Stuck consumers get a fresh budget against the corrected payload.
        // Cancelled dependents stay cancelled.
        let stuck: Vec<StateId> = machine
            .states_dependent_on(&event.name)
            .filter(|s| matches!(s.status, StateStatus::Errored | StateStatus::Sidelined))
            .map(|s| s.id)
            .collect();
        for state_id in stuck {
            self.unsideline(&machine.id, state_id).await?;
        }
        Ok(())
    }

    /// Replay a replayable event: reset its consumer and everything
    /// downstream to a fresh execution version, re-trigger the event with
    /// the new payload, and re-dispatch. Consumes the consumer's replay
    /// budget; deliveries carrying the previous version become stale.
    pub async fn post_replay_event(&self, scope: &EventScope, event: &EventData) -> Result<()> {
        let machine = self.resolve_machine(scope).await?;
        if matches!(
            machine.status,
            MachineStatus::Completed | MachineStatus::Cancelled
        ) {
            return Err(EngineError::UpdateForbidden(format!(
                "machine {} is {:?}",
                machine.id, machine.status
            )));
        }
        let stored = self
            .stores
            .events
            .find_by_name(&machine.id, &event.name)
            .await?
            .ok_or_else(|| EngineError::EventNotFound(machine.id.clone(), event.name.clone()))?;
        if !stored.replayable {
            return Err(EngineError::UpdateForbidden(format!(
                "event '{}' is not replayable",
                event.name
            )));
        }
        // Validation guarantees a replayable event has exactly one consumer.
        let root = machine
            .states_dependent_on(&event.name)
            .next()
            .ok_or_else(|| {
                EngineError::UpdateForbidden(format!(
                    "event '{}' has no dependent state",
                    event.name
                ))
            })?;
        if root.attempted_replayable_retries >= root.replayable_retries {
            return Err(EngineError::ReplayRetriesExhausted(
                machine.id.clone(),
                root.id,
            ));
        }

        // Traversal path: the consumer plus everything reachable through
        // output events.
        let mut queue = VecDeque::from([root.id]);
        let mut path: Vec<StateId> = Vec::new();
        let mut downstream_events: Vec<String> = Vec::new();
        while let Some(state_id) = queue.pop_front() {
            if path.contains(&state_id) {
                continue;
            }
            path.push(state_id);
            let Some(state) = machine.state(state_id) else {
                continue;
            };
            if let Some(output) = &state.output_event {
                downstream_events.push(output.name.clone());
                for dependent in machine.states_dependent_on(&output.name) {
                    queue.push_back(dependent.id);
                }
            }
        }
        info!(
            sm_id = %machine.id,
            event = %event.name,
            states = path.len(),
            "replaying event"
        );

        for state_id in &path {
            let Some(state) = machine.state(*state_id) else {
                continue;
            };
            let next_version = state.execution_version + 1;
            self.redriver
                .de_register_task(&machine.id, *state_id, state.execution_version);
            self.stores
                .states
                .update_execution_version(&machine.id, *state_id, next_version)
                .await?;
            self.stores
                .states
                .reset_attempted_retries(&machine.id, *state_id)
                .await?;
            self.stores
                .states
                .update_status(&machine.id, *state_id, ANY_STATUS, StateStatus::Initialized)
                .await?;
            self.stores
                .audit
                .append(&AuditRecord::new(
                    machine.id.clone(),
                    *state_id,
                    next_version,
                    StateStatus::Initialized,
                    Some("replay reset".to_string()),
                ))
                .await?;
        }
        for name in &downstream_events {
            self.stores.events.mark_pending(&machine.id, name).await?;
        }
        self.stores
            .states
            .increment_attempted_replayable_retries(&machine.id, root.id)
            .await?;
        self.stores
            .events
            .mark_triggered(
                &machine.id,
                &event.name,
                event.data.as_ref(),
                event.source.as_deref(),
            )
            .await?;

        // Re-read: the path was just rewritten under the snapshot.
        let machine = self
            .stores
            .machines
            .find_by_id(&machine.id)
            .await?
            .ok_or_else(|| EngineError::MachineNotFound(machine.id.clone()))?;
        self.dispatch_dependents(&machine, &event.name).await
    }

    /// Cancel a whole workflow: every non-terminal state falls, every
    /// pending event is marked cancelled, the machine finishes cancelled.
    pub async fn cancel_workflow(&self, scope: &EventScope) -> Result<()> {
        let machine = self.resolve_machine(scope).await?;
        if matches!(
            machine.status,
            MachineStatus::Completed | MachineStatus::Cancelled
        ) {
            return Ok(());
        }
        let statuses = self.stores.events.statuses_by_name(&machine.id).await?;
        for (name, status) in &statuses {
            if *status == EventStatus::Pending {
                self.stores.events.mark_cancelled(&machine.id, name).await?;
            }
        }
        for state in &machine.states {
            if state.is_terminal() {
                continue;
            }
            let cancelled = self
                .stores
                .states
                .update_status(&machine.id, state.id, UNFINISHED, StateStatus::Cancelled)
                .await?;
            if cancelled {
                self.stores
                    .audit
                    .append(&AuditRecord::new(
                        machine.id.clone(),
                        state.id,
                        state.execution_version,
                        StateStatus::Cancelled,
                        None,
                    ))
                    .await?;
            }
            self.redriver
                .de_register_task(&machine.id, state.id, state.execution_version);
        }
        self.stores
            .machines
            .update_status(&machine.id, MachineStatus::Cancelled)
            .await?;
        info!(sm_id = %machine.id, "workflow cancelled");
        Ok(())
    }

    /// Apply a cancel signal: resolve the affected subgraph, persist the
    /// cancellations, then dispatch any join spared by a triggered sibling.
    async fn cancel_event(&self, machine: &StateMachine, event_name: &str) -> Result<()> {
        self.stores
            .events
            .find_by_name(&machine.id, event_name)
            .await?
            .ok_or_else(|| {
                EngineError::EventNotFound(machine.id.clone(), event_name.to_string())
            })?;
        let statuses = self.stores.events.statuses_by_name(&machine.id).await?;
        let outcome = resolve_cancel_path(machine, &statuses, event_name);
        info!(
            sm_id = %machine.id,
            event = event_name,
            states = outcome.cancelled_states.len(),
            events = outcome.cancelled_events.len(),
            frontier = outcome.frontier.len(),
            "cancel path resolved"
        );

        for name in &outcome.cancelled_events {
            self.stores.events.mark_cancelled(&machine.id, name).await?;
        }
        for state_id in &outcome.cancelled_states {
            let execution_version = machine
                .state(*state_id)
                .map(|s| s.execution_version)
                .unwrap_or(0);
            let cancelled = self
                .stores
                .states
                .update_status(&machine.id, *state_id, UNFINISHED, StateStatus::Cancelled)
                .await?;
            if cancelled {
                self.stores
                    .audit
                    .append(&AuditRecord::new(
                        machine.id.clone(),
                        *state_id,
                        execution_version,
                        StateStatus::Cancelled,
                        None,
                    ))
                    .await?;
            }
            self.redriver
                .de_register_task(&machine.id, *state_id, execution_version);
        }

        let statuses = self.stores.events.statuses_by_name(&machine.id).await?;
        for state_id in &outcome.frontier {
            self.try_dispatch(machine, *state_id, &statuses).await?;
        }
        self.check_machine_completion(&machine.id).await
    }

    /// Finish the machine once every state is terminal: cancelled if any
    /// state was cancelled, completed otherwise.
    async fn check_machine_completion(&self, sm_id: &str) -> Result<()> {
        let machine = match self.stores.machines.find_by_id(sm_id).await? {
            Some(machine) => machine,
            None => return Ok(()),
        };
        if machine.states.iter().all(|s| s.is_terminal()) {
            let status = if machine
                .states
                .iter()
                .any(|s| s.status == StateStatus::Cancelled)
            {
                MachineStatus::Cancelled
            } else {
                MachineStatus::Completed
            };
            if machine.status != status {
                self.stores.machines.update_status(sm_id, status).await?;
                info!(sm_id, ?status, "state machine finished");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DelayedEventSink for ExecutionController {
    async fn deliver(&self, correlation_id: &str, event: EventData) -> anyhow::Result<()> {
        self.post_event(
            &EventScope::CorrelationId(correlation_id.to_string()),
            &event,
        )
        .await?;
        Ok(())
    }
}
