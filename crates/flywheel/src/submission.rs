//! Workflow submission: validate a definition, then persist the whole graph
//! or nothing.
//!
//! Validation happens before any write, so a rejected definition leaves no
//! partial machine behind. Seed events are returned to the caller for
//! posting through the normal event path rather than being special-cased
//! here.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use smallvec::SmallVec;
use tracing::info;
use uuid::Uuid;

use crate::api::StateMachineDefinition;
use crate::domain::{
    AuditRecord, Event, EventStatus, MachineStatus, State, StateMachine, StateStatus,
};
use crate::error::{EngineError, Result};
use crate::store::Stores;

pub struct SubmissionService {
    stores: Stores,
    max_retry_count: u32,
    max_replayable_retries: u32,
}

impl SubmissionService {
    pub fn new(stores: Stores, max_retry_count: u32, max_replayable_retries: u32) -> Self {
        Self {
            stores,
            max_retry_count,
            max_replayable_retries,
        }
    }

    /// Validate and persist a submission. Returns the created machine; the
    /// caller posts the definition's seed events afterwards.
    pub async fn submit(&self, definition: &StateMachineDefinition) -> Result<StateMachine> {
        validate_definition(definition)?;

        if let Some(correlation_id) = &definition.correlation_id {
            if self
                .stores
                .machines
                .find_by_correlation_id(correlation_id)
                .await?
                .is_some()
            {
                return Err(EngineError::DuplicateMachine(correlation_id.clone()));
            }
        }

        let sm_id = Uuid::new_v4().to_string();
        let states: Vec<State> = definition
            .states
            .iter()
            .enumerate()
            .map(|(index, def)| State {
                state_machine_id: sm_id.clone(),
                id: (index + 1) as i64,
                version: definition.version,
                name: def.name.clone(),
                description: def.description.clone(),
                task: def.task.clone(),
                on_entry_hook: def.on_entry_hook.clone(),
                on_exit_hook: def.on_exit_hook.clone(),
                dependencies: def
                    .dependencies
                    .iter()
                    .map(|d| d.name.clone())
                    .collect::<SmallVec<_>>(),
                retry_count: def.retry_count.min(self.max_retry_count),
                timeout_ms: def.timeout_ms,
                output_event: def.output_event.clone(),
                status: StateStatus::Initialized,
                execution_version: 0,
                attempted_retries: 0,
                replayable_retries: def.replayable_retries.min(self.max_replayable_retries),
                attempted_replayable_retries: 0,
            })
            .collect();

        let machine = StateMachine {
            id: sm_id.clone(),
            version: definition.version,
            name: definition.name.clone(),
            description: definition.description.clone(),
            status: MachineStatus::Initialized,
            correlation_id: definition.correlation_id.clone(),
            callback_endpoint_id: definition.callback_endpoint_id.clone(),
            states,
            created_at: Utc::now(),
        };
        self.stores.machines.create(&machine).await?;

        for declaration in declared_events(definition).values() {
            self.stores
                .events
                .create(&Event {
                    state_machine_id: sm_id.clone(),
                    name: declaration.name.clone(),
                    event_type: declaration.event_type.clone(),
                    status: EventStatus::Pending,
                    data: None,
                    source: None,
                    execution_version: 0,
                    replayable: declaration.replayable,
                })
                .await?;
        }

        for state in &machine.states {
            self.stores
                .audit
                .append(&AuditRecord::new(
                    sm_id.clone(),
                    state.id,
                    0,
                    StateStatus::Initialized,
                    None,
                ))
                .await?;
        }

        info!(
            sm_id = %machine.id,
            name = %machine.name,
            states = machine.states.len(),
            "state machine created"
        );
        Ok(machine)
    }
}

/// All event declarations in a definition, keyed by name. A name declared
/// in several places keeps the strongest declaration (replayable wins).
fn declared_events(
    definition: &StateMachineDefinition,
) -> HashMap<String, crate::domain::EventDefinition> {
    let mut events: HashMap<String, crate::domain::EventDefinition> = HashMap::new();
    let declarations = definition
        .states
        .iter()
        .flat_map(|s| s.dependencies.iter().chain(s.output_event.iter()));
    for declaration in declarations {
        events
            .entry(declaration.name.clone())
            .and_modify(|existing| existing.replayable |= declaration.replayable)
            .or_insert_with(|| declaration.clone());
    }
    events
}

/// Structural validation, all before any persistence.
pub fn validate_definition(definition: &StateMachineDefinition) -> Result<()> {
    if definition.name.trim().is_empty() {
        return Err(EngineError::InvalidDefinition(
            "machine name must not be empty".to_string(),
        ));
    }
    if definition.states.is_empty() {
        return Err(EngineError::InvalidDefinition(
            "a machine needs at least one state".to_string(),
        ));
    }

    let mut state_names = HashSet::new();
    for state in &definition.states {
        if !state_names.insert(state.name.as_str()) {
            return Err(EngineError::InvalidDefinition(format!(
                "duplicate state name '{}'",
                state.name
            )));
        }
    }

    let mut event_types: HashMap<&str, &str> = HashMap::new();
    let declarations = definition
        .states
        .iter()
        .flat_map(|s| s.dependencies.iter().chain(s.output_event.iter()));
    for declaration in declarations {
        if let Some(existing) = event_types.insert(&declaration.name, &declaration.event_type) {
            if existing != declaration.event_type {
                return Err(EngineError::InvalidDefinition(format!(
                    "event '{}' declared with conflicting types '{}' and '{}'",
                    declaration.name, existing, declaration.event_type
                )));
            }
        }
    }

    let mut producers: HashMap<&str, &str> = HashMap::new();
    for state in &definition.states {
        if let Some(output) = &state.output_event {
            if let Some(other) = producers.insert(&output.name, &state.name) {
                return Err(EngineError::InvalidDefinition(format!(
                    "event '{}' produced by both '{}' and '{}'",
                    output.name, other, state.name
                )));
            }
        }
    }

    check_replayable_constraints(definition)?;
    check_acyclic(definition)
}

/// At most one replayable dependency per state, and no replayable event
/// shared between states: a replay must map to exactly one task to re-run.
fn check_replayable_constraints(definition: &StateMachineDefinition) -> Result<()> {
    let mut consumers: HashMap<&str, &str> = HashMap::new();
    for state in &definition.states {
        let replayable: Vec<&str> = state
            .dependencies
            .iter()
            .filter(|d| d.replayable)
            .map(|d| d.name.as_str())
            .collect();
        if replayable.len() > 1 {
            return Err(EngineError::InvalidDefinition(format!(
                "state '{}' has {} replayable dependencies, at most one allowed",
                state.name,
                replayable.len()
            )));
        }
        for name in replayable {
            if let Some(other) = consumers.insert(name, &state.name) {
                return Err(EngineError::InvalidDefinition(format!(
                    "replayable event '{name}' consumed by both '{other}' and '{}'",
                    state.name
                )));
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm over the state graph (state -> its output's consumers).
/// Any vertex left unprocessed sits on a cycle.
fn check_acyclic(definition: &StateMachineDefinition) -> Result<()> {
    let producer_of: HashMap<&str, usize> = definition
        .states
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.output_event.as_ref().map(|e| (e.name.as_str(), i)))
        .collect();

    let n = definition.states.len();
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];
    for (i, state) in definition.states.iter().enumerate() {
        for dependency in &state.dependencies {
            if let Some(&producer) = producer_of.get(dependency.name.as_str()) {
                adjacency[producer].push(i);
                indegree[i] += 1;
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut processed = 0;
    while let Some(i) = queue.pop_front() {
        processed += 1;
        for &next in &adjacency[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                queue.push_back(next);
            }
        }
    }
    if processed != n {
        return Err(EngineError::InvalidDefinition(
            "dependency graph contains a cycle".to_string(),
        ));
    }
    Ok(())
}
