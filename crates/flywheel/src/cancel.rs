//! Cancellation path resolver.
//!
//! Given a cancel signal on one event, walks the dependency graph to find
//! the minimal set of downstream effects without breaking valid join
//! semantics: a chain whose inputs all resolve to cancelled is cancelled
//! transitively, but a join with at least one triggered input survives and
//! becomes part of the returned executable frontier.
//!
//! The walk is pure — it reads a snapshot of event statuses and returns the
//! outcome. The execution controller persists cancelled events and states
//! and feeds the frontier back into dispatch.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::domain::{EventStatus, StateId, StateMachine, StateStatus};

/// Result of resolving one cancel signal.
#[derive(Debug, Default, PartialEq)]
pub struct CancelOutcome {
    /// States to persist as cancelled, in discovery order.
    pub cancelled_states: Vec<StateId>,
    /// Events to persist as cancelled, in discovery order. Includes the
    /// origin event.
    pub cancelled_events: Vec<String>,
    /// Join states spared from cancellation because one input path
    /// succeeded. Eligible to run as soon as dispatch re-evaluates them;
    /// left untouched in storage.
    pub frontier: Vec<StateId>,
}

/// Walk the graph from `origin_event`, cascading cancellation and stopping
/// at genuine joins.
pub fn resolve_cancel_path(
    machine: &StateMachine,
    event_statuses: &HashMap<String, EventStatus>,
    origin_event: &str,
) -> CancelOutcome {
    let mut resolved = event_statuses.clone();
    resolved.insert(origin_event.to_string(), EventStatus::Cancelled);

    let mut outcome = CancelOutcome {
        cancelled_events: vec![origin_event.to_string()],
        ..CancelOutcome::default()
    };
    let mut cancelled_states: HashSet<StateId> = HashSet::new();
    let mut frontier_seen: HashSet<StateId> = HashSet::new();

    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(origin_event.to_string());

    while let Some(event_name) = queue.pop_front() {
        for state in machine.states_dependent_on(&event_name) {
            if cancelled_states.contains(&state.id) || state.status == StateStatus::Completed {
                continue;
            }

            let status_of = |name: &String| {
                resolved.get(name).copied().unwrap_or(EventStatus::Pending)
            };

            // One triggered input means this is a genuine join where some
            // path succeeded: recursion stops here and the state joins the
            // executable frontier.
            if state
                .dependencies
                .iter()
                .any(|d| status_of(d) == EventStatus::Triggered)
            {
                if frontier_seen.insert(state.id) {
                    outcome.frontier.push(state.id);
                }
                continue;
            }

            // Cancel only once every dependency has resolved to cancelled.
            // A still-pending sibling defers the decision: it may cancel
            // later (we revisit through its own cancellation) or trigger
            // later (normal dispatch handles it then).
            if state
                .dependencies
                .iter()
                .all(|d| status_of(d) == EventStatus::Cancelled)
            {
                cancelled_states.insert(state.id);
                outcome.cancelled_states.push(state.id);
                if let Some(output) = &state.output_event {
                    resolved.insert(output.name.clone(), EventStatus::Cancelled);
                    outcome.cancelled_events.push(output.name.clone());
                    queue.push_back(output.name.clone());
                }
            }
        }
    }

    outcome
}
