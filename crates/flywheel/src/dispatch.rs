//! Executor dispatch: the boundary between orchestration and the worker
//! pool that actually runs task code.
//!
//! Dispatch is fire-and-forget with an asynchronous completion callback —
//! the executor acknowledges with an HTTP-style status class and later
//! reports the outcome through `update_task_status`. The engine never runs
//! user business logic in-process.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::api::EventData;
use crate::domain::{EventDefinition, ExecutionVersion, StateId};

/// Everything the executor needs to run one task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionMessage {
    pub router_name: String,
    pub state_machine_id: String,
    pub state_machine_name: String,
    pub state_id: StateId,
    pub state_name: String,
    pub task: String,
    /// Payloads of the dependency events, in dependency order.
    pub events: Vec<EventData>,
    pub output_event: Option<EventDefinition>,
    pub retry_count: u32,
    pub execution_version: ExecutionVersion,
}

/// Forwards an execution message to a remote executor endpoint.
///
/// The returned status class decides what happens next: 2xx means the
/// executor accepted the task, 4xx means it rejected it outright, 5xx is a
/// transient transport failure. Rejections and transient failures are both
/// left to the redrive subsystem; they differ only in how they are logged.
#[async_trait]
pub trait ExecutionDispatcher: Send + Sync {
    async fn forward_execution_message(
        &self,
        endpoint: &str,
        message: &TaskExecutionMessage,
    ) -> anyhow::Result<u16>;
}

/// Typed lookup table from task identifier to executor-side router name.
/// Constructed at startup and passed by handle — no ambient static state.
#[derive(Default)]
pub struct RouterRegistry {
    routers: DashMap<String, String>,
}

impl RouterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task: impl Into<String>, router_name: impl Into<String>) {
        self.routers.insert(task.into(), router_name.into());
    }

    /// Router for a task. Unregistered tasks route by their own identifier,
    /// so a deployment with one router per task needs no registrations.
    pub fn resolve(&self, task: &str) -> String {
        self.routers
            .get(task)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| task.to_string())
    }
}

/// Callback endpoints keyed by the id each state machine was submitted
/// with. Used for cross-node forwarding when execution happens on a node
/// separate from orchestration.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: DashMap<String, String>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint_id: impl Into<String>, base_url: impl Into<String>) {
        self.endpoints.insert(endpoint_id.into(), base_url.into());
    }

    pub fn resolve(&self, endpoint_id: &str) -> Option<String> {
        self.endpoints.get(endpoint_id).map(|e| e.value().clone())
    }

    /// Full execution URL for a resolved base.
    pub fn execution_url(base: &str) -> String {
        format!("{}/api/execution", base.trim_end_matches('/'))
    }
}
