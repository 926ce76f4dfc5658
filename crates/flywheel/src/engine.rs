//! Engine assembly: wires the controller, redrive layers, removal queue and
//! delayed-event scheduler into one handle with a small public surface.
//!
//! Construction order matters: the removal queue must exist before the
//! redrive registry (which feeds it), and the controller before the sweep
//! and scheduler (which deliver into it). `build` spawns the background
//! loops, so it must run inside a tokio runtime.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{
    EventData, EventScope, ExecutionUpdate, FsmGraph, FsmGraphEvent, FsmGraphState,
    StateMachineDefinition,
};
use crate::backoff::{BackoffPolicy, SteppedExponentialBackoff};
use crate::config::EngineConfig;
use crate::controller::ExecutionController;
use crate::dispatch::{EndpointRegistry, ExecutionDispatcher, RouterRegistry};
use crate::domain::{AuditRecord, ExecutionVersion, State, StateId, StateMachine};
use crate::error::{EngineError, Result};
use crate::eventscheduler::{DelayedEventSink, EventSchedulerService};
use crate::redrive::{RedriverRegistry, RedriverService};
use crate::removal::MessageRemovalService;
use crate::store::Stores;
use crate::submission::SubmissionService;

pub struct EngineBuilder {
    stores: Stores,
    dispatcher: Arc<dyn ExecutionDispatcher>,
    config: EngineConfig,
    routers: Arc<RouterRegistry>,
    endpoints: Arc<EndpointRegistry>,
    backoff: Option<Arc<dyn BackoffPolicy>>,
}

impl EngineBuilder {
    pub fn new(stores: Stores, dispatcher: Arc<dyn ExecutionDispatcher>) -> Self {
        Self {
            stores,
            dispatcher,
            config: EngineConfig::default(),
            routers: Arc::new(RouterRegistry::new()),
            endpoints: Arc::new(EndpointRegistry::new()),
            backoff: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn router(self, task: impl Into<String>, router_name: impl Into<String>) -> Self {
        self.routers.register(task, router_name);
        self
    }

    pub fn endpoint(self, endpoint_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        self.endpoints.register(endpoint_id, base_url);
        self
    }

    pub fn backoff(mut self, policy: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = Some(policy);
        self
    }

    pub fn build(self) -> Engine {
        let config = self.config;
        let backoff = self
            .backoff
            .unwrap_or_else(|| Arc::new(SteppedExponentialBackoff::new(config.backoff_step_ms)));

        let removal = Arc::new(MessageRemovalService::new(
            Arc::clone(&self.stores.scheduled_messages),
            config.removal_batch_size,
            config.removal_max_wait,
        ));
        removal.start();

        let (redrive_tx, mut redrive_rx) = mpsc::unbounded_channel();
        let redriver = Arc::new(RedriverRegistry::new(
            Arc::clone(&self.stores.scheduled_messages),
            Arc::clone(&removal),
            redrive_tx.clone(),
        ));

        let controller = Arc::new(ExecutionController::new(
            self.stores.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.routers),
            Arc::clone(&self.endpoints),
            backoff,
            Arc::clone(&redriver),
        ));

        let mut sweep = RedriverService::new(
            Arc::clone(&self.stores.scheduled_messages),
            redrive_tx,
            config.redriver_poll_interval,
            config.redriver_batch_size,
        );
        sweep.set_initial_delay(config.redriver_initial_delay);
        sweep.start();

        let scheduler = Arc::new(EventSchedulerService::new(
            Arc::clone(&self.stores.scheduled_events),
            Arc::clone(&controller) as Arc<dyn DelayedEventSink>,
            config.scheduler_poll_interval,
            config.scheduler_batch_size,
        ));
        scheduler.start();

        let loop_controller = Arc::clone(&controller);
        let redrive_loop = tokio::spawn(async move {
            while let Some(request) = redrive_rx.recv().await {
                if let Err(error) = loop_controller
                    .redrive_task(
                        &request.state_machine_id,
                        request.state_id,
                        request.execution_version,
                    )
                    .await
                {
                    warn!(
                        sm_id = %request.state_machine_id,
                        state_id = request.state_id,
                        %error,
                        "redrive delivery failed"
                    );
                }
            }
        });

        info!("engine started");
        Engine {
            submission: SubmissionService::new(
                self.stores.clone(),
                config.max_retry_count,
                config.max_replayable_retries,
            ),
            stores: self.stores,
            controller,
            scheduler,
            sweep,
            removal,
            routers: self.routers,
            endpoints: self.endpoints,
            redrive_loop: Some(redrive_loop),
        }
    }
}

pub struct Engine {
    stores: Stores,
    submission: SubmissionService,
    controller: Arc<ExecutionController>,
    scheduler: Arc<EventSchedulerService>,
    sweep: RedriverService,
    removal: Arc<MessageRemovalService>,
    routers: Arc<RouterRegistry>,
    endpoints: Arc<EndpointRegistry>,
    redrive_loop: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn builder(stores: Stores, dispatcher: Arc<dyn ExecutionDispatcher>) -> EngineBuilder {
        EngineBuilder::new(stores, dispatcher)
    }

    /// Submit a workflow. States without dependencies and states gated only
    /// on seed events dispatch before this returns; seeds go through the
    /// normal event path.
    pub async fn submit(&self, definition: &StateMachineDefinition) -> Result<StateMachine> {
        let machine = self.submission.submit(definition).await?;
        self.controller.start_machine(&machine.id).await?;
        for seed in &definition.seed_events {
            self.controller
                .post_event(&EventScope::MachineId(machine.id.clone()), seed)
                .await?;
        }
        Ok(self
            .stores
            .machines
            .find_by_id(&machine.id)
            .await?
            .unwrap_or(machine))
    }

    pub async fn post_event(&self, scope: &EventScope, event: &EventData) -> Result<()> {
        self.controller.post_event(scope, event).await
    }

    /// Accept an event now, fire it at `trigger_time` (epoch seconds, or
    /// milliseconds normalized by magnitude). Delayed events must be scoped
    /// by correlation id: the target machine may not even exist yet, and a
    /// machine id would pin the event to one instance.
    pub async fn post_delayed_event(
        &self,
        scope: &EventScope,
        event: &EventData,
        trigger_time: i64,
    ) -> Result<()> {
        let EventScope::CorrelationId(correlation_id) = scope else {
            return Err(EngineError::Malformed(
                "delayed events require a correlation id scope".to_string(),
            ));
        };
        self.scheduler
            .schedule(correlation_id, event, trigger_time)
            .await?;
        Ok(())
    }

    pub async fn update_task_status(
        &self,
        sm_id: &str,
        state_id: StateId,
        execution_version: ExecutionVersion,
        update: &ExecutionUpdate,
    ) -> Result<()> {
        self.controller
            .update_task_status(sm_id, state_id, execution_version, update)
            .await
    }

    pub async fn unsideline(&self, sm_id: &str, state_id: StateId) -> Result<()> {
        self.controller.unsideline(sm_id, state_id).await
    }

    pub async fn update_event_data(&self, scope: &EventScope, event: &EventData) -> Result<()> {
        self.controller.update_event_data(scope, event).await
    }

    /// Replay a replayable event: the dependent state and its downstream
    /// subgraph restart at a bumped execution version with the new payload.
    pub async fn post_replay_event(&self, scope: &EventScope, event: &EventData) -> Result<()> {
        self.controller.post_replay_event(scope, event).await
    }

    /// Cancel an event by name, cascading through the dependency graph.
    pub async fn cancel_event(&self, scope: &EventScope, event_name: &str) -> Result<()> {
        self.controller
            .post_event(scope, &EventData::cancellation(event_name))
            .await
    }

    /// Cancel a whole workflow: every unfinished state and pending event is
    /// cancelled and the machine finishes `Cancelled`.
    pub async fn cancel_workflow(&self, scope: &EventScope) -> Result<()> {
        self.controller.cancel_workflow(scope).await
    }

    /// Graph snapshot for visualization.
    pub async fn fsm_graph(&self, sm_id: &str) -> Result<FsmGraph> {
        let machine = self
            .stores
            .machines
            .find_by_id(sm_id)
            .await?
            .ok_or_else(|| EngineError::MachineNotFound(sm_id.to_string()))?;
        let statuses = self.stores.events.statuses_by_name(sm_id).await?;
        Ok(FsmGraph {
            state_machine_id: machine.id.clone(),
            name: machine.name.clone(),
            version: machine.version,
            status: machine.status,
            states: machine
                .states
                .iter()
                .map(|s| FsmGraphState {
                    id: s.id,
                    name: s.name.clone(),
                    status: s.status,
                    execution_version: s.execution_version,
                    dependencies: s.dependencies.iter().cloned().collect(),
                    output_event: s.output_event.as_ref().map(|e| e.name.clone()),
                })
                .collect(),
            events: statuses
                .into_iter()
                .map(|(name, status)| FsmGraphEvent { name, status })
                .collect(),
        })
    }

    pub async fn state_machine(&self, sm_id: &str) -> Result<StateMachine> {
        self.stores
            .machines
            .find_by_id(sm_id)
            .await?
            .ok_or_else(|| EngineError::MachineNotFound(sm_id.to_string()))
    }

    pub async fn audit_trail(&self, sm_id: &str) -> Result<Vec<AuditRecord>> {
        Ok(self.stores.audit.records_for_machine(sm_id).await?)
    }

    /// Errored or sidelined states of machines with the given name within a
    /// time range, for operator dashboards.
    pub async fn errored_states(
        &self,
        machine_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<State>> {
        Ok(self
            .stores
            .states
            .find_errored_states(machine_name, from, to)
            .await?)
    }

    pub fn routers(&self) -> &RouterRegistry {
        &self.routers
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    /// Stop all background loops. In-flight deliveries finish; queued
    /// removals not yet flushed are reconstructed from the persisted
    /// deadlines on next startup.
    pub fn shutdown(&mut self) {
        self.scheduler.stop();
        self.sweep.stop();
        self.removal.stop();
        if let Some(handle) = self.redrive_loop.take() {
            handle.abort();
        }
        info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
