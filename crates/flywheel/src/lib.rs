//! # Flywheel
//!
//! A durable, event-driven workflow orchestration engine: workflows are
//! graphs of event-gated states, execution is driven entirely by events,
//! and every guarantee survives a process restart.
//!
//! ## Core Concepts
//!
//! Flywheel separates **orchestration** from **execution**:
//! - [`StateMachine`] = the workflow graph (states gated by named events)
//! - [`EventData`] = the signals that open gates and carry payloads
//! - The executor = remote workers that run task code and call back
//!
//! The key principle: **the engine never runs business logic**. It decides
//! *which* task runs *when*, dispatches it over the wire, and absorbs every
//! duplicate, stale or lost delivery the distributed setting produces.
//!
//! ## Architecture
//!
//! ```text
//! submit() / post_event() / update_task_status()
//!     │
//!     ▼
//! ExecutionController ──────────────────────────────────┐
//!     │  reads graph, evaluates gates                   │
//!     ▼                                                 │
//! ExecutionDispatcher ──► remote executor               │
//!     │                        │                        │
//!     │ arm timer              │ callback               │
//!     ▼                        ▼                        │
//! RedriverRegistry        update_task_status ───────────┤
//!     │ (in-memory timers)     │                        │
//!     │                        ▼                        │
//!     │                 output event triggered ─────────┘
//!     ▼
//! ScheduledMessageStore ◄── RedriverService (persisted sweep)
//!     ▲
//!     └── MessageRemovalService (deferred batch deletion)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Events are the only fuel** - A state runs exactly when its gating
//!    events are satisfied, never on a schedule or a poll
//! 2. **At-least-once, absorbed** - Redrive may re-deliver; stale execution
//!    versions and non-dispatchable states make duplicates no-ops
//! 3. **Durability is dual-layer** - Every redrive deadline is both an
//!    in-memory timer and a persisted row swept after restarts
//! 4. **Cancellation respects joins** - A cancel cascade stops at any join
//!    with a triggered input; the join runs on its surviving path
//! 5. **Retry budgets are final** - An exhausted state is sidelined, never
//!    silently retried; only an explicit unsideline resumes it
//!
//! ## Example
//!
//! ```ignore
//! use flywheel_core::{
//!     Engine, EngineConfig, EventData, EventDefinition, EventScope,
//!     StateDefinition, StateMachineDefinition,
//! };
//!
//! let engine = Engine::builder(stores, dispatcher)
//!     .config(EngineConfig::default())
//!     .endpoint("default", "http://executor:9997")
//!     .build();
//!
//! let definition = StateMachineDefinition {
//!     name: "order-flow".into(),
//!     version: 1,
//!     description: None,
//!     correlation_id: Some("order-42".into()),
//!     callback_endpoint_id: "default".into(),
//!     states: vec![StateDefinition {
//!         name: "reserve".into(),
//!         description: None,
//!         task: "order.reserve".into(),
//!         on_entry_hook: None,
//!         on_exit_hook: None,
//!         dependencies: vec![EventDefinition::new("order_placed", "json")],
//!         retry_count: 3,
//!         timeout_ms: 5_000,
//!         output_event: Some(EventDefinition::new("stock_reserved", "json")),
//!         replayable_retries: 5,
//!     }],
//!     seed_events: vec![],
//! };
//! let machine = engine.submit(&definition).await?;
//!
//! // External systems drive the workflow by posting events.
//! engine
//!     .post_event(
//!         &EventScope::CorrelationId("order-42".into()),
//!         &EventData::new("order_placed", "json", Some(payload)),
//!     )
//!     .await?;
//! ```
//!
//! ## What This Is Not
//!
//! Flywheel is **not**:
//! - A task runner (executors own business logic and its sandboxing)
//! - A cron replacement (delayed events exist, schedules do not)
//! - An event store (events live per machine instance, not as a log)
//!
//! Flywheel **is**:
//! > A durable orchestration core where events gate states, dispatch is
//! > at-least-once, and every timer has a persisted twin.

// Core modules
mod api;
mod backoff;
mod cancel;
mod config;
mod controller;
mod dispatch;
mod domain;
mod engine;
mod error;
mod eventscheduler;
mod redrive;
mod removal;
mod store;
mod submission;

// Testing utilities are in the separate flywheel-testing crate; the
// end-to-end scenarios live in tests/ so they link against it.

// Re-export domain types
pub use crate::domain::{
    AuditRecord, Event, EventDefinition, EventStatus, ExecutionVersion, MachineStatus,
    ScheduledEvent, ScheduledMessage, State, StateId, StateMachine, StateMachineId, StateStatus,
};

// Re-export inbound/outbound data types
pub use crate::api::{
    EventData, EventScope, ExecutionUpdate, FsmGraph, FsmGraphEvent, FsmGraphState,
    StateDefinition, StateMachineDefinition, TaskUpdateStatus,
};

// Re-export error types
pub use crate::error::{EngineError, Result};

// Re-export store traits (implemented by persistence crates)
pub use crate::store::{
    AuditStore, EventStore, ScheduledEventStore, ScheduledMessageStore, StateMachineStore,
    StateStore, Stores,
};

// Re-export dispatch types (implemented by transport layers)
pub use crate::dispatch::{
    EndpointRegistry, ExecutionDispatcher, RouterRegistry, TaskExecutionMessage,
};

// Re-export redrive and scheduling types
pub use crate::backoff::{BackoffPolicy, SteppedExponentialBackoff};
pub use crate::eventscheduler::{normalize_trigger_time, DelayedEventSink, EventSchedulerService};
pub use crate::redrive::{RedriveRequest, RedriverRegistry, RedriverService};
pub use crate::removal::MessageRemovalService;

// Re-export cancellation path types
pub use crate::cancel::{resolve_cancel_path, CancelOutcome};

// Re-export controller and submission (for embedding without the engine)
pub use crate::controller::ExecutionController;
pub use crate::submission::{validate_definition, SubmissionService};

// Re-export engine types (primary entry point)
pub use crate::config::EngineConfig;
pub use crate::engine::{Engine, EngineBuilder};

// Re-export commonly used external types
pub use async_trait::async_trait;
