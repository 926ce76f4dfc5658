//! # Order Pipeline Demo
//!
//! A four-stage order workflow driven end to end: the engine dispatches
//! tasks over a channel, and this process plays the executor on the other
//! side - acknowledging each task and reporting completion with the output
//! event payload. Everything runs against the in-memory backend.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use flywheel_core::{
    Engine, EngineConfig, EventData, EventDefinition, EventScope, ExecutionDispatcher,
    ExecutionUpdate, MachineStatus, StateDefinition, StateMachineDefinition,
    TaskExecutionMessage,
};
use flywheel_testing::InMemoryBackend;

// ============================================================================
// Dispatcher (engine -> "executor" channel)
// ============================================================================

struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<TaskExecutionMessage>,
}

#[async_trait]
impl ExecutionDispatcher for ChannelDispatcher {
    async fn forward_execution_message(
        &self,
        _endpoint: &str,
        message: &TaskExecutionMessage,
    ) -> Result<u16> {
        self.tx.send(message.clone())?;
        Ok(202)
    }
}

// ============================================================================
// Workflow definition
// ============================================================================

fn order_pipeline() -> StateMachineDefinition {
    let stage = |name: &str, dep: &str, output: Option<&str>| StateDefinition {
        name: name.to_string(),
        description: None,
        task: format!("order.{name}"),
        on_entry_hook: None,
        on_exit_hook: None,
        dependencies: vec![EventDefinition::new(dep, "json")],
        retry_count: 3,
        timeout_ms: 5_000,
        output_event: output.map(|o| EventDefinition::new(o, "json")),
        replayable_retries: 5,
    };

    StateMachineDefinition {
        name: "order-pipeline".to_string(),
        version: 1,
        description: Some("reserve -> bill -> pack -> ship".to_string()),
        correlation_id: Some("order-42".to_string()),
        callback_endpoint_id: "default".to_string(),
        states: vec![
            stage("reserve", "order_placed", Some("stock_reserved")),
            stage("bill", "stock_reserved", Some("payment_captured")),
            stage("pack", "payment_captured", Some("parcel_packed")),
            stage("ship", "parcel_packed", None),
        ],
        seed_events: Vec::new(),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let backend = InMemoryBackend::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let engine = Engine::builder(backend.stores(), Arc::new(ChannelDispatcher { tx }))
        .config(EngineConfig::default())
        .endpoint("default", "http://localhost:9997")
        .build();

    let machine = engine.submit(&order_pipeline()).await?;
    println!("Submitted order pipeline: {}", machine.id);

    // The outside world places the order.
    engine
        .post_event(
            &EventScope::CorrelationId("order-42".to_string()),
            &EventData::new(
                "order_placed",
                "json",
                Some(serde_json::json!({ "sku": "book-0042", "qty": 1 })),
            ),
        )
        .await?;

    // Play executor: each dispatched task "runs" and reports completion,
    // which triggers the next stage until the machine finishes.
    while let Some(task) = rx.recv().await {
        println!("Executing {} (state {})", task.task, task.state_id);
        let output = task.output_event.as_ref().map(|event| {
            EventData::new(
                event.name.clone(),
                event.event_type.clone(),
                Some(serde_json::json!({ "completed_by": task.task })),
            )
        });
        engine
            .update_task_status(
                &task.state_machine_id,
                task.state_id,
                task.execution_version,
                &ExecutionUpdate::completed(output),
            )
            .await?;

        if engine.state_machine(&machine.id).await?.status == MachineStatus::Completed {
            break;
        }
    }

    println!("\nAudit trail:");
    for record in engine.audit_trail(&machine.id).await? {
        println!(
            "  state {} -> {:?}{}",
            record.state_id,
            record.status,
            record
                .error_message
                .as_deref()
                .map(|m| format!(" ({m})"))
                .unwrap_or_default()
        );
    }

    println!("\nOrder pipeline completed!");
    Ok(())
}
