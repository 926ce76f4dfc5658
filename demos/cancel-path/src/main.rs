//! # Cancellation Path Demo
//!
//! Shows join-aware cancellation on a diamond-shaped workflow: one branch
//! completes, the other is cancelled at its source, and the cascade stops
//! at the join whose surviving input already triggered. The join then runs
//! on partial input - its message carries the cancelled sibling marked as
//! such.

use anyhow::Result;

use flywheel_core::{Engine, EngineConfig, EventScope, ExecutionUpdate};
use flywheel_testing::{cancel_path_machine, event, InMemoryBackend, RecordingDispatcher};

#[tokio::main]
async fn main() -> Result<()> {
    let backend = InMemoryBackend::new();
    let dispatcher = RecordingDispatcher::new();

    let engine = Engine::builder(backend.stores(), dispatcher.clone())
        .config(EngineConfig::default())
        .endpoint("default", "http://localhost:9997")
        .build();

    let machine = engine.submit(&cancel_path_machine()).await?;
    let scope = EventScope::MachineId(machine.id.clone());
    println!("Submitted cancel-path machine: {}", machine.id);

    // Drive the upper branch: state1 produces event1, state2 produces event2.
    engine.post_event(&scope, &event("start")).await?;
    engine
        .update_task_status(&machine.id, 1, 0, &ExecutionUpdate::completed(Some(event("event1"))))
        .await?;
    engine
        .update_task_status(&machine.id, 2, 0, &ExecutionUpdate::completed(Some(event("event2"))))
        .await?;
    println!("Upper branch complete: event1 and event2 triggered");

    // Cancel the lower branch at its source. States 5, 6 and 7 fall, but
    // state3 survives on its triggered input and dispatches immediately.
    engine.cancel_event(&scope, "event3").await?;
    println!("Cancelled event3\n");

    let graph = engine.fsm_graph(&machine.id).await?;
    println!("States after cancellation:");
    for state in &graph.states {
        println!("  {:<8} {:?}", state.name, state.status);
    }
    println!("\nEvents after cancellation:");
    for event in &graph.events {
        println!("  {:<8} {:?}", event.name, event.status);
    }

    let join_dispatch = dispatcher.sent_for_state(3);
    println!("\nJoin state3 dispatched {} time(s); inputs:", join_dispatch.len());
    for input in &join_dispatch[0].events {
        println!(
            "  {:<8} cancelled={}",
            input.name, input.cancelled
        );
    }

    Ok(())
}
