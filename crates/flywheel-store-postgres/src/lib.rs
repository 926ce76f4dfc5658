//! Sharded PostgreSQL persistence for the Flywheel orchestration engine.
//!
//! Orchestration data (machines, states, events, audit) is sharded across a
//! set of pools by a stable hash of the state-machine id, so one hot machine
//! never serializes the rest of the fleet. The scheduler tables (redrive
//! deadlines, delayed events) live on one dedicated pool: the sweep and the
//! delayed-event poller read them globally, ordered by time.
//!
//! # Database Schema
//!
//! Per orchestration shard:
//!
//! ```sql
//! CREATE TABLE state_machines (
//!     id TEXT PRIMARY KEY,
//!     version BIGINT NOT NULL,
//!     name TEXT NOT NULL,
//!     description TEXT,
//!     status TEXT NOT NULL DEFAULT 'initialized',
//!     correlation_id TEXT UNIQUE,
//!     callback_endpoint_id TEXT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE TABLE states (
//!     state_machine_id TEXT NOT NULL REFERENCES state_machines(id),
//!     id BIGINT NOT NULL,
//!     version BIGINT NOT NULL,
//!     name TEXT NOT NULL,
//!     description TEXT,
//!     task TEXT NOT NULL,
//!     on_entry_hook TEXT,
//!     on_exit_hook TEXT,
//!     dependencies JSONB NOT NULL DEFAULT '[]',
//!     retry_count INTEGER NOT NULL,
//!     timeout_ms BIGINT NOT NULL,
//!     output_event JSONB,
//!     status TEXT NOT NULL DEFAULT 'initialized',
//!     execution_version BIGINT NOT NULL DEFAULT 0,
//!     attempted_retries INTEGER NOT NULL DEFAULT 0,
//!     replayable_retries INTEGER NOT NULL DEFAULT 5,
//!     attempted_replayable_retries INTEGER NOT NULL DEFAULT 0,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     PRIMARY KEY (state_machine_id, id)
//! );
//!
//! CREATE TABLE events (
//!     state_machine_id TEXT NOT NULL,
//!     name TEXT NOT NULL,
//!     event_type TEXT NOT NULL,
//!     status TEXT NOT NULL DEFAULT 'pending',
//!     data JSONB,
//!     source TEXT,
//!     execution_version BIGINT NOT NULL DEFAULT 0,
//!     replayable BOOLEAN NOT NULL DEFAULT FALSE,
//!     PRIMARY KEY (state_machine_id, name)
//! );
//!
//! CREATE TABLE audit_records (
//!     id BIGSERIAL PRIMARY KEY,
//!     state_machine_id TEXT NOT NULL,
//!     state_id BIGINT NOT NULL,
//!     execution_version BIGINT NOT NULL,
//!     status TEXT NOT NULL,
//!     error_message TEXT,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```
//!
//! On the scheduler pool:
//!
//! ```sql
//! CREATE TABLE scheduled_messages (
//!     task_id BIGINT NOT NULL,
//!     state_machine_id TEXT NOT NULL,
//!     scheduled_time TIMESTAMPTZ NOT NULL,
//!     execution_version BIGINT NOT NULL DEFAULT 0,
//!     PRIMARY KEY (state_machine_id, task_id)
//! );
//! CREATE INDEX idx_scheduled_messages_time ON scheduled_messages (scheduled_time);
//!
//! CREATE TABLE scheduled_events (
//!     correlation_id TEXT NOT NULL,
//!     event_name TEXT NOT NULL,
//!     scheduled_time_secs BIGINT NOT NULL,
//!     event_json TEXT NOT NULL,
//!     PRIMARY KEY (correlation_id, event_name)
//! );
//! CREATE INDEX idx_scheduled_events_time ON scheduled_events (scheduled_time_secs);
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use flywheel_store_postgres::{PgOrchestrationStore, PgSchedulerStore};
//! use sqlx::PgPool;
//!
//! let shards = vec![PgPool::connect(shard0).await?, PgPool::connect(shard1).await?];
//! let orchestration = Arc::new(PgOrchestrationStore::new(shards));
//! let scheduler = Arc::new(PgSchedulerStore::new(PgPool::connect(sched).await?));
//! let engine = Engine::builder(stores(orchestration, scheduler), dispatcher).build();
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use smallvec::SmallVec;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use flywheel_core::{
    AuditRecord, AuditStore, Event, EventDefinition, EventStatus, EventStore, ExecutionVersion,
    MachineStatus, ScheduledEvent, ScheduledEventStore, ScheduledMessage, ScheduledMessageStore,
    State, StateId, StateMachine, StateMachineStore, StateStatus, StateStore, Stores,
};

/// Orchestration tables, sharded by state-machine id.
#[derive(Clone)]
pub struct PgOrchestrationStore {
    shards: Vec<PgPool>,
}

/// Scheduler tables on one dedicated pool.
#[derive(Clone)]
pub struct PgSchedulerStore {
    pool: PgPool,
}

/// Assemble the engine's store bundle from the two Postgres stores.
pub fn stores(
    orchestration: Arc<PgOrchestrationStore>,
    scheduler: Arc<PgSchedulerStore>,
) -> Stores {
    Stores {
        machines: Arc::clone(&orchestration) as Arc<dyn StateMachineStore>,
        states: Arc::clone(&orchestration) as Arc<dyn StateStore>,
        events: Arc::clone(&orchestration) as Arc<dyn EventStore>,
        audit: orchestration as Arc<dyn AuditStore>,
        scheduled_messages: Arc::clone(&scheduler) as Arc<dyn ScheduledMessageStore>,
        scheduled_events: scheduler as Arc<dyn ScheduledEventStore>,
    }
}

/// FNV-1a over the machine id. Must be stable across processes and releases:
/// every node has to route one machine to the same shard forever.
fn stable_hash(key: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn machine_status_str(status: MachineStatus) -> &'static str {
    match status {
        MachineStatus::Initialized => "initialized",
        MachineStatus::Running => "running",
        MachineStatus::Completed => "completed",
        MachineStatus::Cancelled => "cancelled",
    }
}

fn parse_machine_status(s: &str) -> Result<MachineStatus> {
    Ok(match s {
        "initialized" => MachineStatus::Initialized,
        "running" => MachineStatus::Running,
        "completed" => MachineStatus::Completed,
        "cancelled" => MachineStatus::Cancelled,
        other => bail!("unknown machine status '{other}'"),
    })
}

fn state_status_str(status: StateStatus) -> &'static str {
    match status {
        StateStatus::Initialized => "initialized",
        StateStatus::Running => "running",
        StateStatus::Completed => "completed",
        StateStatus::Errored => "errored",
        StateStatus::Sidelined => "sidelined",
        StateStatus::Cancelled => "cancelled",
    }
}

fn parse_state_status(s: &str) -> Result<StateStatus> {
    Ok(match s {
        "initialized" => StateStatus::Initialized,
        "running" => StateStatus::Running,
        "completed" => StateStatus::Completed,
        "errored" => StateStatus::Errored,
        "sidelined" => StateStatus::Sidelined,
        "cancelled" => StateStatus::Cancelled,
        other => bail!("unknown state status '{other}'"),
    })
}

fn event_status_str(status: EventStatus) -> &'static str {
    match status {
        EventStatus::Pending => "pending",
        EventStatus::Triggered => "triggered",
        EventStatus::Cancelled => "cancelled",
    }
}

fn parse_event_status(s: &str) -> Result<EventStatus> {
    Ok(match s {
        "pending" => EventStatus::Pending,
        "triggered" => EventStatus::Triggered,
        "cancelled" => EventStatus::Cancelled,
        other => bail!("unknown event status '{other}'"),
    })
}

fn row_to_state(row: &PgRow) -> Result<State> {
    let dependencies: Value = row.get("dependencies");
    let dependencies: SmallVec<[String; 4]> = serde_json::from_value(dependencies)?;
    let output_event: Option<Value> = row.get("output_event");
    let output_event: Option<EventDefinition> = output_event
        .map(serde_json::from_value)
        .transpose()?;
    let status: String = row.get("status");
    let retry_count: i32 = row.get("retry_count");
    let timeout_ms: i64 = row.get("timeout_ms");
    let attempted_retries: i32 = row.get("attempted_retries");
    let replayable_retries: i32 = row.get("replayable_retries");
    let attempted_replayable_retries: i32 = row.get("attempted_replayable_retries");
    Ok(State {
        state_machine_id: row.get("state_machine_id"),
        id: row.get("id"),
        version: row.get("version"),
        name: row.get("name"),
        description: row.get("description"),
        task: row.get("task"),
        on_entry_hook: row.get("on_entry_hook"),
        on_exit_hook: row.get("on_exit_hook"),
        dependencies,
        retry_count: retry_count as u32,
        timeout_ms: timeout_ms as u64,
        output_event,
        status: parse_state_status(&status)?,
        execution_version: row.get("execution_version"),
        attempted_retries: attempted_retries as u32,
        replayable_retries: replayable_retries as u32,
        attempted_replayable_retries: attempted_replayable_retries as u32,
    })
}

fn row_to_event(row: &PgRow) -> Result<Event> {
    let status: String = row.get("status");
    Ok(Event {
        state_machine_id: row.get("state_machine_id"),
        name: row.get("name"),
        event_type: row.get("event_type"),
        status: parse_event_status(&status)?,
        data: row.get("data"),
        source: row.get("source"),
        execution_version: row.get("execution_version"),
        replayable: row.get("replayable"),
    })
}

impl PgOrchestrationStore {
    pub fn new(shards: Vec<PgPool>) -> Self {
        assert!(!shards.is_empty(), "at least one shard pool is required");
        Self { shards }
    }

    fn shard(&self, sm_id: &str) -> &PgPool {
        let index = (stable_hash(sm_id) % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    async fn load_states(&self, pool: &PgPool, sm_id: &str) -> Result<Vec<State>> {
        let rows = sqlx::query(
            r#"
            SELECT state_machine_id, id, version, name, description, task,
                   on_entry_hook, on_exit_hook, dependencies, retry_count,
                   timeout_ms, output_event, status, execution_version,
                   attempted_retries, replayable_retries,
                   attempted_replayable_retries
            FROM states
            WHERE state_machine_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(sm_id)
        .fetch_all(pool)
        .await?;
        rows.iter().map(row_to_state).collect()
    }

    async fn load_machine(&self, pool: &PgPool, row: &PgRow) -> Result<StateMachine> {
        let sm_id: String = row.get("id");
        let status: String = row.get("status");
        let states = self.load_states(pool, &sm_id).await?;
        Ok(StateMachine {
            id: sm_id,
            version: row.get("version"),
            name: row.get("name"),
            description: row.get("description"),
            status: parse_machine_status(&status)?,
            correlation_id: row.get("correlation_id"),
            callback_endpoint_id: row.get("callback_endpoint_id"),
            states,
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl StateMachineStore for PgOrchestrationStore {
    /// Insert the machine and all of its states in one transaction.
    async fn create(&self, machine: &StateMachine) -> Result<()> {
        let pool = self.shard(&machine.id);
        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO state_machines
                (id, version, name, description, status, correlation_id,
                 callback_endpoint_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&machine.id)
        .bind(machine.version)
        .bind(&machine.name)
        .bind(&machine.description)
        .bind(machine_status_str(machine.status))
        .bind(&machine.correlation_id)
        .bind(&machine.callback_endpoint_id)
        .bind(machine.created_at)
        .execute(&mut *tx)
        .await?;

        for state in &machine.states {
            let dependencies = serde_json::to_value(&state.dependencies)?;
            let output_event = state
                .output_event
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?;
            sqlx::query(
                r#"
                INSERT INTO states
                    (state_machine_id, id, version, name, description, task,
                     on_entry_hook, on_exit_hook, dependencies, retry_count,
                     timeout_ms, output_event, status, execution_version,
                     attempted_retries, replayable_retries,
                     attempted_replayable_retries)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                        $14, $15, $16, $17)
                "#,
            )
            .bind(&state.state_machine_id)
            .bind(state.id)
            .bind(state.version)
            .bind(&state.name)
            .bind(&state.description)
            .bind(&state.task)
            .bind(&state.on_entry_hook)
            .bind(&state.on_exit_hook)
            .bind(dependencies)
            .bind(state.retry_count as i32)
            .bind(state.timeout_ms as i64)
            .bind(output_event)
            .bind(state_status_str(state.status))
            .bind(state.execution_version)
            .bind(state.attempted_retries as i32)
            .bind(state.replayable_retries as i32)
            .bind(state.attempted_replayable_retries as i32)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_by_id(&self, sm_id: &str) -> Result<Option<StateMachine>> {
        let pool = self.shard(sm_id);
        let row = sqlx::query(
            r#"
            SELECT id, version, name, description, status, correlation_id,
                   callback_endpoint_id, created_at
            FROM state_machines
            WHERE id = $1
            "#,
        )
        .bind(sm_id)
        .fetch_optional(pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.load_machine(pool, &row).await?)),
            None => Ok(None),
        }
    }

    /// The correlation id does not determine the shard, so every shard is
    /// queried in order.
    async fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Option<StateMachine>> {
        for pool in &self.shards {
            let row = sqlx::query(
                r#"
                SELECT id, version, name, description, status, correlation_id,
                       callback_endpoint_id, created_at
                FROM state_machines
                WHERE correlation_id = $1
                "#,
            )
            .bind(correlation_id)
            .fetch_optional(pool)
            .await?;
            if let Some(row) = row {
                return Ok(Some(self.load_machine(pool, &row).await?));
            }
        }
        Ok(None)
    }

    async fn update_status(&self, sm_id: &str, status: MachineStatus) -> Result<()> {
        sqlx::query("UPDATE state_machines SET status = $1 WHERE id = $2")
            .bind(machine_status_str(status))
            .bind(sm_id)
            .execute(self.shard(sm_id))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for PgOrchestrationStore {
    async fn find_by_id(&self, sm_id: &str, state_id: StateId) -> Result<Option<State>> {
        let row = sqlx::query(
            r#"
            SELECT state_machine_id, id, version, name, description, task,
                   on_entry_hook, on_exit_hook, dependencies, retry_count,
                   timeout_ms, output_event, status, execution_version,
                   attempted_retries, replayable_retries,
                   attempted_replayable_retries
            FROM states
            WHERE state_machine_id = $1 AND id = $2
            "#,
        )
        .bind(sm_id)
        .bind(state_id)
        .fetch_optional(self.shard(sm_id))
        .await?;
        row.as_ref().map(row_to_state).transpose()
    }

    /// The status guard is pushed into the WHERE clause, so the check and the
    /// write are one atomic statement even across engine nodes.
    async fn update_status(
        &self,
        sm_id: &str,
        state_id: StateId,
        expected: &[StateStatus],
        to: StateStatus,
    ) -> Result<bool> {
        let expected: Vec<&str> = expected.iter().map(|s| state_status_str(*s)).collect();
        let result = sqlx::query(
            r#"
            UPDATE states
            SET status = $1, updated_at = NOW()
            WHERE state_machine_id = $2 AND id = $3 AND status = ANY($4)
            "#,
        )
        .bind(state_status_str(to))
        .bind(sm_id)
        .bind(state_id)
        .bind(&expected)
        .execute(self.shard(sm_id))
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn increment_attempted_retries(&self, sm_id: &str, state_id: StateId) -> Result<u32> {
        let row = sqlx::query(
            r#"
            UPDATE states
            SET attempted_retries = attempted_retries + 1, updated_at = NOW()
            WHERE state_machine_id = $1 AND id = $2
            RETURNING attempted_retries
            "#,
        )
        .bind(sm_id)
        .bind(state_id)
        .fetch_one(self.shard(sm_id))
        .await?;
        let attempts: i32 = row.get("attempted_retries");
        Ok(attempts as u32)
    }

    async fn reset_attempted_retries(&self, sm_id: &str, state_id: StateId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE states
            SET attempted_retries = 0, updated_at = NOW()
            WHERE state_machine_id = $1 AND id = $2
            "#,
        )
        .bind(sm_id)
        .bind(state_id)
        .execute(self.shard(sm_id))
        .await?;
        Ok(())
    }

    async fn update_execution_version(
        &self,
        sm_id: &str,
        state_id: StateId,
        execution_version: ExecutionVersion,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE states
            SET execution_version = $1, updated_at = NOW()
            WHERE state_machine_id = $2 AND id = $3
            "#,
        )
        .bind(execution_version)
        .bind(sm_id)
        .bind(state_id)
        .execute(self.shard(sm_id))
        .await?;
        Ok(())
    }

    async fn increment_attempted_replayable_retries(
        &self,
        sm_id: &str,
        state_id: StateId,
    ) -> Result<u32> {
        let row = sqlx::query(
            r#"
            UPDATE states
            SET attempted_replayable_retries = attempted_replayable_retries + 1,
                updated_at = NOW()
            WHERE state_machine_id = $1 AND id = $2
            RETURNING attempted_replayable_retries
            "#,
        )
        .bind(sm_id)
        .bind(state_id)
        .fetch_one(self.shard(sm_id))
        .await?;
        let attempts: i32 = row.get("attempted_replayable_retries");
        Ok(attempts as u32)
    }

    /// Scatter-gather across shards; the result set is operator-facing and
    /// small.
    async fn find_errored_states(
        &self,
        machine_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<State>> {
        let mut stuck = Vec::new();
        for pool in &self.shards {
            let rows = sqlx::query(
                r#"
                SELECT s.state_machine_id, s.id, s.version, s.name, s.description,
                       s.task, s.on_entry_hook, s.on_exit_hook, s.dependencies,
                       s.retry_count, s.timeout_ms, s.output_event, s.status,
                       s.execution_version, s.attempted_retries,
                       s.replayable_retries, s.attempted_replayable_retries
                FROM states s
                JOIN state_machines m ON m.id = s.state_machine_id
                WHERE m.name = $1
                  AND s.status IN ('errored', 'sidelined')
                  AND s.updated_at BETWEEN $2 AND $3
                ORDER BY s.updated_at ASC
                "#,
            )
            .bind(machine_name)
            .bind(from)
            .bind(to)
            .fetch_all(pool)
            .await?;
            for row in &rows {
                stuck.push(row_to_state(row)?);
            }
        }
        Ok(stuck)
    }
}

#[async_trait]
impl EventStore for PgOrchestrationStore {
    async fn create(&self, event: &Event) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events
                (state_machine_id, name, event_type, status, data, source,
                 execution_version, replayable)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&event.state_machine_id)
        .bind(&event.name)
        .bind(&event.event_type)
        .bind(event_status_str(event.status))
        .bind(&event.data)
        .bind(&event.source)
        .bind(event.execution_version)
        .bind(event.replayable)
        .execute(self.shard(&event.state_machine_id))
        .await?;
        Ok(())
    }

    async fn find_by_name(&self, sm_id: &str, name: &str) -> Result<Option<Event>> {
        let row = sqlx::query(
            r#"
            SELECT state_machine_id, name, event_type, status, data, source,
                   execution_version, replayable
            FROM events
            WHERE state_machine_id = $1 AND name = $2
            "#,
        )
        .bind(sm_id)
        .bind(name)
        .fetch_optional(self.shard(sm_id))
        .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    async fn find_by_names(&self, sm_id: &str, names: &[String]) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT state_machine_id, name, event_type, status, data, source,
                   execution_version, replayable
            FROM events
            WHERE state_machine_id = $1 AND name = ANY($2)
            "#,
        )
        .bind(sm_id)
        .bind(names)
        .fetch_all(self.shard(sm_id))
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn triggered_or_cancelled_names(&self, sm_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT name FROM events
            WHERE state_machine_id = $1 AND status IN ('triggered', 'cancelled')
            "#,
        )
        .bind(sm_id)
        .fetch_all(self.shard(sm_id))
        .await?;
        Ok(rows.iter().map(|r| r.get("name")).collect())
    }

    async fn statuses_by_name(&self, sm_id: &str) -> Result<HashMap<String, EventStatus>> {
        let rows = sqlx::query("SELECT name, status FROM events WHERE state_machine_id = $1")
            .bind(sm_id)
            .fetch_all(self.shard(sm_id))
            .await?;
        let mut statuses = HashMap::with_capacity(rows.len());
        for row in &rows {
            let status: String = row.get("status");
            statuses.insert(row.get("name"), parse_event_status(&status)?);
        }
        Ok(statuses)
    }

    async fn mark_triggered(
        &self,
        sm_id: &str,
        name: &str,
        data: Option<&Value>,
        source: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE events
            SET status = 'triggered', data = $1, source = $2
            WHERE state_machine_id = $3 AND name = $4
            "#,
        )
        .bind(data)
        .bind(source)
        .bind(sm_id)
        .bind(name)
        .execute(self.shard(sm_id))
        .await?;
        Ok(())
    }

    async fn mark_cancelled(&self, sm_id: &str, name: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE events
            SET status = 'cancelled'
            WHERE state_machine_id = $1 AND name = $2
            "#,
        )
        .bind(sm_id)
        .bind(name)
        .execute(self.shard(sm_id))
        .await?;
        Ok(())
    }

    async fn mark_pending(&self, sm_id: &str, name: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE events
            SET status = 'pending', data = NULL, source = NULL,
                execution_version = execution_version + 1
            WHERE state_machine_id = $1 AND name = $2
            "#,
        )
        .bind(sm_id)
        .bind(name)
        .execute(self.shard(sm_id))
        .await?;
        Ok(())
    }

    async fn update_data(
        &self,
        sm_id: &str,
        name: &str,
        data: Option<&Value>,
        source: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE events
            SET data = $1, source = $2
            WHERE state_machine_id = $3 AND name = $4
            "#,
        )
        .bind(data)
        .bind(source)
        .bind(sm_id)
        .bind(name)
        .execute(self.shard(sm_id))
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PgOrchestrationStore {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_records
                (state_machine_id, state_id, execution_version, status,
                 error_message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&record.state_machine_id)
        .bind(record.state_id)
        .bind(record.execution_version)
        .bind(state_status_str(record.status))
        .bind(&record.error_message)
        .bind(record.created_at)
        .execute(self.shard(&record.state_machine_id))
        .await?;
        Ok(())
    }

    async fn records_for_machine(&self, sm_id: &str) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT state_machine_id, state_id, execution_version, status,
                   error_message, created_at
            FROM audit_records
            WHERE state_machine_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(sm_id)
        .fetch_all(self.shard(sm_id))
        .await?;
        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(AuditRecord {
                    state_machine_id: row.get("state_machine_id"),
                    state_id: row.get("state_id"),
                    execution_version: row.get("execution_version"),
                    status: parse_state_status(&status)?,
                    error_message: row.get("error_message"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}

impl PgSchedulerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ScheduledMessageStore for PgSchedulerStore {
    /// Upsert: re-registering a task replaces its previous deadline.
    async fn save(&self, message: &ScheduledMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_messages
                (task_id, state_machine_id, scheduled_time, execution_version)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (state_machine_id, task_id)
            DO UPDATE SET scheduled_time = $3, execution_version = $4
            "#,
        )
        .bind(message.task_id)
        .bind(&message.state_machine_id)
        .bind(message.scheduled_time)
        .bind(message.execution_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retrieve_oldest(&self, offset: i64, count: i64) -> Result<Vec<ScheduledMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT task_id, state_machine_id, scheduled_time, execution_version
            FROM scheduled_messages
            ORDER BY scheduled_time ASC
            OFFSET $1 LIMIT $2
            "#,
        )
        .bind(offset)
        .bind(count)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| ScheduledMessage {
                task_id: row.get("task_id"),
                state_machine_id: row.get("state_machine_id"),
                scheduled_time: row.get("scheduled_time"),
                execution_version: row.get("execution_version"),
            })
            .collect())
    }

    async fn delete_in_batch(&self, pairs: &[(String, StateId)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let machine_ids: Vec<String> = pairs.iter().map(|(sm, _)| sm.clone()).collect();
        let task_ids: Vec<StateId> = pairs.iter().map(|(_, task)| *task).collect();
        sqlx::query(
            r#"
            DELETE FROM scheduled_messages
            WHERE (state_machine_id, task_id) IN (
                SELECT * FROM UNNEST($1::text[], $2::bigint[])
            )
            "#,
        )
        .bind(&machine_ids)
        .bind(&task_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ScheduledEventStore for PgSchedulerStore {
    async fn save(&self, event: &ScheduledEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_events
                (correlation_id, event_name, scheduled_time_secs, event_json)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (correlation_id, event_name)
            DO UPDATE SET scheduled_time_secs = $3, event_json = $4
            "#,
        )
        .bind(&event.correlation_id)
        .bind(&event.event_name)
        .bind(event.scheduled_time_secs)
        .bind(&event.event_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retrieve_oldest(&self, count: i64) -> Result<Vec<ScheduledEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT correlation_id, event_name, scheduled_time_secs, event_json
            FROM scheduled_events
            ORDER BY scheduled_time_secs ASC
            LIMIT $1
            "#,
        )
        .bind(count)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| ScheduledEvent {
                correlation_id: row.get("correlation_id"),
                event_name: row.get("event_name"),
                scheduled_time_secs: row.get("scheduled_time_secs"),
                event_json: row.get("event_json"),
            })
            .collect())
    }

    async fn delete(&self, correlation_id: &str, event_name: &str) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM scheduled_events
            WHERE correlation_id = $1 AND event_name = $2
            "#,
        )
        .bind(correlation_id)
        .bind(event_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
