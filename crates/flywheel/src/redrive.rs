//! Redrive: the guarantee that a dispatched-but-unacknowledged task is
//! eventually retried, surviving process restarts.
//!
//! Two intentionally redundant layers share one delivery channel:
//!
//! - the in-memory [`RedriverRegistry`] arms a lightweight timer per
//!   dispatch for low-latency redrive in the common case, and
//! - the persisted sweep ([`RedriverService`]) polls the durable
//!   scheduled-message table and redrives overdue rows regardless of
//!   whether the in-memory timer survived — reconciling timers lost to a
//!   crash or restart.
//!
//! Both layers may fire for the same logical deadline; delivery is made
//! idempotent at the controller by its stale-execution-version check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::{ExecutionVersion, ScheduledMessage, StateId};
use crate::removal::MessageRemovalService;
use crate::store::ScheduledMessageStore;

/// A request to re-examine one task whose deadline has passed. Consumed by
/// the engine's redrive loop, which hands it to the execution controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedriveRequest {
    pub state_machine_id: String,
    pub state_id: StateId,
    pub execution_version: ExecutionVersion,
}

type TimerKey = (String, StateId, ExecutionVersion);

/// In-memory redrive timers, one per outstanding dispatch.
pub struct RedriverRegistry {
    timers: DashMap<TimerKey, JoinHandle<()>>,
    tx: mpsc::UnboundedSender<RedriveRequest>,
    store: Arc<dyn ScheduledMessageStore>,
    removal: Arc<MessageRemovalService>,
}

impl RedriverRegistry {
    pub fn new(
        store: Arc<dyn ScheduledMessageStore>,
        removal: Arc<MessageRemovalService>,
        tx: mpsc::UnboundedSender<RedriveRequest>,
    ) -> Self {
        Self {
            timers: DashMap::new(),
            tx,
            store,
            removal,
        }
    }

    /// Arm a redrive timer and persist its absolute deadline. Supersedes
    /// any previous timer for the same `(state, execution_version)`.
    pub async fn register_task(
        &self,
        sm_id: &str,
        state_id: StateId,
        delay: Duration,
        execution_version: ExecutionVersion,
    ) -> anyhow::Result<()> {
        let deadline = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::weeks(52));
        self.store
            .save(&ScheduledMessage {
                task_id: state_id,
                state_machine_id: sm_id.to_string(),
                scheduled_time: deadline,
                execution_version,
            })
            .await?;

        let key: TimerKey = (sm_id.to_string(), state_id, execution_version);
        let tx = self.tx.clone();
        let request = RedriveRequest {
            state_machine_id: sm_id.to_string(),
            state_id,
            execution_version,
        };
        debug!(
            sm_id,
            state_id,
            execution_version,
            delay_ms = delay.as_millis() as u64,
            "redrive timer armed"
        );
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the engine is shutting down.
            let _ = tx.send(request);
        });
        if let Some(previous) = self.timers.insert(key, timer) {
            previous.abort();
        }
        Ok(())
    }

    /// Cancel the timer on legitimate completion and queue the persisted
    /// deadline for deferred deletion. Best-effort: a timer lost here is
    /// still cleaned up by the sweep's idempotent delivery.
    pub fn de_register_task(
        &self,
        sm_id: &str,
        state_id: StateId,
        execution_version: ExecutionVersion,
    ) {
        let key: TimerKey = (sm_id.to_string(), state_id, execution_version);
        if let Some((_, timer)) = self.timers.remove(&key) {
            timer.abort();
        }
        self.removal.schedule_for_removal(sm_id, state_id);
        debug!(sm_id, state_id, execution_version, "redrive timer de-registered");
    }

    pub fn armed_timers(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for RedriverRegistry {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.value().abort();
        }
    }
}

/// Fixed-interval reconciliation sweep over the persisted deadlines.
pub struct RedriverService {
    store: Arc<dyn ScheduledMessageStore>,
    tx: mpsc::UnboundedSender<RedriveRequest>,
    poll_interval: Duration,
    batch_size: i64,
    initial_delay: Duration,
    running: Arc<AtomicBool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl RedriverService {
    pub fn new(
        store: Arc<dyn ScheduledMessageStore>,
        tx: mpsc::UnboundedSender<RedriveRequest>,
        poll_interval: Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            store,
            tx,
            poll_interval,
            batch_size,
            initial_delay: Duration::ZERO,
            running: Arc::new(AtomicBool::new(false)),
            poller: Mutex::new(None),
        }
    }

    /// Delay before the first sweep, e.g. to let the process finish booting.
    pub fn set_initial_delay(&mut self, delay: Duration) {
        self.initial_delay = delay;
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let store = Arc::clone(&self.store);
        let tx = self.tx.clone();
        let running = Arc::clone(&self.running);
        let poll_interval = self.poll_interval;
        let batch_size = self.batch_size;
        let initial_delay = self.initial_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            while running.load(Ordering::SeqCst) {
                sweep(store.as_ref(), &tx, batch_size).await;
                tokio::time::sleep(poll_interval).await;
            }
        });
        *self.poller.lock().expect("sweep poller poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.poller.lock().expect("sweep poller poisoned").take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for RedriverService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One pass over the persisted deadlines: page through rows ordered by
/// deadline and redrive every overdue one. Rows are ordered ascending, so
/// the first non-overdue row ends the pass.
async fn sweep(
    store: &dyn ScheduledMessageStore,
    tx: &mpsc::UnboundedSender<RedriveRequest>,
    batch_size: i64,
) {
    let now = Utc::now();
    let mut offset = 0i64;
    loop {
        let page = match store.retrieve_oldest(offset, batch_size).await {
            Ok(page) => page,
            Err(error) => {
                warn!(%error, "redrive sweep retrieval failed");
                return;
            }
        };
        let page_len = page.len() as i64;
        for message in page {
            if message.scheduled_time > now {
                return;
            }
            debug!(
                sm_id = %message.state_machine_id,
                state_id = message.task_id,
                "sweep found overdue task"
            );
            let _ = tx.send(RedriveRequest {
                state_machine_id: message.state_machine_id,
                state_id: message.task_id,
                execution_version: message.execution_version,
            });
        }
        if page_len < batch_size {
            return;
        }
        offset += batch_size;
    }
}
