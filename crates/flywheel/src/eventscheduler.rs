//! Delayed event trigger: events accepted now, fired later.
//!
//! A delayed event is persisted as a [`ScheduledEvent`] keyed by correlation
//! id and fired by a polling loop once its wall-clock time passes. Firing
//! goes through the same post-event path as an immediate event, so every
//! dispatch guarantee applies unchanged. The row is deleted only after a
//! successful post; a crash between fire and delete re-fires the event, and
//! the triggered-event idempotence of the post path absorbs the duplicate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::EventData;
use crate::domain::ScheduledEvent;
use crate::store::ScheduledEventStore;

/// Trigger times are accepted in epoch seconds; callers sending epoch
/// milliseconds are detected by magnitude and normalized. The cutover value
/// corresponds to late 2286, far beyond any plausible seconds input.
pub fn normalize_trigger_time(trigger_time: i64) -> i64 {
    if trigger_time > 9_999_999_999 {
        trigger_time / 1000
    } else {
        trigger_time
    }
}

/// Where due events are delivered. Implemented by the execution controller;
/// a trait seam so the scheduler is testable in isolation.
#[async_trait]
pub trait DelayedEventSink: Send + Sync {
    async fn deliver(&self, correlation_id: &str, event: EventData) -> anyhow::Result<()>;
}

pub struct EventSchedulerService {
    store: Arc<dyn ScheduledEventStore>,
    sink: Arc<dyn DelayedEventSink>,
    poll_interval: Duration,
    batch_size: i64,
    running: Arc<AtomicBool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl EventSchedulerService {
    pub fn new(
        store: Arc<dyn ScheduledEventStore>,
        sink: Arc<dyn DelayedEventSink>,
        poll_interval: Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            store,
            sink,
            poll_interval,
            batch_size,
            running: Arc::new(AtomicBool::new(false)),
            poller: Mutex::new(None),
        }
    }

    /// Persist a delayed event for later firing.
    pub async fn schedule(
        &self,
        correlation_id: &str,
        event: &EventData,
        trigger_time: i64,
    ) -> anyhow::Result<()> {
        let scheduled = ScheduledEvent {
            correlation_id: correlation_id.to_string(),
            event_name: event.name.clone(),
            scheduled_time_secs: normalize_trigger_time(trigger_time),
            event_json: serde_json::to_string(event)?,
        };
        self.store.save(&scheduled).await?;
        debug!(
            correlation_id,
            event = %event.name,
            at = scheduled.scheduled_time_secs,
            "delayed event scheduled"
        );
        Ok(())
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let store = Arc::clone(&self.store);
        let sink = Arc::clone(&self.sink);
        let running = Arc::clone(&self.running);
        let poll_interval = self.poll_interval;
        let batch_size = self.batch_size;
        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                fire_due_events(store.as_ref(), sink.as_ref(), batch_size).await;
                tokio::time::sleep(poll_interval).await;
            }
        });
        *self.poller.lock().expect("scheduler poller poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.poller.lock().expect("scheduler poller poisoned").take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for EventSchedulerService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One pass: fire every row whose time has passed, deleting each row only
/// after its delivery succeeds. Rows are ordered by trigger time, so the
/// first future row ends the pass.
async fn fire_due_events(
    store: &dyn ScheduledEventStore,
    sink: &dyn DelayedEventSink,
    batch_size: i64,
) {
    let page = match store.retrieve_oldest(batch_size).await {
        Ok(page) => page,
        Err(error) => {
            warn!(%error, "scheduled event retrieval failed");
            return;
        }
    };
    let now_secs = Utc::now().timestamp();
    for scheduled in page {
        if scheduled.scheduled_time_secs > now_secs {
            return;
        }
        let event: EventData = match serde_json::from_str(&scheduled.event_json) {
            Ok(event) => event,
            Err(error) => {
                // A row we cannot decode would wedge the queue; drop it.
                warn!(
                    correlation_id = %scheduled.correlation_id,
                    event = %scheduled.event_name,
                    %error,
                    "undecodable scheduled event, discarding"
                );
                let _ = store
                    .delete(&scheduled.correlation_id, &scheduled.event_name)
                    .await;
                continue;
            }
        };
        match sink.deliver(&scheduled.correlation_id, event).await {
            Ok(()) => {
                debug!(
                    correlation_id = %scheduled.correlation_id,
                    event = %scheduled.event_name,
                    "delayed event fired"
                );
                if let Err(error) = store
                    .delete(&scheduled.correlation_id, &scheduled.event_name)
                    .await
                {
                    warn!(%error, "failed to delete fired scheduled event");
                }
            }
            Err(error) => {
                // Left in place; retried on the next pass.
                warn!(
                    correlation_id = %scheduled.correlation_id,
                    event = %scheduled.event_name,
                    %error,
                    "delayed event delivery failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[derive(Default)]
    struct InMemoryScheduledEvents {
        rows: Mutex<Vec<ScheduledEvent>>,
    }

    #[async_trait]
    impl ScheduledEventStore for InMemoryScheduledEvents {
        async fn save(&self, event: &ScheduledEvent) -> Result<()> {
            let mut rows = self.rows.lock().unwrap();
            rows.push(event.clone());
            rows.sort_by_key(|e| e.scheduled_time_secs);
            Ok(())
        }

        async fn retrieve_oldest(&self, count: i64) -> Result<Vec<ScheduledEvent>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .take(count as usize)
                .cloned()
                .collect())
        }

        async fn delete(&self, correlation_id: &str, event_name: &str) -> Result<()> {
            self.rows
                .lock()
                .unwrap()
                .retain(|e| !(e.correlation_id == correlation_id && e.event_name == event_name));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<(String, EventData)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl DelayedEventSink for RecordingSink {
        async fn deliver(&self, correlation_id: &str, event: EventData) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("sink unavailable");
            }
            self.delivered
                .lock()
                .unwrap()
                .push((correlation_id.to_string(), event));
            Ok(())
        }
    }

    #[test]
    fn millisecond_inputs_are_normalized_to_seconds() {
        assert_eq!(normalize_trigger_time(1_700_000_000), 1_700_000_000);
        assert_eq!(normalize_trigger_time(1_700_000_000_000), 1_700_000_000);
        assert_eq!(normalize_trigger_time(0), 0);
        assert_eq!(normalize_trigger_time(9_999_999_999), 9_999_999_999);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn due_event_fires_and_row_is_deleted() {
        let store = Arc::new(InMemoryScheduledEvents::default());
        let sink = Arc::new(RecordingSink::default());
        let service = EventSchedulerService::new(
            store.clone(),
            sink.clone(),
            Duration::from_millis(50),
            10,
        );

        let event = EventData::new("reminder", "json", Some(serde_json::json!({"n": 1})));
        service
            .schedule("order-42", &event, Utc::now().timestamp() - 1)
            .await
            .unwrap();
        service.start();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let delivered = sink.delivered.lock().unwrap().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "order-42");
        assert_eq!(delivered[0].1.name, "reminder");
        assert!(store.rows.lock().unwrap().is_empty());
        service.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn future_event_is_not_fired_early() {
        let store = Arc::new(InMemoryScheduledEvents::default());
        let sink = Arc::new(RecordingSink::default());
        let service = EventSchedulerService::new(
            store.clone(),
            sink.clone(),
            Duration::from_millis(50),
            10,
        );

        let event = EventData::new("reminder", "json", None);
        service
            .schedule("order-42", &event, Utc::now().timestamp() + 3_600)
            .await
            .unwrap();
        service.start();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(sink.delivered.lock().unwrap().is_empty());
        assert_eq!(store.rows.lock().unwrap().len(), 1);
        service.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_delivery_keeps_the_row_for_retry() {
        let store = Arc::new(InMemoryScheduledEvents::default());
        let sink = Arc::new(RecordingSink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let service = EventSchedulerService::new(
            store.clone(),
            sink.clone(),
            Duration::from_millis(50),
            10,
        );

        let event = EventData::new("reminder", "json", None);
        service
            .schedule("order-42", &event, Utc::now().timestamp() - 1)
            .await
            .unwrap();
        service.start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sink.delivered.lock().unwrap().is_empty());
        assert_eq!(store.rows.lock().unwrap().len(), 1);

        // Sink recovers; the next pass delivers and cleans up.
        sink.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
        assert!(store.rows.lock().unwrap().is_empty());
        service.stop();
    }
}
