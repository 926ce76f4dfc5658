//! Deferred batch deletion of obsolete redrive records.
//!
//! When many tasks complete in a short window their scheduled-message rows
//! all become garbage at once. Deleting them one by one would hammer the
//! persistence layer, so removals are queued in memory and flushed by a
//! background task: at most `batch_size` entries per `max_wait` tick, one
//! batched delete call per flush. This bounds both worst-case latency and
//! worst-case batch size independent of arrival burstiness.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::StateId;
use crate::store::ScheduledMessageStore;

pub struct MessageRemovalService {
    store: Arc<dyn ScheduledMessageStore>,
    pending: Mutex<VecDeque<(String, StateId)>>,
    batch_size: usize,
    max_wait: Duration,
    running: AtomicBool,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl MessageRemovalService {
    pub fn new(
        store: Arc<dyn ScheduledMessageStore>,
        batch_size: usize,
        max_wait: Duration,
    ) -> Self {
        Self {
            store,
            pending: Mutex::new(VecDeque::new()),
            batch_size,
            max_wait,
            running: AtomicBool::new(false),
            flusher: Mutex::new(None),
        }
    }

    /// Queue a redrive record for deletion. Returns immediately; the actual
    /// delete happens on the next flush tick.
    pub fn schedule_for_removal(&self, sm_id: impl Into<String>, task_id: StateId) {
        self.pending
            .lock()
            .expect("removal queue poisoned")
            .push_back((sm_id.into(), task_id));
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.max_wait);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; consume
            // it so the first flush honors max_wait.
            ticker.tick().await;
            while service.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                service.flush_once().await;
            }
        });
        *self.flusher.lock().expect("removal flusher poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self
            .flusher
            .lock()
            .expect("removal flusher poisoned")
            .take()
        {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("removal queue poisoned").len()
    }

    async fn flush_once(&self) {
        let batch: Vec<(String, StateId)> = {
            let mut pending = self.pending.lock().expect("removal queue poisoned");
            let take = pending.len().min(self.batch_size);
            pending.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }
        debug!(count = batch.len(), "flushing deferred removals");
        if let Err(error) = self.store.delete_in_batch(&batch).await {
            // Re-queue at the front: deletion is idempotent, losing entries
            // is not an option (the sweep would redrive forever).
            warn!(%error, count = batch.len(), "batched delete failed, re-queueing");
            let mut pending = self.pending.lock().expect("removal queue poisoned");
            for pair in batch.into_iter().rev() {
                pending.push_front(pair);
            }
        }
    }
}

impl Drop for MessageRemovalService {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self
            .flusher
            .lock()
            .expect("removal flusher poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use crate::domain::ScheduledMessage;

    #[derive(Default)]
    struct RecordingMessageStore {
        batches: Mutex<Vec<Vec<(String, StateId)>>>,
    }

    #[async_trait]
    impl ScheduledMessageStore for RecordingMessageStore {
        async fn save(&self, _message: &ScheduledMessage) -> Result<()> {
            Ok(())
        }

        async fn retrieve_oldest(
            &self,
            _offset: i64,
            _count: i64,
        ) -> Result<Vec<ScheduledMessage>> {
            Ok(Vec::new())
        }

        async fn delete_in_batch(&self, pairs: &[(String, StateId)]) -> Result<()> {
            self.batches.lock().unwrap().push(pairs.to_vec());
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn removal_is_deferred_until_the_wait_elapses() {
        let store = Arc::new(RecordingMessageStore::default());
        let service = Arc::new(MessageRemovalService::new(
            store.clone(),
            10,
            Duration::from_millis(200),
        ));
        service.start();

        service.schedule_for_removal("sm-1", 123);
        service.schedule_for_removal("sm-1", 123);
        service.schedule_for_removal("sm-1", 123);

        // Nothing may flush before the wait elapses.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.batches.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let batches = store.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0],
            vec![
                ("sm-1".to_string(), 123),
                ("sm-1".to_string(), 123),
                ("sm-1".to_string(), 123)
            ]
        );
        service.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn removal_deletes_in_batches_of_configured_size() {
        let store = Arc::new(RecordingMessageStore::default());
        let service = Arc::new(MessageRemovalService::new(
            store.clone(),
            2,
            Duration::from_millis(200),
        ));
        service.start();

        service.schedule_for_removal("sm-1", 121);
        service.schedule_for_removal("sm-1", 122);
        service.schedule_for_removal("sm-1", 123);

        tokio::time::sleep(Duration::from_millis(320)).await;
        {
            let batches = store.batches.lock().unwrap();
            assert_eq!(batches.len(), 1);
            assert_eq!(
                batches[0],
                vec![("sm-1".to_string(), 121), ("sm-1".to_string(), 122)]
            );
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
        let batches = store.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1], vec![("sm-1".to_string(), 123)]);
        service.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_queue_issues_no_deletes() {
        let store = Arc::new(RecordingMessageStore::default());
        let service = Arc::new(MessageRemovalService::new(
            store.clone(),
            10,
            Duration::from_millis(50),
        ));
        service.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.batches.lock().unwrap().is_empty());
        assert!(service.is_running());
        service.stop();
        assert!(!service.is_running());
    }
}
