//! Engine tunables, with defaults suitable for development. Production
//! deployments size the batches and intervals to their persistence layer.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// System-wide ceiling on a state's retry budget. Submissions asking for
    /// more are clamped, not rejected.
    pub max_retry_count: u32,
    /// System-wide ceiling on a state's replay budget, clamped the same way.
    pub max_replayable_retries: u32,
    /// Cadence of the persisted-deadline reconciliation sweep.
    pub redriver_poll_interval: Duration,
    /// Page size of the sweep's deadline reads.
    pub redriver_batch_size: i64,
    /// Delay before the first sweep after startup.
    pub redriver_initial_delay: Duration,
    /// Most redrive records deleted per flush of the removal queue.
    pub removal_batch_size: usize,
    /// Flush cadence of the removal queue.
    pub removal_max_wait: Duration,
    /// Cadence of the delayed-event firing loop.
    pub scheduler_poll_interval: Duration,
    /// Most delayed events examined per firing pass.
    pub scheduler_batch_size: i64,
    /// Base step of the redrive backoff ladder.
    pub backoff_step_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retry_count: 10,
            max_replayable_retries: 5,
            redriver_poll_interval: Duration::from_secs(5),
            redriver_batch_size: 100,
            redriver_initial_delay: Duration::from_secs(10),
            removal_batch_size: 500,
            removal_max_wait: Duration::from_secs(2),
            scheduler_poll_interval: Duration::from_secs(1),
            scheduler_batch_size: 100,
            backoff_step_ms: 1_000,
        }
    }
}

impl EngineConfig {
    pub fn with_max_retry_count(mut self, max: u32) -> Self {
        self.max_retry_count = max;
        self
    }

    pub fn with_redriver_poll_interval(mut self, interval: Duration) -> Self {
        self.redriver_poll_interval = interval;
        self
    }

    pub fn with_removal_batch(mut self, batch_size: usize, max_wait: Duration) -> Self {
        self.removal_batch_size = batch_size;
        self.removal_max_wait = max_wait;
        self
    }

    pub fn with_scheduler_poll_interval(mut self, interval: Duration) -> Self {
        self.scheduler_poll_interval = interval;
        self
    }
}
