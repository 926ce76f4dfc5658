//! Redrive delay policy.
//!
//! The delay armed at dispatch must exceed the time a legitimately-running
//! attempt could still be executing — covering every configured retry plus
//! per-attempt timeouts — so the redriver never re-dispatches a task that
//! is merely slow. The exact formula is configuration; the contract is
//! strict monotonicity in the retry count.

use std::time::Duration;

pub trait BackoffPolicy: Send + Sync {
    /// Delay between dispatching a task and redriving it if unacknowledged,
    /// given the state's configured retry count and per-attempt timeout.
    /// Must be strictly increasing in `retry_count` for a fixed timeout.
    fn redrive_delay(&self, retry_count: u32, timeout_ms: u64) -> Duration;
}

/// Default policy: an exponential window for the retry ladder plus a linear
/// allowance of two timeouts per attempt.
///
/// `delay = 2^(retries + 2) * step + 2 * (retries + 1) * timeout`
#[derive(Debug, Clone)]
pub struct SteppedExponentialBackoff {
    step_ms: u64,
}

impl SteppedExponentialBackoff {
    pub fn new(step_ms: u64) -> Self {
        Self { step_ms }
    }
}

impl Default for SteppedExponentialBackoff {
    fn default() -> Self {
        Self { step_ms: 1_000 }
    }
}

impl BackoffPolicy for SteppedExponentialBackoff {
    fn redrive_delay(&self, retry_count: u32, timeout_ms: u64) -> Duration {
        // Saturate rather than overflow for absurd retry counts.
        let exponential = 1u64
            .checked_shl(retry_count + 2)
            .unwrap_or(u64::MAX)
            .saturating_mul(self.step_ms);
        let linear = 2 * u64::from(retry_count + 1) * timeout_ms;
        Duration::from_millis(exponential.saturating_add(linear))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_reference_delays() {
        let policy = SteppedExponentialBackoff::default();
        // 1 retry, 100ms timeout and 3 retries, 100ms timeout.
        assert_eq!(policy.redrive_delay(1, 100), Duration::from_millis(8_400));
        assert_eq!(policy.redrive_delay(3, 100), Duration::from_millis(32_800));
    }

    #[test]
    fn strictly_increasing_in_retry_count() {
        let policy = SteppedExponentialBackoff::default();
        for timeout in [0u64, 100, 5_000] {
            let mut previous = policy.redrive_delay(0, timeout);
            for retries in 1..20 {
                let next = policy.redrive_delay(retries, timeout);
                assert!(
                    next > previous,
                    "delay not increasing at retries={retries} timeout={timeout}"
                );
                previous = next;
            }
        }
    }

    #[test]
    fn huge_retry_count_saturates() {
        let policy = SteppedExponentialBackoff::default();
        let delay = policy.redrive_delay(200, 1_000);
        assert!(delay >= Duration::from_millis(u64::MAX / 2));
    }
}
