//! Controller configuration.

use std::time::Duration;

use crate::poller::ConvergencePoller;

/// Exponential backoff with a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the second attempt.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Multiplier applied per attempt.
    pub factor: u32,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl Backoff {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.factor.max(1).saturating_pow(exponent);
        self.initial.saturating_mul(multiplier).min(self.max)
    }
}

/// Tunables for dispatch, patching and the worker pool.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers.
    pub workers: usize,
    /// How long a round waits for the single-flight lock of its resource.
    pub lock_timeout: Duration,
    /// Deadline for one handler invocation.
    pub handler_timeout: Duration,
    /// Deadline for one store round-trip (read or patch).
    pub store_timeout: Duration,
    /// Retry policy for optimistic-concurrency conflicts inside a round.
    pub conflict_retry: Backoff,
    /// Requeue policy for rounds that reported failures.
    pub requeue: Backoff,
    /// Re-enqueue every resource on this period.
    pub resync_interval: Option<Duration>,
    /// Wait for each successful patch to become readable before finishing
    /// the handler.
    pub settle: Option<ConvergencePoller>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lock_timeout: Duration::from_secs(30),
            handler_timeout: Duration::from_secs(30),
            store_timeout: Duration::from_secs(10),
            conflict_retry: Backoff {
                initial: Duration::from_millis(10),
                max: Duration::from_secs(1),
                factor: 2,
                max_attempts: 5,
            },
            requeue: Backoff {
                initial: Duration::from_millis(500),
                max: Duration::from_secs(60),
                factor: 2,
                max_attempts: 10,
            },
            resync_interval: None,
            settle: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
            factor: 2,
            max_attempts: 5,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(350));
        assert_eq!(backoff.delay(40), Duration::from_millis(350));
    }

    #[test]
    fn test_backoff_zero_factor_is_constant() {
        let backoff = Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_secs(1),
            factor: 0,
            max_attempts: 3,
        };
        assert_eq!(backoff.delay(4), Duration::from_millis(10));
    }
}
