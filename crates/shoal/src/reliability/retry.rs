//! Backoff for re-routing transient failures

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// How often and how patiently `route_with_retry` re-routes a task.
///
/// Delays double from `base_delay` up to `max_delay`. With `jittered`, each
/// delay is drawn from the upper half of its step so that callers rejected
/// by the same open circuit do not come back in lockstep. An open circuit
/// always stretches the delay to its remaining cooldown.
///
/// ```
/// use shoal::reliability::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::fixed(Duration::from_millis(50), 4);
/// assert!(policy.has_attempts_remaining(3));
/// assert!(!policy.has_attempts_remaining(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first
    pub max_attempts: u32,

    #[serde(with = "crate::config::duration_millis")]
    pub base_delay: Duration,

    #[serde(with = "crate::config::duration_millis")]
    pub max_delay: Duration,

    pub jittered: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::backoff(Duration::from_millis(100), Duration::from_secs(5), 3)
    }
}

impl RetryPolicy {
    /// Doubling, jittered delays between `base_delay` and `max_delay`
    pub fn backoff(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: max_delay.max(base_delay),
            jittered: true,
        }
    }

    /// The same delay before every retry
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            jittered: false,
        }
    }

    /// Backoff before attempt number `attempt` (1-based; the first attempt
    /// never waits)
    fn step(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let doublings = (attempt - 2).min(31);
        let step = self
            .base_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay);
        if !self.jittered || step.is_zero() {
            return step;
        }
        let half = step / 2;
        half + rand::thread_rng().gen_range(Duration::ZERO..=step - half)
    }

    /// Delay before `attempt`, never shorter than an open circuit's
    /// remaining cooldown
    pub fn delay_after(&self, attempt: u32, error: &OrchestratorError) -> Duration {
        let backoff = self.step(attempt);
        match error {
            OrchestratorError::CircuitOpen { retry_after, .. } => backoff.max(*retry_after),
            _ => backoff,
        }
    }

    pub fn should_retry(&self, error: &OrchestratorError) -> bool {
        error.is_retryable()
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PoolId, TaskId};

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            jittered: false,
            ..RetryPolicy::backoff(Duration::from_millis(100), Duration::from_millis(350), 6)
        };
        let delays: Vec<Duration> = (1..=5)
            .map(|attempt| policy.delay_after(attempt, &OrchestratorError::NoRoutablePool))
            .collect();
        assert_eq!(
            delays,
            [0, 100, 200, 350, 350].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn test_jitter_stays_in_upper_half() {
        let policy = RetryPolicy::backoff(Duration::from_secs(1), Duration::from_secs(10), 5);
        for _ in 0..50 {
            let delay = policy.delay_after(3, &OrchestratorError::NoRoutablePool);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_open_circuit_delay_honors_cooldown() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10), 3);
        let err = OrchestratorError::CircuitOpen {
            key: "pool:a".into(),
            retry_after: Duration::from_secs(2),
        };
        assert_eq!(policy.delay_after(2, &err), Duration::from_secs(2));
        assert_eq!(
            policy.delay_after(2, &OrchestratorError::NoRoutablePool),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn test_only_transient_errors_are_retried() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(&OrchestratorError::NoRoutablePool));
        assert!(!policy.should_retry(&OrchestratorError::ShuttingDown));
        assert!(!policy.should_retry(&OrchestratorError::BackendExecution {
            pool_id: PoolId::from("a"),
            task_id: TaskId::new(),
            message: "exit status 2".into(),
        }));
        assert!(!policy.has_attempts_remaining(3));
    }
}
