//! Per-target circuit breaker
//!
//! Each target key (a pool id, an external endpoint) has its own state
//! machine guarded by its own lock; breakers never share state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::metrics::OrchestratorMetrics;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls pass through, failures counted
    Closed,

    /// Failure threshold reached - calls rejected without an attempt
    Open,

    /// Cooldown elapsed - a single trial call is allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  threshold failures  ┌─────────┐    cooldown     ┌──────────┐
/// │ Closed  │ ──────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                      └─────────┘                 └──────────┘
///      ▲                                ▲      trial fails          │
///      │                                └───────────────────────────┤
///      │                      trial succeeds                        │
///      └────────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use shoal::reliability::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_threshold(3)
///     .with_cooldown(Duration::from_secs(10));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit (at least 1)
    pub threshold: u32,

    /// Time an open circuit waits before permitting a trial call
    #[serde(with = "crate::config::duration_millis")]
    pub cooldown_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown_duration: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the cooldown before a trial call
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_duration = cooldown;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.threshold < 1 {
            return Err(OrchestratorError::Config(
                "circuit breaker threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Failure-isolation state machine for one target key
///
/// # Example
///
/// ```ignore
/// let breaker = Arc::new(CircuitBreaker::new("memory-store", CircuitBreakerConfig::default()));
///
/// match breaker.allow() {
///     Ok(permit) => match call_store().await {
///         Ok(_) => permit.success(),
///         Err(_) => permit.failure(),
///     },
///     Err(OrchestratorError::CircuitOpen { retry_after, .. }) => {
///         // fail fast, back off for retry_after
///     }
///     Err(_) => unreachable!(),
/// }
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    metrics: Option<Arc<OrchestratorMetrics>>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            metrics: None,
        }
    }

    /// Count open transitions in the shared metrics
    pub fn with_metrics(mut self, metrics: Arc<OrchestratorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current stored state.
    ///
    /// An open circuit whose cooldown has elapsed still reports `Open` until
    /// the next call turns it half-open.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Ask to make a call.
    ///
    /// Returns a permit that must be resolved with the call's outcome. An
    /// unresolved permit that is dropped counts as a failure.
    pub fn allow(self: &Arc<Self>) -> Result<BreakerPermit> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit::new(Arc::clone(self), false)),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.cooldown_duration {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    debug!(key = %self.key, "Circuit half-open, permitting trial call");
                    Ok(BreakerPermit::new(Arc::clone(self), true))
                } else {
                    Err(self.open_error(self.config.cooldown_duration - elapsed))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.open_error(Duration::ZERO))
                } else {
                    inner.trial_in_flight = true;
                    Ok(BreakerPermit::new(Arc::clone(self), true))
                }
            }
        }
    }

    /// Run `f` under the breaker.
    ///
    /// Errors that say nothing about the target's health (see
    /// [`OrchestratorError::counts_against_target`]) release the permit
    /// without recording a failure.
    pub async fn call<F, Fut, T>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.allow()?;
        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) if e.counts_against_target() => {
                permit.failure();
                Err(e)
            }
            Err(e) => {
                permit.release();
                Err(e)
            }
        }
    }

    /// Force the circuit closed (admin/testing)
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn open_error(&self, retry_after: Duration) -> OrchestratorError {
        OrchestratorError::CircuitOpen {
            key: self.key.clone(),
            retry_after,
        }
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                info!(key = %self.key, "Circuit closed after successful trial call");
            }
            // Late result from a call admitted before the circuit opened
            _ => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        key = %self.key,
                        failures = inner.failure_count,
                        cooldown_ms = self.config.cooldown_duration.as_millis() as u64,
                        "Circuit opened"
                    );
                    self.count_open();
                }
            }
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                warn!(key = %self.key, "Trial call failed, circuit re-opened");
                self.count_open();
            }
            _ => {}
        }
    }

    fn release(&self, trial: bool) {
        if trial {
            self.inner.lock().trial_in_flight = false;
        }
    }

    fn count_open(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.circuit_opened();
        }
    }
}

/// Permit held for the duration of a protected call
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl BreakerPermit {
    fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    /// Whether this permit is the half-open trial call
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Report the call succeeded
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success(self.trial);
    }

    /// Report the call failed
    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure(self.trial);
    }

    /// Give the permit back without judging the target
    pub fn release(mut self) {
        self.resolved = true;
        self.breaker.release(self.trial);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        // Cancelled mid-call: treat as a failure so a trial slot is never leaked
        if !self.resolved {
            self.breaker.record_failure(self.trial);
        }
    }
}

/// Snapshot of one breaker, for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
}

/// Hands out one breaker per target key
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    metrics: Option<Arc<OrchestratorMetrics>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<OrchestratorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Get the breaker for `key`, creating it with the default config
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        self.get_with_config(key, &self.config)
    }

    /// Get the breaker for `key`, creating it with `config` if absent
    pub fn get_with_config(&self, key: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self.breakers.entry(key.to_string()).or_insert_with(|| {
            let mut breaker = CircuitBreaker::new(key, config.clone());
            if let Some(metrics) = &self.metrics {
                breaker = breaker.with_metrics(Arc::clone(metrics));
            }
            Arc::new(breaker)
        });
        Arc::clone(entry.value())
    }

    pub fn remove(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(key).map(|(_, breaker)| breaker)
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| BreakerSnapshot {
                key: entry.key().clone(),
                state: entry.value().state(),
                failure_count: entry.value().failure_count(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, cooldown_ms: u64) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "test_target",
            CircuitBreakerConfig::new()
                .with_threshold(threshold)
                .with_cooldown(Duration::from_millis(cooldown_ms)),
        ))
    }

    fn backend_error() -> OrchestratorError {
        OrchestratorError::Io("connection reset".into())
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.threshold, 5);
        assert_eq!(config.cooldown_duration, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let config = CircuitBreakerConfig::new().with_threshold(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_without_invoking_backend() {
        let breaker = breaker(3, 1_000);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let result: Result<()> = breaker
                .call(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(backend_error())
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let result: Result<()> = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(OrchestratorError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let breaker = breaker(3, 1_000);

        breaker.allow().unwrap().failure();
        breaker.allow().unwrap().failure();
        breaker.allow().unwrap().success();
        breaker.allow().unwrap().failure();
        breaker.allow().unwrap().failure();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_cooldown() {
        let breaker = breaker(2, 500);
        breaker.allow().unwrap().failure();
        breaker.allow().unwrap().failure();

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(breaker.allow().is_err());

        tokio::time::advance(Duration::from_millis(1)).await;
        let trial = breaker.allow().unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Only one trial in flight
        assert!(matches!(
            breaker.allow(),
            Err(OrchestratorError::CircuitOpen { .. })
        ));

        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        breaker.allow().unwrap().success();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_restarts_cooldown() {
        let breaker = breaker(1, 100);
        breaker.allow().unwrap().failure();

        tokio::time::advance(Duration::from_millis(100)).await;
        breaker.allow().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(50)).await;
        match breaker.allow() {
            Err(OrchestratorError::CircuitOpen { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_millis(50));
            }
            other => panic!("expected open circuit, got {other:?}"),
        }

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(breaker.allow().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_counts_as_failure() {
        let breaker = breaker(1, 100);
        breaker.allow().unwrap().failure();
        tokio::time::advance(Duration::from_millis(100)).await;

        let trial = breaker.allow().unwrap();
        drop(trial);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_trial_keeps_half_open() {
        let breaker = breaker(1, 100);
        breaker.allow().unwrap().failure();
        tokio::time::advance(Duration::from_millis(100)).await;

        breaker.allow().unwrap().release();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow().unwrap().is_trial());
    }

    #[tokio::test]
    async fn test_structural_errors_do_not_trip() {
        let breaker = breaker(1, 100);
        let result: Result<()> = breaker
            .call(|| async { Err(OrchestratorError::PoolNotFound("x".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_registry_keys_are_independent() {
        let metrics = Arc::new(OrchestratorMetrics::new());
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::new().with_threshold(1))
            .with_metrics(Arc::clone(&metrics));

        let a = registry.get("pool:a");
        let b = registry.get("pool:b");
        a.allow().unwrap().failure();

        assert_eq!(a.state(), CircuitState::Open);
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(Arc::ptr_eq(&a, &registry.get("pool:a")));
        assert_eq!(registry.len(), 2);
        assert_eq!(metrics.snapshot().circuit_open_events, 1);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].key, "pool:a");
        assert_eq!(snapshot[0].state, CircuitState::Open);
    }
}
