//! WorkerManager - one pool's execution path

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::WorkerManagerConfig;
use crate::bus::{BusMessage, MessageBus};
use crate::error::{OrchestratorError, Result};
use crate::metrics::OrchestratorMetrics;
use crate::pool::PoolBackend;
use crate::reliability::CircuitBreaker;
use crate::types::{BackendKind, PoolId, PoolState, PoolStatus, ResultBatch, Task, TaskId, TaskResult};

/// Owns one pool's concurrency limit, circuit breaker and lifecycle events
pub struct WorkerManager {
    backend: Arc<dyn PoolBackend>,
    config: WorkerManagerConfig,
    limiter: Arc<Semaphore>,
    shared_limiter: bool,
    breaker: Arc<CircuitBreaker>,
    bus: Arc<MessageBus>,
    metrics: Arc<OrchestratorMetrics>,
    in_flight: AtomicUsize,
    waiting: AtomicUsize,
    idle: Notify,
    /// Raised on load changes the router did not cause itself
    load_changed: Arc<AtomicBool>,
    scale_lock: tokio::sync::Mutex<()>,
}

/// Counts a task in one phase (waiting or running) for as long as it lives
struct Phase<'a> {
    manager: &'a WorkerManager,
    counter: &'a AtomicUsize,
}

impl<'a> Phase<'a> {
    fn enter(manager: &'a WorkerManager, counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { manager, counter }
    }
}

impl Drop for Phase<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
        if self.manager.load() == 0 {
            self.manager.idle.notify_waiters();
        }
    }
}

impl WorkerManager {
    /// Manager with a private semaphore sized to the pool's target size
    pub fn new(
        backend: Arc<dyn PoolBackend>,
        breaker: Arc<CircuitBreaker>,
        bus: Arc<MessageBus>,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        let capacity = backend.runtime().target_size();
        Self {
            backend,
            config: WorkerManagerConfig::default(),
            limiter: Arc::new(Semaphore::new(capacity)),
            shared_limiter: false,
            breaker,
            bus,
            metrics,
            in_flight: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            idle: Notify::new(),
            load_changed: Arc::new(AtomicBool::new(false)),
            scale_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_config(mut self, config: WorkerManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a limiter shared by every pool instead of the private one
    pub fn with_shared_limiter(mut self, limiter: Arc<Semaphore>) -> Self {
        self.limiter = limiter;
        self.shared_limiter = true;
        self
    }

    /// Flag raised when load changes out of band (timeouts, worker
    /// failures, lifecycle transitions)
    pub fn with_load_signal(mut self, signal: Arc<AtomicBool>) -> Self {
        self.load_changed = signal;
        self
    }

    pub fn pool_id(&self) -> &PoolId {
        self.backend.pool_id()
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn state(&self) -> PoolState {
        self.backend.state()
    }

    pub fn backend(&self) -> &Arc<dyn PoolBackend> {
        &self.backend
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Tasks currently executing
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Tasks waiting for a slot
    pub fn queue_depth(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Routing load: executing plus waiting
    pub fn load(&self) -> usize {
        self.in_flight() + self.queue_depth()
    }

    /// Slots currently free in this manager's limiter
    pub fn available_slots(&self) -> usize {
        self.limiter.available_permits()
    }

    /// Run `task` on this pool.
    ///
    /// The circuit is checked before waiting for a slot, so an open circuit
    /// fails fast. The slot is released before any event is published.
    #[instrument(skip(self, task), fields(pool_id = %self.pool_id(), task_id = %task.id))]
    pub async fn execute(&self, task: Task) -> Result<TaskResult> {
        let task_id = task.id;
        let started = Instant::now();

        // Rejected before any breaker accounting, but still a failed task
        let admitted = self
            .backend
            .runtime()
            .ensure_accepting()
            .and_then(|()| self.breaker.allow());
        let permit = match admitted {
            Ok(permit) => permit,
            Err(e) => {
                self.report_failure(task_id, &e).await;
                return Err(e);
            }
        };
        let deadline = task
            .remaining()
            .or(self.config.default_task_timeout)
            .map(|timeout| started + timeout);

        let waiting = Phase::enter(self, &self.waiting);
        let slot = match self.acquire_slot(task_id, started, deadline).await {
            Ok(slot) => slot,
            Err(e) => {
                drop(waiting);
                permit.release();
                self.report_failure(task_id, &e).await;
                return Err(e);
            }
        };
        let running = Phase::enter(self, &self.in_flight);
        drop(waiting);

        let outcome = match deadline {
            Some(at) => match tokio::time::timeout_at(at, self.backend.execute(task)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.backend.cancel(task_id).await;
                    Err(OrchestratorError::Timeout {
                        task_id,
                        elapsed: started.elapsed(),
                    })
                }
            },
            None => self.backend.execute(task).await,
        };

        drop(slot);
        drop(running);

        match outcome {
            Ok(result) => {
                permit.success();
                self.metrics.task_completed();
                debug!(duration_ms = result.duration.as_millis() as u64, "Task completed");
                self.bus
                    .emit(BusMessage::TaskCompleted {
                        pool_id: self.pool_id().clone(),
                        task_id,
                        result_ref: result.result_ref(),
                    })
                    .await;
                self.publish_transitions().await;
                Ok(result)
            }
            Err(e) => {
                if e.counts_against_target() {
                    permit.failure();
                } else {
                    permit.release();
                }
                self.report_failure(task_id, &e).await;
                self.publish_transitions().await;
                Err(e)
            }
        }
    }

    async fn acquire_slot(
        &self,
        task_id: TaskId,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<OwnedSemaphorePermit> {
        let acquire = Arc::clone(&self.limiter).acquire_owned();
        let acquired = match deadline {
            Some(at) => tokio::time::timeout_at(at, acquire).await.map_err(|_| {
                OrchestratorError::Timeout {
                    task_id,
                    elapsed: started.elapsed(),
                }
            })?,
            None => acquire.await,
        };
        // Closed limiter: the pool was closed while the task waited
        acquired.map_err(|_| OrchestratorError::PoolUnavailable {
            pool_id: self.pool_id().clone(),
            state: self.state(),
        })
    }

    async fn report_failure(&self, task_id: TaskId, error: &OrchestratorError) {
        match error {
            OrchestratorError::Timeout { elapsed, .. } => {
                warn!(
                    pool_id = %self.pool_id(),
                    task_id = %task_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Task timed out"
                );
                self.metrics.task_timed_out();
            }
            _ => {
                warn!(pool_id = %self.pool_id(), task_id = %task_id, error = %error, "Task failed");
                self.metrics.task_failed();
            }
        }
        if error.counts_against_target() {
            self.load_changed.store(true, Ordering::Release);
        }
        self.bus
            .emit(BusMessage::TaskFailed {
                pool_id: self.pool_id().clone(),
                task_id,
                error: error.to_string(),
                error_kind: error.kind().to_string(),
            })
            .await;
    }

    /// Publish lifecycle transitions recorded by the pool, oldest first
    pub async fn publish_transitions(&self) {
        let transitions = self.backend.runtime().take_transitions();
        if transitions.is_empty() {
            return;
        }
        self.load_changed.store(true, Ordering::Release);
        for transition in transitions {
            info!(
                pool_id = %self.pool_id(),
                from = %transition.from,
                to = %transition.to,
                "Pool lifecycle changed"
            );
            self.bus
                .emit(BusMessage::PoolLifecycleChanged {
                    pool_id: self.pool_id().clone(),
                    old_state: transition.from,
                    new_state: transition.to,
                })
                .await;
        }
    }

    /// Resize the pool.
    ///
    /// Shrinking a private limiter first takes the surplus slots, waiting
    /// for in-flight work to hand them back, so the pool never runs more
    /// tasks than its new size.
    #[instrument(skip(self), fields(pool_id = %self.pool_id()))]
    pub async fn scale(&self, target_size: usize) -> Result<()> {
        let _serialized = self.scale_lock.lock().await;

        let state = self.state();
        if state != PoolState::Running {
            return Err(OrchestratorError::InvalidTransition {
                pool_id: self.pool_id().clone(),
                state,
                operation: "scale",
            });
        }
        if target_size == 0 {
            return Err(OrchestratorError::Config(format!(
                "pool {} target_size must be at least 1",
                self.pool_id()
            )));
        }

        let current = self.backend.runtime().target_size();
        let result = if self.shared_limiter || target_size == current {
            self.backend.scale(target_size).await
        } else if target_size > current {
            let result = self.backend.scale(target_size).await;
            if result.is_ok() {
                self.limiter.add_permits(target_size - current);
            }
            result
        } else {
            let surplus = (current - target_size) as u32;
            match Arc::clone(&self.limiter).acquire_many_owned(surplus).await {
                Ok(held) => {
                    let result = self.backend.scale(target_size).await;
                    if result.is_ok() {
                        held.forget();
                    }
                    result
                }
                Err(_) => Err(OrchestratorError::InvalidTransition {
                    pool_id: self.pool_id().clone(),
                    state: self.state(),
                    operation: "scale",
                }),
            }
        };

        self.publish_transitions().await;
        if result.is_ok() {
            info!(from = current, to = target_size, "Pool scaled");
        }
        result
    }

    /// Stop accepting tasks and wait (bounded) for in-flight work
    #[instrument(skip(self), fields(pool_id = %self.pool_id()))]
    pub async fn drain(&self) -> Result<()> {
        self.backend.drain().await?;
        self.publish_transitions().await;

        if tokio::time::timeout(self.config.drain_timeout, self.wait_idle())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.in_flight(),
                timeout_ms = self.config.drain_timeout.as_millis() as u64,
                "Drain timed out with tasks still running"
            );
        } else {
            info!("Pool drained");
        }
        Ok(())
    }

    /// Close the pool. Tasks still waiting for a slot fail with
    /// `PoolUnavailable`.
    #[instrument(skip(self), fields(pool_id = %self.pool_id()))]
    pub async fn close(&self) -> Result<()> {
        self.backend.close().await?;
        if !self.shared_limiter {
            self.limiter.close();
        }
        self.publish_transitions().await;
        Ok(())
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.load() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Backend status with this manager's queue and in-flight counts
    pub async fn status(&self) -> Result<PoolStatus> {
        let mut status = self.backend.status().await?;
        status.queue_depth += self.queue_depth();
        status.in_flight = self.in_flight();
        Ok(status)
    }

    pub async fn collect_results(&self) -> Result<ResultBatch> {
        self.backend.collect_results().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MessageBusConfig, Subscriber, POOL_LIFECYCLE_CHANGED, TASK_COMPLETED, TASK_FAILED};
    use crate::pool::{spawn_pool, PoolSpec, TaskExecutor};
    use crate::reliability::{CircuitBreakerConfig, CircuitState};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    /// Executor driven by the payload: `{"sleep_ms": n}` or `{"fail": true}`
    #[derive(Default)]
    struct Scripted {
        calls: AtomicUsize,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl TaskExecutor for Scripted {
        async fn execute(&self, task: &Task) -> anyhow::Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(ms) = task.payload["sleep_ms"].as_u64() {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            self.current.fetch_sub(1, Ordering::SeqCst);
            if task.payload["fail"].as_bool() == Some(true) {
                anyhow::bail!("scripted failure");
            }
            Ok(json!("ok"))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<BusMessage>>);

    #[async_trait]
    impl Subscriber for Recorder {
        async fn handle(&self, message: &BusMessage) -> anyhow::Result<()> {
            self.0.lock().push(message.clone());
            Ok(())
        }
    }

    struct Fixture {
        manager: Arc<WorkerManager>,
        executor: Arc<Scripted>,
        events: Arc<Recorder>,
        metrics: Arc<OrchestratorMetrics>,
    }

    fn fixture(target: usize, breaker: CircuitBreakerConfig, config: WorkerManagerConfig) -> Fixture {
        let metrics = Arc::new(OrchestratorMetrics::new());
        let bus = Arc::new(MessageBus::new(MessageBusConfig::default(), Arc::clone(&metrics)));
        let events = Arc::new(Recorder::default());
        for topic in [POOL_LIFECYCLE_CHANGED, TASK_COMPLETED, TASK_FAILED] {
            bus.subscribe(topic, events.clone());
        }
        let executor = Arc::new(Scripted::default());
        let backend = spawn_pool(PoolSpec::local("p", target, executor.clone()), Arc::clone(&metrics)).unwrap();
        let breaker = Arc::new(CircuitBreaker::new("pool:p", breaker).with_metrics(Arc::clone(&metrics)));
        let manager = Arc::new(
            WorkerManager::new(backend, breaker, bus, Arc::clone(&metrics)).with_config(config),
        );
        Fixture {
            manager,
            executor,
            events,
            metrics,
        }
    }

    fn default_fixture(target: usize) -> Fixture {
        fixture(target, CircuitBreakerConfig::default(), WorkerManagerConfig::default())
    }

    fn topics(recorder: &Recorder) -> Vec<&'static str> {
        recorder.0.lock().iter().map(|m| m.topic()).collect()
    }

    #[tokio::test]
    async fn test_completion_publishes_after_result_is_collectable() {
        let f = default_fixture(2);
        f.manager.publish_transitions().await;

        let result = f.manager.execute(Task::new(json!({}))).await.unwrap();

        assert_eq!(result.output, json!("ok"));
        assert_eq!(topics(&f.events), vec![POOL_LIFECYCLE_CHANGED, TASK_COMPLETED]);
        assert_eq!(f.manager.collect_results().await.unwrap().len(), 1);
        assert_eq!(f.manager.in_flight(), 0);
        assert_eq!(f.manager.available_slots(), 2);
        assert_eq!(f.metrics.snapshot().tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_fails_fast() {
        let f = fixture(
            2,
            CircuitBreakerConfig::new().with_threshold(3),
            WorkerManagerConfig::default(),
        );

        for _ in 0..3 {
            let err = f.manager.execute(Task::new(json!({"fail": true}))).await.unwrap_err();
            assert!(matches!(err, OrchestratorError::BackendExecution { .. }));
        }
        assert_eq!(f.manager.breaker().state(), CircuitState::Open);

        let err = f.manager.execute(Task::new(json!({}))).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::CircuitOpen { .. }));
        assert!(err.is_retryable());
        assert_eq!(f.executor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(f.metrics.snapshot().circuit_open_events, 1);
    }

    #[tokio::test]
    async fn test_rejected_tasks_are_reported_failed() {
        let f = fixture(
            1,
            CircuitBreakerConfig::new().with_threshold(1),
            WorkerManagerConfig::default(),
        );
        f.manager.execute(Task::new(json!({"fail": true}))).await.unwrap_err();

        let task = Task::new(json!({}));
        let task_id = task.id;
        let err = f.manager.execute(task).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::CircuitOpen { .. }));

        let failed: Vec<(TaskId, String)> = f
            .events
            .0
            .lock()
            .iter()
            .filter_map(|m| match m {
                BusMessage::TaskFailed {
                    task_id,
                    error_kind,
                    ..
                } => Some((*task_id, error_kind.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[1], (task_id, "circuit_open".to_string()));
        assert_eq!(f.metrics.snapshot().tasks_failed, 2);
        // Rejection does not count against the breaker again
        assert_eq!(f.manager.breaker().failure_count(), 1);

        f.manager.breaker().reset();
        f.manager.drain().await.unwrap();
        let err = f.manager.execute(Task::new(json!({}))).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PoolUnavailable { .. }));
        assert_eq!(f.metrics.snapshot().tasks_failed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_slot_and_counts_failure() {
        let f = fixture(
            1,
            CircuitBreakerConfig::default(),
            WorkerManagerConfig::default().with_default_task_timeout(Duration::from_millis(100)),
        );
        f.manager.publish_transitions().await;

        let err = f
            .manager
            .execute(Task::new(json!({"sleep_ms": 60_000})))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Timeout { .. }));
        assert_eq!(f.manager.available_slots(), 1);
        assert_eq!(f.manager.in_flight(), 0);
        assert_eq!(f.manager.breaker().failure_count(), 1);
        assert_eq!(topics(&f.events), vec![POOL_LIFECYCLE_CHANGED, TASK_FAILED]);
        let snap = f.metrics.snapshot();
        assert_eq!(snap.tasks_timed_out, 1);
        assert_eq!(snap.tasks_failed, 1);

        let status = f.manager.status().await.unwrap();
        assert_eq!(status.busy_workers, 0);
        assert_eq!(status.pending_results, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_private_limiter_bounds_concurrency() {
        let f = default_fixture(2);
        let runs = (0..6).map(|_| {
            let manager = Arc::clone(&f.manager);
            tokio::spawn(async move { manager.execute(Task::new(json!({"sleep_ms": 50}))).await })
        });
        for run in futures::future::join_all(runs).await {
            run.unwrap().unwrap();
        }
        assert_eq!(f.executor.peak.load(Ordering::SeqCst), 2);
        assert_eq!(f.executor.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_limiter_replaces_private_one() {
        let metrics = Arc::new(OrchestratorMetrics::new());
        let bus = Arc::new(MessageBus::new(MessageBusConfig::default(), Arc::clone(&metrics)));
        let executor = Arc::new(Scripted::default());
        let global = Arc::new(Semaphore::new(3));

        // One worker per pool, but the global cap of 3 is the only limit
        let managers: Vec<Arc<WorkerManager>> = ["a", "b"]
            .into_iter()
            .map(|id| {
                let backend =
                    spawn_pool(PoolSpec::local(id, 1, executor.clone()), Arc::clone(&metrics)).unwrap();
                let breaker = Arc::new(CircuitBreaker::new(id, CircuitBreakerConfig::default()));
                Arc::new(
                    WorkerManager::new(backend, breaker, Arc::clone(&bus), Arc::clone(&metrics))
                        .with_shared_limiter(Arc::clone(&global)),
                )
            })
            .collect();

        let runs = (0..8).map(|i| {
            let manager = Arc::clone(&managers[i % 2]);
            tokio::spawn(async move { manager.execute(Task::new(json!({"sleep_ms": 50}))).await })
        });
        for run in futures::future::join_all(runs).await {
            run.unwrap().unwrap();
        }

        assert_eq!(executor.peak.load(Ordering::SeqCst), 3);
        assert_eq!(global.available_permits(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_adjusts_limiter_and_publishes_transitions() {
        let f = default_fixture(3);
        f.manager.publish_transitions().await;

        f.manager.scale(1).await.unwrap();
        assert_eq!(f.manager.available_slots(), 1);
        let status = f.manager.status().await.unwrap();
        assert_eq!(status.state, PoolState::Running);
        assert_eq!(status.worker_count, 1);
        assert!(status.worker_count <= status.target_size);

        f.manager.scale(4).await.unwrap();
        assert_eq!(f.manager.available_slots(), 4);
        assert_eq!(f.manager.status().await.unwrap().worker_count, 4);

        let lifecycle: Vec<(PoolState, PoolState)> = f
            .events
            .0
            .lock()
            .iter()
            .filter_map(|m| match m {
                BusMessage::PoolLifecycleChanged {
                    old_state,
                    new_state,
                    ..
                } => Some((*old_state, *new_state)),
                _ => None,
            })
            .collect();
        assert_eq!(
            lifecycle,
            vec![
                (PoolState::Initializing, PoolState::Running),
                (PoolState::Running, PoolState::Scaling),
                (PoolState::Scaling, PoolState::Running),
                (PoolState::Running, PoolState::Scaling),
                (PoolState::Scaling, PoolState::Running),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrink_waits_for_in_flight_work() {
        let f = default_fixture(2);
        let busy: Vec<_> = (0..2)
            .map(|_| {
                let manager = Arc::clone(&f.manager);
                tokio::spawn(async move { manager.execute(Task::new(json!({"sleep_ms": 200}))).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.manager.in_flight(), 2);

        f.manager.scale(1).await.unwrap();
        // Scale could only finish once a running task handed its slot back
        assert!(f.manager.in_flight() <= 1);
        for run in busy {
            run.await.unwrap().unwrap();
        }
        assert_eq!(f.manager.available_slots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_and_rejects_new_work() {
        let f = default_fixture(2);
        let running = {
            let manager = Arc::clone(&f.manager);
            tokio::spawn(async move { manager.execute(Task::new(json!({"sleep_ms": 100}))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        f.manager.drain().await.unwrap();
        assert_eq!(f.manager.in_flight(), 0);
        assert!(running.await.unwrap().is_ok());

        let err = f.manager.execute(Task::new(json!({}))).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::PoolUnavailable {
                state: PoolState::Draining,
                ..
            }
        ));
        assert!(matches!(
            f.manager.scale(3).await,
            Err(OrchestratorError::InvalidTransition { .. })
        ));

        f.manager.close().await.unwrap();
        assert_eq!(f.manager.state(), PoolState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_fails_waiting_tasks() {
        let f = default_fixture(1);
        let first = {
            let manager = Arc::clone(&f.manager);
            tokio::spawn(async move { manager.execute(Task::new(json!({"sleep_ms": 100}))).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        let queued = {
            let manager = Arc::clone(&f.manager);
            tokio::spawn(async move { manager.execute(Task::new(json!({}))).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(f.manager.queue_depth(), 1);

        f.manager.close().await.unwrap();

        assert!(matches!(
            queued.await.unwrap(),
            Err(OrchestratorError::PoolUnavailable { .. })
        ));
        assert!(first.await.unwrap().is_err());
    }
}
