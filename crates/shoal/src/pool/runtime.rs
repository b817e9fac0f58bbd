//! State shared by every pool backend
//!
//! [`PoolRuntime`] owns the lifecycle state machine, the worker arena, the
//! recent-duration window and the buffer of results not yet collected. All of
//! it sits behind one short-held lock; nothing here awaits.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};
use crate::metrics::OrchestratorMetrics;
use crate::types::{
    BackendKind, PoolId, PoolState, PoolStatus, TaskId, TaskResult, WorkerId, WorkerStatus,
};

/// Default capacity of the duration window
pub const DEFAULT_DURATION_WINDOW: usize = 100;

/// A recorded lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: PoolState,
    pub to: PoolState,
}

/// Fixed-capacity window of recent task durations; the oldest is evicted
#[derive(Debug, Clone)]
pub struct DurationWindow {
    capacity: usize,
    samples: VecDeque<Duration>,
}

impl DurationWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }
}

/// Read-only view of one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: WorkerId,
    /// Owning pool, kept as a lookup value only
    pub pool_id: PoolId,
    pub status: WorkerStatus,
    pub current_task: Option<TaskId>,
    pub completed: u64,
}

#[derive(Debug)]
struct WorkerSlot {
    status: WorkerStatus,
    current_task: Option<TaskId>,
    completed: u64,
    /// Removed from the arena as soon as its current task finishes
    retiring: bool,
}

impl WorkerSlot {
    fn idle() -> Self {
        Self {
            status: WorkerStatus::Idle,
            current_task: None,
            completed: 0,
            retiring: false,
        }
    }
}

#[derive(Debug)]
struct RuntimeInner {
    state: PoolState,
    target_size: usize,
    workers: Vec<Option<WorkerSlot>>,
    free: Vec<usize>,
    live: usize,
    durations: DurationWindow,
    results: Vec<TaskResult>,
    transitions: Vec<Transition>,
}

impl RuntimeInner {
    fn transition(&mut self, pool_id: &PoolId, next: PoolState, operation: &'static str) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                pool_id: pool_id.clone(),
                state: self.state,
                operation,
            });
        }
        debug!(pool_id = %pool_id, from = %self.state, to = %next, "Pool state changed");
        self.transitions.push(Transition {
            from: self.state,
            to: next,
        });
        self.state = next;
        Ok(())
    }

    fn add_worker(&mut self) -> WorkerId {
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                self.workers[index] = Some(WorkerSlot::idle());
                WorkerId(index)
            }
            None => {
                self.workers.push(Some(WorkerSlot::idle()));
                WorkerId(self.workers.len() - 1)
            }
        }
    }

    fn remove_worker(&mut self, index: usize) {
        if let Some(slot) = self.workers.get_mut(index) {
            if slot.take().is_some() {
                self.live -= 1;
                self.free.push(index);
            }
        }
    }

    fn slot_mut(&mut self, id: WorkerId) -> Option<&mut WorkerSlot> {
        self.workers.get_mut(id.0).and_then(Option::as_mut)
    }

    fn count(&self, status: WorkerStatus) -> usize {
        self.workers
            .iter()
            .flatten()
            .filter(|w| w.status == status)
            .count()
    }

    fn retiring(&self) -> usize {
        self.workers.iter().flatten().filter(|w| w.retiring).count()
    }

    /// Shrink or grow the arena towards `target_size`.
    ///
    /// Idle workers go first; busy ones beyond the target are marked retiring.
    fn reconcile(&mut self) {
        while self.live < self.target_size {
            self.add_worker();
        }

        let mut excess = self.live.saturating_sub(self.target_size);
        if excess == 0 {
            for slot in self.workers.iter_mut().flatten() {
                slot.retiring = false;
            }
            return;
        }

        let removable: Vec<usize> = self
            .workers
            .iter()
            .enumerate()
            .filter_map(|(i, w)| match w {
                Some(slot) if slot.status != WorkerStatus::Busy => Some(i),
                _ => None,
            })
            .collect();
        for index in removable.into_iter().take(excess) {
            self.remove_worker(index);
            excess -= 1;
        }

        for slot in self.workers.iter_mut().flatten() {
            if excess == 0 {
                break;
            }
            if !slot.retiring {
                slot.retiring = true;
                excess -= 1;
            }
        }
    }
}

/// Lifecycle, workers and results for one pool
#[derive(Debug)]
pub struct PoolRuntime {
    pool_id: PoolId,
    kind: BackendKind,
    inner: Mutex<RuntimeInner>,
    metrics: Arc<OrchestratorMetrics>,
}

impl PoolRuntime {
    pub fn new(
        pool_id: PoolId,
        kind: BackendKind,
        target_size: usize,
        window: usize,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        Self {
            pool_id,
            kind,
            inner: Mutex::new(RuntimeInner {
                state: PoolState::Initializing,
                target_size,
                workers: Vec::with_capacity(target_size),
                free: Vec::new(),
                live: 0,
                durations: DurationWindow::new(window),
                results: Vec::new(),
                transitions: Vec::new(),
            }),
            metrics,
        }
    }

    pub fn pool_id(&self) -> &PoolId {
        &self.pool_id
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn state(&self) -> PoolState {
        self.inner.lock().state
    }

    pub fn target_size(&self) -> usize {
        self.inner.lock().target_size
    }

    /// Create the initial workers and move `Initializing → Running`
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.transition(&self.pool_id, PoolState::Running, "start")?;
        inner.reconcile();
        Ok(())
    }

    /// Fail with `PoolUnavailable` unless the pool accepts tasks
    pub fn ensure_accepting(&self) -> Result<()> {
        let state = self.state();
        if state.accepts_tasks() {
            Ok(())
        } else {
            Err(OrchestratorError::PoolUnavailable {
                pool_id: self.pool_id.clone(),
                state,
            })
        }
    }

    /// Assign `task_id` to an idle worker.
    ///
    /// The concurrency limit lives in the WorkerManager, so a task admitted
    /// past it while every worker is busy (shared global limiter) runs
    /// without a worker assignment.
    pub fn checkout(&self, task_id: TaskId) -> Result<WorkerLease<'_>> {
        let mut inner = self.inner.lock();
        if !inner.state.accepts_tasks() {
            return Err(OrchestratorError::PoolUnavailable {
                pool_id: self.pool_id.clone(),
                state: inner.state,
            });
        }
        let worker = inner
            .workers
            .iter_mut()
            .enumerate()
            .find_map(|(index, slot)| match slot {
                Some(w) if w.status == WorkerStatus::Idle && !w.retiring => {
                    w.status = WorkerStatus::Busy;
                    w.current_task = Some(task_id);
                    Some(WorkerId(index))
                }
                _ => None,
            });
        Ok(WorkerLease {
            runtime: self,
            worker,
            settled: false,
        })
    }

    fn release(&self, worker: Option<WorkerId>, completed: bool) {
        let Some(id) = worker else { return };
        let mut inner = self.inner.lock();
        let retiring = match inner.slot_mut(id) {
            Some(slot) => {
                slot.status = WorkerStatus::Idle;
                slot.current_task = None;
                if completed {
                    slot.completed += 1;
                }
                slot.retiring
            }
            None => return,
        };
        if retiring {
            inner.remove_worker(id.0);
            if inner.state == PoolState::Scaling && inner.retiring() == 0 {
                // Last excess worker gone; the resize is complete
                let _ = inner.transition(&self.pool_id, PoolState::Running, "finish scaling");
            }
        }
    }

    fn fail(&self, worker: Option<WorkerId>) {
        let Some(id) = worker else { return };
        let mut inner = self.inner.lock();
        let retiring = match inner.slot_mut(id) {
            Some(slot) => {
                slot.status = WorkerStatus::Failed;
                slot.current_task = None;
                slot.retiring
            }
            None => return,
        };
        warn!(pool_id = %self.pool_id, worker_id = %id, "Worker failed");

        if retiring {
            inner.remove_worker(id.0);
            if inner.state == PoolState::Scaling && inner.retiring() == 0 {
                let _ = inner.transition(&self.pool_id, PoolState::Running, "finish scaling");
            }
        } else if inner.state.accepts_tasks() {
            // A draining pool keeps the failed slot until close
            inner.remove_worker(id.0);
            let replacement = inner.add_worker();
            self.metrics.worker_respawned();
            debug!(
                pool_id = %self.pool_id,
                failed = %id,
                replacement = %replacement,
                "Respawned worker"
            );
        }
    }

    /// Store a successful result for `collect_results` and sample its duration
    pub fn record_result(&self, result: TaskResult) {
        let mut inner = self.inner.lock();
        inner.durations.push(result.duration);
        inner.results.push(result);
    }

    /// Drain results not previously returned
    pub fn take_results(&self) -> Vec<TaskResult> {
        std::mem::take(&mut self.inner.lock().results)
    }

    pub fn pending_results(&self) -> usize {
        self.inner.lock().results.len()
    }

    /// `Running → Scaling`
    pub fn begin_scale(&self, target_size: usize) -> Result<()> {
        if target_size == 0 {
            return Err(OrchestratorError::Config(format!(
                "pool {} target_size must be at least 1",
                self.pool_id
            )));
        }
        let mut inner = self.inner.lock();
        if !matches!(inner.state, PoolState::Running) {
            return Err(OrchestratorError::InvalidTransition {
                pool_id: self.pool_id.clone(),
                state: inner.state,
                operation: "scale",
            });
        }
        inner.transition(&self.pool_id, PoolState::Scaling, "scale")
    }

    /// Resize the arena and return to `Running`.
    ///
    /// When busy workers must retire first, the pool stays `Scaling` until
    /// the last of them finishes.
    pub fn resize(&self, target_size: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != PoolState::Scaling {
            return Err(OrchestratorError::InvalidTransition {
                pool_id: self.pool_id.clone(),
                state: inner.state,
                operation: "resize",
            });
        }
        inner.target_size = target_size;
        inner.reconcile();
        if inner.retiring() == 0 {
            inner.transition(&self.pool_id, PoolState::Running, "finish scaling")?;
        }
        Ok(())
    }

    /// Stop accepting tasks
    pub fn drain(&self) -> Result<()> {
        self.inner
            .lock()
            .transition(&self.pool_id, PoolState::Draining, "drain")
    }

    /// Move to `Closed` and drop every worker. Closing a closed pool is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == PoolState::Closed {
            return Ok(());
        }
        inner.transition(&self.pool_id, PoolState::Closed, "close")?;
        inner.workers.clear();
        inner.free.clear();
        inner.live = 0;
        Ok(())
    }

    /// Transitions recorded since the last call, oldest first
    pub fn take_transitions(&self) -> Vec<Transition> {
        std::mem::take(&mut self.inner.lock().transitions)
    }

    pub fn worker(&self, id: WorkerId) -> Option<WorkerInfo> {
        let inner = self.inner.lock();
        inner
            .workers
            .get(id.0)
            .and_then(Option::as_ref)
            .map(|slot| WorkerInfo {
                id,
                pool_id: self.pool_id.clone(),
                status: slot.status,
                current_task: slot.current_task,
                completed: slot.completed,
            })
    }

    /// Snapshot with `queue_depth` and `in_flight` left for the caller to fill
    pub fn status(&self) -> PoolStatus {
        let inner = self.inner.lock();
        PoolStatus {
            pool_id: self.pool_id.clone(),
            kind: self.kind,
            state: inner.state,
            target_size: inner.target_size,
            worker_count: inner.live,
            idle_workers: inner.count(WorkerStatus::Idle),
            busy_workers: inner.count(WorkerStatus::Busy),
            failed_workers: inner.count(WorkerStatus::Failed),
            queue_depth: 0,
            in_flight: inner.count(WorkerStatus::Busy),
            pending_results: inner.results.len(),
            avg_task_duration: inner.durations.mean(),
        }
    }
}

/// A worker checked out for one task.
///
/// Dropping an unsettled lease (the execution was cancelled) returns the
/// worker to idle.
#[derive(Debug)]
pub struct WorkerLease<'a> {
    runtime: &'a PoolRuntime,
    worker: Option<WorkerId>,
    settled: bool,
}

impl WorkerLease<'_> {
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.worker
    }

    /// The task finished (successfully or with an ordinary error)
    pub fn complete(mut self) {
        self.settled = true;
        self.runtime.release(self.worker, true);
    }

    /// The worker itself broke; it is replaced while the pool accepts tasks
    pub fn fail(mut self) {
        self.settled = true;
        self.runtime.fail(self.worker);
    }
}

impl Drop for WorkerLease<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.runtime.release(self.worker, false);
        }
    }
}
