//! Fixed-capacity pool of job slots.
//!
//! The pool owns every [`WorkerSlot`] and is the only place slot state
//! changes. Workers report back through an mpsc channel whose receiving
//! end the pool also owns; the engine pulls from it with
//! [`Pool::next_event`] and feeds each event back through
//! [`Pool::on_worker_terminal`].
//!
//! Slot lifecycle:
//!
//! ```text
//! Idle -> Assigned -> Running -> Completed | Failed -> Idle
//! ```
//!
//! A finished slot keeps its [`JobResult`] (and its job id) until the
//! engine confirms the result was handed to the link.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use spark_core::job::{JobHandle, JobResult};
use spark_core::protocol::{FailureReason, JobOutcome};
use spark_core::types::{JobId, SlotId, Timestamp};

use crate::executor::Executor;
use crate::worker::{Worker, WorkerEvent};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl SlotState {
    pub fn is_active(self) -> bool {
        matches!(self, SlotState::Assigned | SlotState::Running)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, SlotState::Completed | SlotState::Failed)
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotState::Idle => "idle",
            SlotState::Assigned => "assigned",
            SlotState::Running => "running",
            SlotState::Completed => "completed",
            SlotState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One unit of capacity.
#[derive(Debug)]
pub struct WorkerSlot {
    pub slot_id: SlotId,
    pub state: SlotState,
    pub job_id: Option<JobId>,
    pub assigned_at: Option<Timestamp>,
    worker: Option<Worker>,
    /// Terminal result waiting for delivery.
    pub result: Option<JobResult>,
}

impl WorkerSlot {
    fn idle(slot_id: SlotId) -> Self {
        Self {
            slot_id,
            state: SlotState::Idle,
            job_id: None,
            assigned_at: None,
            worker: None,
            result: None,
        }
    }

    fn owns(&self, job_id: &JobId) -> bool {
        self.job_id.as_ref() == Some(job_id)
    }

    fn finish(&mut self, job_id: JobId, outcome: JobOutcome) -> JobResult {
        self.state = if outcome.is_success() {
            SlotState::Completed
        } else {
            SlotState::Failed
        };
        self.worker = None;
        let result = JobResult { job_id, outcome };
        self.result = Some(result.clone());
        result
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("no idle slot")]
    Full,

    #[error("pool is draining")]
    Draining,

    #[error("job already owns slot {0}")]
    Duplicate(SlotId),
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

pub struct Pool {
    slots: Vec<WorkerSlot>,
    executor: Arc<dyn Executor>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    draining: bool,
}

impl Pool {
    pub fn new(capacity: usize, executor: Arc<dyn Executor>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            slots: (0..capacity).map(WorkerSlot::idle).collect(),
            executor,
            events_tx,
            events_rx,
            draining: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Slot currently owned by `job_id`, including finished slots whose
    /// result has not been delivered yet.
    pub fn slot_of(&self, job_id: &JobId) -> Option<SlotId> {
        self.slots
            .iter()
            .find(|s| s.owns(job_id))
            .map(|s| s.slot_id)
    }

    /// Put `job` into the lowest-numbered idle slot and start it.
    pub fn try_assign(&mut self, job: JobHandle) -> Result<SlotId, PoolError> {
        if self.draining {
            return Err(PoolError::Draining);
        }
        if let Some(slot_id) = self.slot_of(&job.job_id) {
            return Err(PoolError::Duplicate(slot_id));
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.state == SlotState::Idle)
            .ok_or(PoolError::Full)?;

        slot.state = SlotState::Assigned;
        slot.job_id = Some(job.job_id.clone());
        slot.assigned_at = Some(job.assigned_at);
        slot.result = None;

        let worker = Worker::start(
            slot.slot_id,
            job,
            Arc::clone(&self.executor),
            self.events_tx.clone(),
        );
        slot.worker = Some(worker);
        slot.state = SlotState::Running;

        Ok(slot.slot_id)
    }

    /// Wait for the next worker report. Cancel-safe.
    pub async fn next_event(&mut self) -> WorkerEvent {
        match self.events_rx.recv().await {
            Some(event) => event,
            // The pool holds a sender, so the channel never closes.
            None => std::future::pending().await,
        }
    }

    /// Record a worker's terminal outcome.
    ///
    /// Returns `None` for events that no longer match the slot (e.g. the
    /// late report of a worker that was force-terminated).
    pub fn on_worker_terminal(&mut self, event: WorkerEvent) -> Option<(SlotId, JobResult)> {
        let Some(slot) = self.slots.get_mut(event.slot_id) else {
            tracing::warn!(slot_id = event.slot_id, "Event for unknown slot");
            return None;
        };
        if !slot.state.is_active() || !slot.owns(&event.job_id) {
            tracing::debug!(
                slot_id = event.slot_id,
                job_id = %event.job_id,
                state = %slot.state,
                "Ignoring stale worker event",
            );
            return None;
        }

        let result = slot.finish(event.job_id, event.outcome);
        Some((slot.slot_id, result))
    }

    /// Results that have not been confirmed as delivered, by slot.
    pub fn pending_results(&self) -> Vec<(SlotId, JobResult)> {
        self.slots
            .iter()
            .filter(|s| s.state.is_finished())
            .filter_map(|s| s.result.clone().map(|r| (s.slot_id, r)))
            .collect()
    }

    /// The slot's result is on its way; free the slot. Returns `false` if
    /// the slot held no result.
    pub fn confirm_delivered(&mut self, slot_id: SlotId) -> bool {
        match self.slots.get_mut(slot_id) {
            Some(slot) if slot.state.is_finished() => {
                *slot = WorkerSlot::idle(slot_id);
                true
            }
            _ => false,
        }
    }

    /// The slot's result could not be queued in time. Its outcome becomes
    /// `DeliveryTimeout` and it stays pending.
    pub fn mark_delivery_timeout(&mut self, slot_id: SlotId) {
        if let Some(slot) = self.slots.get_mut(slot_id) {
            if let Some(result) = slot.result.as_mut() {
                result.outcome = JobOutcome::failure(FailureReason::DeliveryTimeout);
                slot.state = SlotState::Failed;
            }
        }
    }

    pub fn free_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Idle)
            .count()
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.state.is_active()).count()
    }

    /// Stop taking jobs and let the running ones finish.
    ///
    /// Workers still running after `deadline` are terminated and recorded
    /// as `ShutdownTimeout`. Returns every result that became terminal
    /// during the drain.
    pub async fn drain(&mut self, deadline: Duration) -> Vec<(SlotId, JobResult)> {
        self.draining = true;
        let until = tokio::time::Instant::now() + deadline;
        let mut drained = Vec::new();

        tracing::info!(
            active = self.active_count(),
            deadline_secs = deadline.as_secs(),
            "Draining worker pool",
        );

        while self.active_count() > 0 {
            match tokio::time::timeout_at(until, self.events_rx.recv()).await {
                Ok(Some(event)) => drained.extend(self.on_worker_terminal(event)),
                Ok(None) => break,
                Err(_) => {
                    drained.extend(self.force_terminate());
                    break;
                }
            }
        }

        drained
    }

    fn force_terminate(&mut self) -> Vec<(SlotId, JobResult)> {
        let mut terminated = Vec::new();
        for slot in self.slots.iter_mut().filter(|s| s.state.is_active()) {
            let Some(job_id) = slot.job_id.clone() else {
                continue;
            };
            if let Some(worker) = slot.worker.as_ref() {
                worker.terminate();
            }
            tracing::warn!(
                slot_id = slot.slot_id,
                job_id = %job_id,
                "Job still running at drain deadline, terminating",
            );
            let result = slot.finish(job_id, JobOutcome::failure(FailureReason::ShutdownTimeout));
            terminated.push((slot.slot_id, result));
        }
        terminated
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("slots", &self.slots)
            .field("draining", &self.draining)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::executor::ExecutionError;

    /// `hold` blocks until released; `panic` panics; anything else
    /// succeeds with the payload echoed back.
    #[derive(Default)]
    struct GateExecutor {
        release: Notify,
    }

    #[async_trait]
    impl Executor for GateExecutor {
        async fn execute(&self, job: &JobHandle) -> Result<Vec<u8>, ExecutionError> {
            match job.payload.as_slice() {
                b"hold" => {
                    self.release.notified().await;
                    Ok(b"released".to_vec())
                }
                b"forever" => std::future::pending().await,
                b"panic" => panic!("boom"),
                other => Ok(other.to_vec()),
            }
        }
    }

    fn pool(capacity: usize) -> (Pool, Arc<GateExecutor>) {
        let executor = Arc::new(GateExecutor::default());
        (Pool::new(capacity, executor.clone()), executor)
    }

    fn job(id: &str, payload: &[u8]) -> JobHandle {
        JobHandle::new(JobId::from(id), payload.to_vec())
    }

    async fn next(pool: &mut Pool) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(5), pool.next_event())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn bursts_never_exceed_capacity() {
        let (mut pool, _) = pool(3);

        for burst in 0..4 {
            for n in 0..5 {
                let _ = pool.try_assign(job(&format!("j-{burst}-{n}"), b"hold"));
                assert!(pool.active_count() <= pool.capacity());
            }
            assert_eq!(pool.active_count(), 3);
            assert_eq!(pool.free_count(), 0);
        }
    }

    #[tokio::test]
    async fn full_pool_rejects() {
        let (mut pool, _) = pool(1);
        pool.try_assign(job("a", b"hold")).unwrap();
        assert_eq!(pool.try_assign(job("b", b"hold")), Err(PoolError::Full));
    }

    #[tokio::test]
    async fn duplicate_job_is_reported_with_its_slot() {
        let (mut pool, _) = pool(2);
        let slot = pool.try_assign(job("a", b"hold")).unwrap();

        assert_eq!(
            pool.try_assign(job("a", b"hold")),
            Err(PoolError::Duplicate(slot))
        );
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.slot_of(&JobId::from("a")), Some(slot));
    }

    #[tokio::test]
    async fn lowest_idle_slot_is_used_first() {
        let (mut pool, _) = pool(3);
        assert_eq!(pool.try_assign(job("a", b"hold")), Ok(0));
        assert_eq!(pool.try_assign(job("b", b"quick")), Ok(1));
        assert_eq!(pool.try_assign(job("c", b"hold")), Ok(2));

        let event = next(&mut pool).await;
        assert_eq!(event.slot_id, 1);
        let (slot, result) = pool.on_worker_terminal(event).unwrap();
        assert_eq!(result.outcome, JobOutcome::success(b"quick".to_vec()));
        assert!(pool.confirm_delivered(slot));

        assert_eq!(pool.try_assign(job("d", b"hold")), Ok(1));
    }

    #[tokio::test]
    async fn finished_slot_stays_pending_until_confirmed() {
        let (mut pool, _) = pool(1);
        pool.try_assign(job("a", b"out")).unwrap();
        let event = next(&mut pool).await;
        pool.on_worker_terminal(event).unwrap();

        assert_eq!(pool.slots()[0].state, SlotState::Completed);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.pending_results().len(), 1);
        assert_eq!(pool.try_assign(job("b", b"x")), Err(PoolError::Full));

        assert!(pool.confirm_delivered(0));
        assert!(!pool.confirm_delivered(0));
        assert!(pool.pending_results().is_empty());
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.slot_of(&JobId::from("a")), None);
    }

    #[tokio::test]
    async fn panicking_worker_fails_the_slot() {
        let (mut pool, _) = pool(1);
        pool.try_assign(job("x", b"panic")).unwrap();

        let event = next(&mut pool).await;
        let (slot, result) = pool.on_worker_terminal(event).unwrap();
        assert_eq!(
            result.outcome,
            JobOutcome::failure(FailureReason::WorkerCrashed)
        );
        assert_eq!(pool.slots()[slot].state, SlotState::Failed);

        pool.confirm_delivered(slot);
        assert_eq!(pool.slots()[slot].state, SlotState::Idle);
    }

    #[tokio::test]
    async fn delivery_timeout_rewrites_pending_outcome() {
        let (mut pool, _) = pool(1);
        pool.try_assign(job("a", b"out")).unwrap();
        let event = next(&mut pool).await;
        let (slot, _) = pool.on_worker_terminal(event).unwrap();

        pool.mark_delivery_timeout(slot);
        let pending = pool.pending_results();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].1.outcome,
            JobOutcome::failure(FailureReason::DeliveryTimeout)
        );
        assert_eq!(pool.slots()[slot].state, SlotState::Failed);
    }

    #[tokio::test]
    async fn stale_event_is_ignored() {
        let (mut pool, _) = pool(1);
        pool.try_assign(job("a", b"hold")).unwrap();

        let stale = WorkerEvent {
            slot_id: 0,
            job_id: JobId::from("someone-else"),
            outcome: JobOutcome::success(Vec::new()),
        };
        assert!(pool.on_worker_terminal(stale).is_none());
        assert_eq!(pool.slots()[0].state, SlotState::Running);

        let unknown = WorkerEvent {
            slot_id: 9,
            job_id: JobId::from("a"),
            outcome: JobOutcome::success(Vec::new()),
        };
        assert!(pool.on_worker_terminal(unknown).is_none());
    }

    #[tokio::test]
    async fn drain_waits_for_running_jobs() {
        let (mut pool, executor) = pool(2);
        pool.try_assign(job("a", b"hold")).unwrap();

        let release = executor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            release.release.notify_one();
        });

        let drained = pool.drain(Duration::from_secs(5)).await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1.job_id, JobId::from("a"));
        assert!(drained[0].1.outcome.is_success());
        assert!(pool.is_draining());
        assert_eq!(pool.try_assign(job("b", b"x")), Err(PoolError::Draining));
    }

    #[tokio::test]
    async fn drain_deadline_terminates_stragglers() {
        let (mut pool, _) = pool(2);
        pool.try_assign(job("slow", b"forever")).unwrap();
        pool.try_assign(job("quick", b"ok")).unwrap();

        let drained = pool.drain(Duration::from_millis(50)).await;
        assert_eq!(drained.len(), 2);

        let slow = drained
            .iter()
            .find(|(_, r)| r.job_id == JobId::from("slow"))
            .unwrap();
        assert_eq!(
            slow.1.outcome,
            JobOutcome::failure(FailureReason::ShutdownTimeout)
        );
        assert_eq!(pool.active_count(), 0);

        // The aborted worker still reports; that report is stale now.
        let late = next(&mut pool).await;
        assert_matches!(pool.on_worker_terminal(late), None);
        assert_eq!(
            pool.pending_results()
                .iter()
                .find(|(_, r)| r.job_id == JobId::from("slow"))
                .map(|(_, r)| r.outcome.clone()),
            Some(JobOutcome::failure(FailureReason::ShutdownTimeout))
        );
    }

    #[tokio::test]
    async fn empty_pool_drains_immediately() {
        let (mut pool, _) = pool(2);
        let drained = pool.drain(Duration::from_secs(60)).await;
        assert!(drained.is_empty());
    }
}
