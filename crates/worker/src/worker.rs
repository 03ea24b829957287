//! Supervised execution of a single job.
//!
//! [`Worker::start`] spawns two tasks: the execution itself, and a
//! supervisor that awaits the execution's `JoinHandle`. Whatever happens
//! to the execution (success, failure, panic, abort) the supervisor
//! emits exactly one [`WorkerEvent`] on the pool's channel, so a slot can
//! never stay `Running` after its task is gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use spark_core::job::JobHandle;
use spark_core::protocol::{FailureReason, JobOutcome};
use spark_core::types::{JobId, SlotId};

use crate::executor::{ExecutionError, Executor};

/// Terminal notification from a worker's supervisor.
#[derive(Debug, Clone)]
pub struct WorkerEvent {
    pub slot_id: SlotId,
    pub job_id: JobId,
    pub outcome: JobOutcome,
}

/// Handle to one running job.
#[derive(Debug)]
pub struct Worker {
    slot_id: SlotId,
    job_id: JobId,
    running: Arc<AtomicBool>,
    abort: AbortHandle,
}

impl Worker {
    /// Start executing `job` in the background. Does not block.
    pub fn start(
        slot_id: SlotId,
        job: JobHandle,
        executor: Arc<dyn Executor>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        let job_id = job.job_id.clone();
        let running = Arc::new(AtomicBool::new(true));

        let execution = tokio::spawn(async move { executor.execute(&job).await });
        let abort = execution.abort_handle();

        let flag = Arc::clone(&running);
        let supervised_job = job_id.clone();
        tokio::spawn(async move {
            let outcome = match execution.await {
                Ok(Ok(output)) => JobOutcome::success(output),
                Ok(Err(ExecutionError::Failed(message))) => {
                    JobOutcome::failure(FailureReason::Error { message })
                }
                Ok(Err(ExecutionError::Crashed(detail))) => {
                    tracing::warn!(slot_id, job_id = %supervised_job, detail = %detail, "Worker crashed");
                    JobOutcome::failure(FailureReason::WorkerCrashed)
                }
                Err(e) if e.is_panic() => {
                    tracing::error!(slot_id, job_id = %supervised_job, "Worker panicked");
                    JobOutcome::failure(FailureReason::WorkerCrashed)
                }
                Err(_) => {
                    tracing::warn!(slot_id, job_id = %supervised_job, "Worker was aborted");
                    JobOutcome::failure(FailureReason::WorkerCrashed)
                }
            };

            flag.store(false, Ordering::Release);
            // The pool may already be gone during process teardown.
            let _ = events.send(WorkerEvent {
                slot_id,
                job_id: supervised_job,
                outcome,
            });
        });

        tracing::debug!(slot_id, job_id = %job_id, "Worker started");

        Self {
            slot_id,
            job_id,
            running,
            abort,
        }
    }

    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Non-blocking liveness check.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Abort the execution. The supervisor still reports an outcome.
    pub fn terminate(&self) {
        self.abort.abort();
    }
}
