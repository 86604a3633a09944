//! Bounded worker pool fed by the router's queue.
//!
//! A single dispatcher task pulls jobs off the channel and spawns one tokio
//! task per job, holding a semaphore permit so at most `workers` run at once.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::pipeline::router::{RunOutcome, TaskRunner};
use crate::pipeline::types::RawInput;

/// A queued unit of work.
#[derive(Debug)]
pub struct Job {
    pub task_id: String,
    pub input: RawInput,
}

/// Handle to the running pool.
pub struct WorkerPool {
    dispatcher: JoinHandle<()>,
    permits: Arc<Semaphore>,
    workers: usize,
}

impl WorkerPool {
    pub(crate) fn spawn(rx: mpsc::Receiver<Job>, runner: Arc<TaskRunner>, workers: usize) -> Self {
        let permits = Arc::new(Semaphore::new(workers));
        let dispatcher = tokio::spawn(dispatch(rx, runner, permits.clone()));
        info!(workers, "Worker pool started");
        Self {
            dispatcher,
            permits,
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Wait until the queue is closed and every in-flight job has finished.
    /// The queue closes when the owning `Router` is dropped.
    pub async fn join(self) {
        if let Err(e) = self.dispatcher.await {
            error!(error = %e, "Worker dispatcher panicked");
        }
        let Ok(n) = u32::try_from(self.workers) else {
            return;
        };
        // Every permit back means every job task has returned.
        if self.permits.acquire_many(n).await.is_ok() {
            info!("Worker pool drained");
        }
    }
}

async fn dispatch(mut rx: mpsc::Receiver<Job>, runner: Arc<TaskRunner>, permits: Arc<Semaphore>) {
    while let Some(job) = rx.recv().await {
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!(task_id = %job.task_id, "Worker semaphore closed, dropping job");
                break;
            }
        };
        let runner = runner.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match runner.run(&job.task_id, job.input).await {
                Ok(RunOutcome::Finished(status)) => {
                    debug!(task_id = %job.task_id, status = %status, "Job finished");
                }
                Ok(outcome) => {
                    debug!(task_id = %job.task_id, ?outcome, "Job ended without finishing");
                }
                Err(e) => {
                    error!(task_id = %job.task_id, error = %e, "Job failed");
                }
            }
        });
    }
    debug!("Worker queue closed, dispatcher exiting");
}
