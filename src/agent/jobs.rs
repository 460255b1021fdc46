//! Job hand-off between the session and a bounded worker pool.
//!
//! ```text
//!   Agent ──Job──► JobHandle::receive_job ─► WorkerPool ─► JobRunner (≤ N at once)
//!   Agent ◄──JobResult── JobHandle::send ◄──────────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::messages::{Job, JobResult, JobStatus};
use crate::error::{Error, Result};

/// Executes jobs. Implemented by the job catalog outside this crate.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run `job` to completion, stopping early if `cancel` fires.
    async fn run(&self, job: Job, cancel: CancellationToken) -> JobResult;
}

/// Session-side ends of the job channels.
pub(crate) struct JobQueue {
    jobs: mpsc::UnboundedSender<Job>,
    results: mpsc::UnboundedReceiver<JobResult>,
}

impl JobQueue {
    /// Create a queue and the handle for the job subsystem.
    pub(crate) fn new() -> (Self, JobHandle) {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        (
            Self {
                jobs: job_tx,
                results: result_rx,
            },
            JobHandle {
                jobs: job_rx,
                results: result_tx,
            },
        )
    }

    /// Hand a job to the worker side. Gives the job back if nobody listens.
    pub(crate) fn dispatch(&self, job: Job) -> std::result::Result<(), Job> {
        self.jobs.send(job).map_err(|e| e.0)
    }

    /// Collect every result reported so far.
    pub(crate) fn drain_results(&mut self) -> Vec<JobResult> {
        let mut results = Vec::new();
        while let Ok(result) = self.results.try_recv() {
            results.push(result);
        }
        results
    }
}

/// The job subsystem's side of the session.
pub struct JobHandle {
    jobs: mpsc::UnboundedReceiver<Job>,
    results: mpsc::UnboundedSender<JobResult>,
}

impl JobHandle {
    /// Wait for the next job. `None` once the agent is gone.
    pub async fn receive_job(&mut self) -> Option<Job> {
        self.jobs.recv().await
    }

    /// Report a finished job.
    pub fn send(&self, result: JobResult) -> Result<()> {
        self.results
            .send(result)
            .map_err(|_| Error::transport("agent session is gone"))
    }

    fn reporter(&self) -> mpsc::UnboundedSender<JobResult> {
        self.results.clone()
    }
}

/// Runs jobs with bounded concurrency.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// A pool running at most `max_concurrent` jobs at once.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Pull jobs from `handle` until it closes or `cancel` fires.
    ///
    /// On cancellation, running jobs are cancelled and awaited.
    pub async fn run(
        self,
        mut handle: JobHandle,
        runner: Arc<dyn JobRunner>,
        cancel: CancellationToken,
    ) {
        let mut tasks = JoinSet::new();

        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = handle.receive_job() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Reap finished tasks so the set does not grow unbounded
            while tasks.try_join_next().is_some() {}

            let runner = runner.clone();
            let reporter = handle.reporter();
            let token = cancel.child_token();
            debug!(job = %job.id, kind = %job.kind, "starting job");

            tasks.spawn(async move {
                let _permit = permit;
                let id = job.id;
                let result = tokio::select! {
                    result = runner.run(job, token.clone()) => result,
                    _ = token.cancelled() => JobResult::new(id, JobStatus::Cancelled, Vec::new()),
                };
                if reporter.send(result).is_err() {
                    warn!(job = %id, "result dropped: agent session is gone");
                }
            });
        }

        cancel.cancel();
        while tasks.join_next().await.is_some() {}
    }
}
