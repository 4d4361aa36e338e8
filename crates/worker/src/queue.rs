//! Single-flight request queue.
//!
//! [`RequestQueue`] hands entries, in enqueue order, to one worker task
//! that runs them one at a time through the [`JobRunner`]. The next
//! entry is not started until the current one has a terminal outcome,
//! so at most one prompt is ever awaiting completion.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::JobError;
use crate::job::{ExecutionJob, JobOutput, JobRequest};
use crate::runner::JobRunner;

/// How long [`RequestQueue::shutdown`] waits for the worker to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type JobResult = Result<JobOutput, JobError>;

/// A job plus the channel its result is delivered on.
struct QueueEntry {
    job: ExecutionJob,
    reply: oneshot::Sender<JobResult>,
}

/// Handle to a queued job's eventual result.
#[derive(Debug)]
pub struct PendingJob {
    local_id: Uuid,
    rx: oneshot::Receiver<JobResult>,
}

impl PendingJob {
    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    /// Wait for the job's terminal outcome.
    pub async fn wait(self) -> JobResult {
        self.rx.await.unwrap_or(Err(JobError::QueueClosed))
    }
}

/// Serializes jobs onto a single worker.
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<QueueEntry>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl RequestQueue {
    /// Spawn the worker task. Must be called inside a Tokio runtime.
    pub fn start(runner: Arc<JobRunner>, failure_delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(runner, rx, failure_delay, cancel.clone()));

        Self {
            tx,
            worker: Mutex::new(Some(worker)),
            cancel,
        }
    }

    /// Append a job. The returned handle resolves once the job has run.
    pub fn enqueue(&self, request: JobRequest) -> Result<PendingJob, JobError> {
        if self.cancel.is_cancelled() {
            return Err(JobError::QueueClosed);
        }

        let job = ExecutionJob::new(request);
        let local_id = job.local_id;
        let (reply, rx) = oneshot::channel();

        self.tx
            .send(QueueEntry { job, reply })
            .map_err(|_| JobError::QueueClosed)?;

        tracing::debug!(local_id = %local_id, "Job enqueued");
        Ok(PendingJob { local_id, rx })
    }

    /// Stop the worker. The active job and every waiting entry are
    /// rejected with [`JobError::QueueClosed`].
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.worker.lock().await.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                tracing::warn!("Queue worker did not exit in time");
            }
        }
    }
}

async fn run_worker(
    runner: Arc<JobRunner>,
    mut rx: mpsc::UnboundedReceiver<QueueEntry>,
    failure_delay: Duration,
    cancel: CancellationToken,
) {
    tracing::info!("Queue worker started");

    loop {
        let entry = tokio::select! {
            _ = cancel.cancelled() => break,
            entry = rx.recv() => match entry {
                Some(entry) => entry,
                None => break,
            },
        };

        let QueueEntry { mut job, reply } = entry;
        let local_id = job.local_id;

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = reply.send(Err(JobError::QueueClosed));
                break;
            }
            result = runner.run(&mut job) => result,
        };

        let pause = matches!(&result, Err(e) if e.is_preparation_failure());
        if reply.send(result).is_err() {
            tracing::debug!(local_id = %local_id, "Caller dropped pending job");
        }

        if pause {
            tracing::debug!(
                local_id = %local_id,
                delay_ms = failure_delay.as_millis() as u64,
                "Pausing before next job",
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(failure_delay) => {}
            }
        }
    }

    rx.close();
    let mut rejected = 0usize;
    while let Ok(entry) = rx.try_recv() {
        let _ = entry.reply.send(Err(JobError::QueueClosed));
        rejected += 1;
    }
    tracing::info!(rejected, "Queue worker stopped");
}
