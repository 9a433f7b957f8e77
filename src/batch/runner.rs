//! Background execution of batch jobs
//!
//! Each submitted job runs on the blocking pool and checks its cancellation
//! token between files. The registry maps batch id to the running job; the
//! job's own task removes the entry when it ends, after publishing exactly
//! one `BatchEnded` to the monitor channel.

use super::{BatchJob, BatchState, BatchStatus, FailedFile};
use crate::bus::MessageBus;
use crate::identity::NodeIdentity;
use crate::message::{BatchEnded, ChannelId, Message, MessageId, ReplyStatus};
use crate::storage::ArchiveStore;
use crate::{Error, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Result of a termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// No batch with that id is running
    NotFound,
    /// The batch stopped within the grace period
    Terminated,
    /// The batch was signalled but had not stopped when the grace period ran out
    StillRunning,
}

struct RunningBatch {
    request_id: MessageId,
    token: CancellationToken,
    done: CancellationToken,
}

/// How a job run ended, before it is turned into a `BatchEnded`.
enum JobRun {
    Completed(BatchStatus),
    Interrupted(BatchStatus),
    Failed(String),
}

/// Runs batch jobs and tracks them by batch id.
pub struct BatchRunner {
    node: NodeIdentity,
    store: Arc<ArchiveStore>,
    bus: Arc<dyn MessageBus>,
    monitor: ChannelId,
    grace: Duration,
    running: Arc<DashMap<String, RunningBatch>>,
}

impl BatchRunner {
    /// Create a runner publishing results to `monitor`
    #[must_use]
    pub fn new(
        node: NodeIdentity,
        store: Arc<ArchiveStore>,
        bus: Arc<dyn MessageBus>,
        monitor: ChannelId,
        grace: Duration,
    ) -> Self {
        Self {
            node,
            store,
            bus,
            monitor,
            grace,
            running: Arc::new(DashMap::new()),
        }
    }

    /// Start `job` in the background and return immediately.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if a batch with `batch_id` is still running; a
    /// failed `BatchEnded` is published for the rejected request.
    pub fn submit(
        &self,
        request_id: MessageId,
        batch_id: &str,
        mut job: Box<dyn BatchJob>,
    ) -> Result<()> {
        let token = CancellationToken::new();
        let done = CancellationToken::new();

        match self.running.entry(batch_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                let reason = format!("Batch '{batch_id}' is already running");
                tracing::warn!(batch_id, %request_id, "{reason}");
                publish(
                    self.bus.as_ref(),
                    &self.monitor,
                    BatchEnded {
                        request_id,
                        batch_id: batch_id.to_string(),
                        node: self.node.clone(),
                        state: BatchState::Failed,
                        status: None,
                        outcome: ReplyStatus::not_ok(reason.clone()),
                    },
                );
                return Err(Error::AlreadyExists(reason));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(RunningBatch {
                    request_id,
                    token: token.clone(),
                    done: done.clone(),
                });
            }
        }
        tracing::info!(batch_id, %request_id, job = job.name(), state = ?BatchState::Submitted, "Batch job submitted");

        let node = self.node.clone();
        let store = Arc::clone(&self.store);
        let bus = Arc::clone(&self.bus);
        let monitor = self.monitor.clone();
        let running = Arc::clone(&self.running);
        let batch_id = batch_id.to_string();

        tokio::spawn(async move {
            let job_node = node.clone();
            let job_token = token.clone();
            let job_batch_id = batch_id.clone();
            let run = tokio::task::spawn_blocking(move || {
                tracing::info!(batch_id = %job_batch_id, state = ?BatchState::Running, "Batch job started");
                match store.file_paths() {
                    Ok(files) => run_job(job.as_mut(), files, &job_token, job_node),
                    Err(e) => JobRun::Failed(
                        Error::BatchFailed(format!("cannot list files: {e}")).to_string(),
                    ),
                }
            })
            .await
            .unwrap_or_else(|e| {
                tracing::error!(batch_id = %batch_id, error = %e, "Batch job task aborted");
                JobRun::Failed(Error::BatchFailed(format!("task aborted: {e}")).to_string())
            });

            let ended = batch_ended(request_id, &batch_id, node, run);
            tracing::info!(
                batch_id = %batch_id,
                state = ?ended.state,
                ok = ended.outcome.is_ok(),
                "Batch job ended"
            );
            publish(bus.as_ref(), &monitor, ended);

            running.remove_if(&batch_id, |_, entry| entry.request_id == request_id);
            done.cancel();
        });

        Ok(())
    }

    /// Interrupt the batch `batch_id` and wait up to the grace period.
    ///
    /// An unknown id is not an error. A job still running after the grace
    /// period keeps running until its next cancellation check.
    pub async fn terminate(&self, batch_id: &str) -> TerminationOutcome {
        let Some((token, done)) = self
            .running
            .get(batch_id)
            .map(|entry| (entry.token.clone(), entry.done.clone()))
        else {
            tracing::info!(batch_id, "No running batch job to terminate");
            return TerminationOutcome::NotFound;
        };

        tracing::info!(batch_id, "Terminating batch job");
        token.cancel();

        match tokio::time::timeout(self.grace, done.cancelled()).await {
            Ok(_) => {
                tracing::info!(batch_id, "Batch job terminated");
                TerminationOutcome::Terminated
            }
            Err(_) => {
                tracing::error!(
                    batch_id,
                    grace_ms = u64::try_from(self.grace.as_millis()).unwrap_or(u64::MAX),
                    "Batch job is still running after termination request"
                );
                TerminationOutcome::StillRunning
            }
        }
    }

    /// Whether `batch_id` is registered as running
    #[must_use]
    pub fn is_running(&self, batch_id: &str) -> bool {
        self.running.contains_key(batch_id)
    }

    /// Ids of running batches, sorted
    #[must_use]
    pub fn running_batches(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Signal every running batch to stop without waiting
    pub fn cancel_all(&self) {
        for entry in self.running.iter() {
            tracing::info!(batch_id = %entry.key(), "Cancelling batch job at shutdown");
            entry.token.cancel();
        }
    }
}

impl std::fmt::Debug for BatchRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRunner")
            .field("node", &self.node)
            .field("monitor", &self.monitor)
            .field("grace", &self.grace)
            .field("running", &self.running_batches())
            .finish_non_exhaustive()
    }
}

fn run_job(
    job: &mut dyn BatchJob,
    files: Vec<PathBuf>,
    token: &CancellationToken,
    node: NodeIdentity,
) -> JobRun {
    let started_at = Utc::now();
    let mut output = Vec::new();
    if let Err(e) = job.initialize(&mut output) {
        return JobRun::Failed(
            Error::BatchFailed(format!("{} failed to initialize: {e}", job.name())).to_string(),
        );
    }

    let mut files_processed = 0;
    let mut files_failed = Vec::new();
    let mut interrupted = false;
    for path in files {
        if token.is_cancelled() {
            interrupted = true;
            break;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !job.accepts(file_name) {
            continue;
        }
        files_processed += 1;
        if let Err(e) = job.process_file(&path, &mut output) {
            tracing::warn!(file = %file_name, job = job.name(), error = %e, "Batch job failed on file");
            files_failed.push(FailedFile {
                file_name: file_name.to_string(),
                error: e.to_string(),
            });
        }
    }

    if !interrupted {
        if let Err(e) = job.finish(&mut output) {
            return JobRun::Failed(
                Error::BatchFailed(format!("{} failed to finish: {e}", job.name())).to_string(),
            );
        }
    }

    let status = BatchStatus {
        node,
        files_processed,
        files_failed,
        output,
        started_at,
        ended_at: Utc::now(),
    };
    if interrupted {
        JobRun::Interrupted(status)
    } else {
        JobRun::Completed(status)
    }
}

fn batch_ended(request_id: MessageId, batch_id: &str, node: NodeIdentity, run: JobRun) -> BatchEnded {
    let (state, status, outcome) = match run {
        JobRun::Completed(status) => {
            let outcome = if status.has_no_failures() {
                ReplyStatus::Ok
            } else {
                ReplyStatus::not_ok(format!(
                    "Batch job failed on {} files.",
                    status.files_failed.len()
                ))
            };
            (BatchState::Completed, Some(status), outcome)
        }
        JobRun::Interrupted(status) => {
            let outcome = ReplyStatus::not_ok(format!(
                "Batch job interrupted after {} files.",
                status.files_processed
            ));
            (BatchState::Interrupted, Some(status), outcome)
        }
        JobRun::Failed(reason) => (BatchState::Failed, None, ReplyStatus::not_ok(reason)),
    };
    BatchEnded {
        request_id,
        batch_id: batch_id.to_string(),
        node,
        state,
        status,
        outcome,
    }
}

fn publish(bus: &dyn MessageBus, monitor: &ChannelId, ended: BatchEnded) {
    let batch_id = ended.batch_id.clone();
    if let Err(e) = bus.send(monitor, Message::BatchEnded(ended)) {
        tracing::error!(batch_id = %batch_id, error = %e, "Could not publish batch result");
    }
}
