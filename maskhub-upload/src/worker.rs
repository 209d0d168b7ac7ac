use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::ledger::{FailedUpload, UploadLedger};
use crate::queue::{DequeueError, QueueReceiver};
use crate::retry::{send_with_retry, RetryPolicy, UploadOutcome};
use crate::transport::UploadTransport;
use crate::types::UploadJob;

/// How long the worker waits for a job before re-checking the shutdown flag.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Error recorded for jobs still queued when the worker stops.
pub const CANCELLED_BY_SHUTDOWN: &str = "upload cancelled: worker shut down before sending";

/// Error recorded for jobs still pending when `close()` stops waiting for the worker.
pub const ABANDONED_AT_SHUTDOWN: &str =
    "upload abandoned: worker did not stop before the shutdown timeout";

/// Background worker draining the upload queue one job at a time.
pub struct UploadWorker<T: UploadTransport + ?Sized> {
    transport: Arc<T>,
    policy: RetryPolicy,
    queue: QueueReceiver,
    ledger: UploadLedger,
    shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
    stats: WorkerStats,
}

/// Statistics from the upload worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub jobs_uploaded: u64,
    pub jobs_failed: u64,
    pub retries: u64,
    pub jobs_cancelled: u64,
}

impl<T: UploadTransport + ?Sized + 'static> UploadWorker<T> {
    pub fn new(
        transport: Arc<T>,
        policy: RetryPolicy,
        queue: QueueReceiver,
        ledger: UploadLedger,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            policy,
            queue,
            ledger,
            shutdown,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stats: WorkerStats::default(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Spawn the worker onto the current tokio runtime.
    pub fn spawn(self) -> JoinHandle<WorkerStats> {
        tokio::spawn(self.run())
    }

    /// Run the upload worker until shutdown.
    ///
    /// A job in flight is always finished; jobs still queued afterwards are
    /// recorded as failed so the ledger stays balanced.
    #[instrument(skip(self))]
    pub async fn run(mut self) -> WorkerStats {
        info!("Upload worker started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("Shutdown signal received");
                        break;
                    }
                }
                next = self.queue.dequeue_timeout(self.poll_interval) => match next {
                    Ok(job) => self.process(job).await,
                    Err(DequeueError::Timeout) => continue,
                    Err(DequeueError::Closed) => {
                        debug!("Upload queue closed");
                        break;
                    }
                }
            }
        }

        self.cancel_remaining();

        info!(
            "Upload worker stopped: {} uploaded, {} failed, {} retries, {} cancelled",
            self.stats.jobs_uploaded,
            self.stats.jobs_failed,
            self.stats.retries,
            self.stats.jobs_cancelled
        );
        self.stats
    }

    async fn process(&mut self, job: UploadJob) {
        let outcome = send_with_retry(&*self.transport, &self.policy, &job).await;
        self.stats.retries += u64::from(outcome.attempts().saturating_sub(1));

        match outcome {
            UploadOutcome::Uploaded {
                measurement_id,
                attempts,
                ..
            } => {
                info!(
                    device = %job.device_name,
                    die_x = job.die_x,
                    die_y = job.die_y,
                    ?measurement_id,
                    attempts,
                    "Uploaded measurement"
                );
                self.stats.jobs_uploaded += 1;
                if !self.ledger.record_success(job.idempotency_key) {
                    debug!(device = %job.device_name, "Upload no longer tracked by the ledger");
                }
            }
            UploadOutcome::Failed {
                status,
                error,
                attempts,
                exhausted,
            } => {
                error!(
                    device = %job.device_name,
                    ?status,
                    attempts,
                    exhausted,
                    "Failed to upload measurement: {}",
                    error
                );
                self.stats.jobs_failed += 1;
                let device = job.device_name.clone();
                if !self
                    .ledger
                    .record_failure(FailedUpload::new(job, error, status, attempts))
                {
                    debug!(device = %device, "Upload no longer tracked by the ledger");
                }
            }
        }
    }

    fn cancel_remaining(&mut self) {
        self.queue.close();
        while let Some(job) = self.queue.try_dequeue() {
            warn!(device = %job.device_name, "Dropping queued upload at shutdown");
            self.stats.jobs_cancelled += 1;
            self.ledger
                .record_failure(FailedUpload::new(job, CANCELLED_BY_SHUTDOWN, None, 0));
        }
    }
}
