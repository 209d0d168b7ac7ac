//! Run lifecycle on top of the upload queue.
//!
//! [`LaserMaskHubIntegration`] owns the queue, the worker and the ledger. A
//! caller starts a run, adds measurements as they are taken, and finishes
//! the run, which waits for every upload to settle:
//!
//! ```no_run
//! use maskhub_upload::{IntegrationOptions, LaserMaskHubIntegration, Measurement, RunConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut integration = LaserMaskHubIntegration::new(None, IntegrationOptions::default())?;
//! integration.start(RunConfig::new(42, "R1")).await?;
//! integration.add_measurement(Measurement::new("L1", 100.0, 99.8, 1.9), Some((0, 1).into()))?;
//! let summary = integration.finish(true).await?;
//! println!("{} uploaded", summary.upload_stats.successful);
//! integration.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Without credentials, or when the run cannot be registered, the run is
//! local-only: measurements and raw data are still kept, nothing is sent.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::client::MaskHubClient;
use crate::config::{MaskHubConfig, MaskHubConfigManager};
use crate::error::{MaskHubError, MaskHubResult};
use crate::ledger::{FailedUpload, UploadLedger, UploadStats};
use crate::queue::{QueueReceiver, UploadQueue};
use crate::retry::{send_with_retry, RetryPolicy, UploadOutcome};
use crate::storage::{LocalStore, DEFAULT_DATA_DIR};
use crate::transport::MaskHubApi;
use crate::types::{DiePosition, Measurement, RawDataFile, RunConfig, RunMetadata, UploadJob};
use crate::worker::{
    UploadWorker, WorkerStats, ABANDONED_AT_SHUTDOWN, CANCELLED_BY_SHUTDOWN, DEFAULT_POLL_INTERVAL,
};

/// Behaviour switches for [`LaserMaskHubIntegration`].
#[derive(Debug, Clone)]
pub struct IntegrationOptions {
    /// Upload in the background as measurements arrive. When off, jobs wait
    /// in the queue until [`LaserMaskHubIntegration::batch_upload`] or
    /// `finish()` sends them.
    pub realtime_upload: bool,
    /// Write raw data tables to parquet files.
    pub auto_save_data: bool,
    pub data_dir: PathBuf,
    pub failed_uploads_dir: PathBuf,
    /// How long `close()` waits for the worker to stop.
    pub shutdown_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for IntegrationOptions {
    fn default() -> Self {
        Self {
            realtime_upload: true,
            auto_save_data: true,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            failed_uploads_dir: PathBuf::from("."),
            shutdown_timeout: Duration::from_secs(5),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl IntegrationOptions {
    pub fn with_realtime_upload(mut self, enabled: bool) -> Self {
        self.realtime_upload = enabled;
        self
    }

    pub fn with_auto_save_data(mut self, enabled: bool) -> Self {
        self.auto_save_data = enabled;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_failed_uploads_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.failed_uploads_dir = dir.into();
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Whether a remote service is configured at all.
#[derive(Clone)]
pub enum ServiceState {
    Connected(Arc<dyn MaskHubApi>),
    LocalOnly,
}

/// Who drains the queue.
enum Drain {
    Worker {
        shutdown: watch::Sender<bool>,
        handle: JoinHandle<WorkerStats>,
    },
    Batch(QueueReceiver),
}

/// How the active run talks to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Remote { run_id: i64 },
    LocalOnly,
}

struct ActiveRun {
    config: RunConfig,
    run_id: String,
    mode: RunMode,
    measurements: Vec<Measurement>,
    started_at: Instant,
}

/// Returned by `finish()`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub run_name: String,
    pub measurement_count: usize,
    pub upload_stats: UploadStats,
    pub failed_uploads: usize,
    pub analysis_triggered: bool,
    pub duration_secs: f64,
}

/// Returned by `retry_failed()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub retried: u64,
    pub successful: u64,
    pub failed: u64,
}

/// Returned by `batch_upload()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
}

/// Point-in-time view of upload progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub pending: u64,
    /// Jobs waiting in the queue, excluding the one in flight.
    pub queue_size: usize,
    pub failed_uploads_count: usize,
    pub service_available: bool,
    pub current_run: Option<String>,
}

/// Returned by `close()`.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// `None` when no worker ran or it did not stop in time.
    pub worker_stats: Option<WorkerStats>,
    pub failed_uploads_file: Option<PathBuf>,
}

/// Uploads laser measurements to MaskHub, one run at a time.
pub struct LaserMaskHubIntegration {
    service: ServiceState,
    policy: RetryPolicy,
    options: IntegrationOptions,
    store: LocalStore,
    ledger: UploadLedger,
    queue: UploadQueue,
    drain: Option<Drain>,
    run: Option<ActiveRun>,
}

impl LaserMaskHubIntegration {
    /// Resolve configuration and connect, falling back to local-only mode
    /// when no credentials are found.
    ///
    /// Must be called inside a tokio runtime when credentials exist.
    pub fn new(config_path: Option<&Path>, options: IntegrationOptions) -> MaskHubResult<Self> {
        let manager = MaskHubConfigManager::load(config_path);
        match manager.config() {
            Some(config) => Self::from_config(config, options),
            None => {
                warn!("No MaskHub credentials found. Uploads are disabled");
                Ok(Self::local_only(options))
            }
        }
    }

    /// Connect with an explicit configuration.
    pub fn from_config(config: MaskHubConfig, options: IntegrationOptions) -> MaskHubResult<Self> {
        let policy = config.retry_policy();
        let client = MaskHubClient::new(config)?;
        info!("MaskHub service initialized");
        Self::with_service(Arc::new(client), policy, options)
    }

    /// Use any [`MaskHubApi`] implementation as the remote service.
    pub fn with_service(
        service: Arc<dyn MaskHubApi>,
        policy: RetryPolicy,
        options: IntegrationOptions,
    ) -> MaskHubResult<Self> {
        let ledger = UploadLedger::new();
        let (queue, receiver) = UploadQueue::channel();

        let drain = if options.realtime_upload {
            let runtime = Handle::try_current().map_err(|e| MaskHubError::Configuration {
                message: format!("Background uploads need a tokio runtime: {e}"),
            })?;
            let (shutdown, shutdown_rx) = watch::channel(false);
            let worker = UploadWorker::new(
                Arc::clone(&service),
                policy.clone(),
                receiver,
                ledger.clone(),
                shutdown_rx,
            )
            .with_poll_interval(options.poll_interval);
            let handle = runtime.spawn(worker.run());
            info!("Background upload worker started");
            Drain::Worker { shutdown, handle }
        } else {
            Drain::Batch(receiver)
        };

        Ok(Self {
            service: ServiceState::Connected(service),
            policy,
            store: LocalStore::new(&options.data_dir, &options.failed_uploads_dir),
            options,
            ledger,
            queue,
            drain: Some(drain),
            run: None,
        })
    }

    /// An integration that never uploads.
    pub fn local_only(options: IntegrationOptions) -> Self {
        let (queue, _) = UploadQueue::channel();
        Self {
            service: ServiceState::LocalOnly,
            policy: RetryPolicy::no_retry(),
            store: LocalStore::new(&options.data_dir, &options.failed_uploads_dir),
            options,
            ledger: UploadLedger::new(),
            queue,
            drain: None,
            run: None,
        }
    }

    pub fn service(&self) -> &ServiceState {
        &self.service
    }

    /// True when measurements of the current (or next) run will be uploaded.
    pub fn is_service_available(&self) -> bool {
        match (&self.service, &self.run) {
            (ServiceState::LocalOnly, _) => false,
            (ServiceState::Connected(_), Some(run)) => run.mode != RunMode::LocalOnly,
            (ServiceState::Connected(_), None) => true,
        }
    }

    pub fn current_run(&self) -> Option<&RunConfig> {
        self.run.as_ref().map(|r| &r.config)
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run.as_ref().map(|r| r.run_id.as_str())
    }

    /// Measurements added to the active run so far.
    pub fn measurements(&self) -> &[Measurement] {
        self.run.as_ref().map_or(&[], |r| r.measurements.as_slice())
    }

    /// Begin a run and return its id.
    ///
    /// Registration failures are logged and the run continues local-only
    /// with a `local_run_<timestamp>` id. Uploads still pending from an
    /// interrupted `finish()` are waited for before the previous run's
    /// state is saved and cleared.
    #[instrument(skip(self, run_config), fields(run = %run_config.run_name))]
    pub async fn start(&mut self, run_config: RunConfig) -> MaskHubResult<String> {
        if let Some(active) = &self.run {
            return Err(MaskHubError::RunAlreadyActive {
                run_name: active.config.run_name.clone(),
            });
        }

        let pending = self.ledger.snapshot().pending;
        if pending > 0 {
            warn!(pending, "Uploads of the previous run are still pending, waiting for them");
            self.batch_upload().await;
            self.wait_for_drain().await;
        }

        if self.ledger.failed_count() > 0 {
            if let Err(e) = self.save_failed_uploads(None) {
                error!("Could not keep failed uploads of the previous run: {}", e);
            }
        }
        self.ledger.reset();

        let mode = match &self.service {
            ServiceState::LocalOnly => {
                warn!("MaskHub service not available. Run started in local-only mode");
                RunMode::LocalOnly
            }
            ServiceState::Connected(api) => {
                let metadata = RunMetadata::from_run_config(&run_config);
                match api.create_run(&metadata).await {
                    Ok(run_id) => RunMode::Remote { run_id },
                    Err(e) => {
                        error!("Failed to create MaskHub run, continuing locally: {}", e);
                        RunMode::LocalOnly
                    }
                }
            }
        };

        let run_id = match mode {
            RunMode::Remote { run_id } => run_id.to_string(),
            RunMode::LocalOnly => local_run_id(),
        };
        info!(run_id = %run_id, "Started run");

        self.run = Some(ActiveRun {
            config: run_config,
            run_id: run_id.clone(),
            mode,
            measurements: Vec::new(),
            started_at: Instant::now(),
        });
        Ok(run_id)
    }

    /// Record a measurement and queue it for upload.
    ///
    /// `position` overrides the measurement's own die position.
    pub fn add_measurement(
        &mut self,
        mut measurement: Measurement,
        position: Option<DiePosition>,
    ) -> MaskHubResult<()> {
        let run = self.run.as_mut().ok_or(MaskHubError::NoActiveRun {
            operation: "add_measurement",
        })?;

        let timestamp = *measurement.timestamp.get_or_insert_with(Local::now);
        if let Some(position) = position {
            measurement.position = position;
        }

        let raw_data = match (&measurement.raw_data, self.options.auto_save_data) {
            (Some(batch), true) => {
                match self
                    .store
                    .save_raw_data(&run.run_id, &measurement.device_id, &timestamp, batch)
                {
                    Ok(path) => RawDataFile::Path(path),
                    Err(e) => {
                        error!(device = %measurement.device_id, "Failed to save measurement data: {}", e);
                        RawDataFile::Missing
                    }
                }
            }
            _ => RawDataFile::Missing,
        };

        if run.mode != RunMode::LocalOnly {
            let job = UploadJob::new(&run.config, &measurement, measurement.position, raw_data);
            self.ledger.record_enqueued(&job);
            match self.queue.enqueue(job) {
                Ok(()) => debug!(device = %measurement.device_id, "Queued measurement for upload"),
                Err(job) => {
                    error!(device = %job.device_name, "Upload queue is closed");
                    self.ledger
                        .record_failure(FailedUpload::new(job, CANCELLED_BY_SHUTDOWN, None, 0));
                }
            }
        }

        run.measurements.push(measurement);
        Ok(())
    }

    /// Upload every queued job in the caller's task.
    ///
    /// Only does work when background uploads are disabled.
    pub async fn batch_upload(&mut self) -> BatchSummary {
        let (api, receiver) = match (&self.service, self.drain.as_mut()) {
            (ServiceState::Connected(api), Some(Drain::Batch(receiver))) => (Arc::clone(api), receiver),
            _ => return BatchSummary::default(),
        };

        let mut summary = BatchSummary::default();
        while let Some(job) = receiver.try_dequeue() {
            summary.total += 1;
            info!(device = %job.device_name, n = summary.total, "Uploading queued measurement");
            let outcome = send_with_retry(&*api, &self.policy, &job).await;
            if record_outcome(&self.ledger, job, outcome) {
                summary.successful += 1;
            } else {
                summary.failed += 1;
            }
        }

        if summary.total > 0 {
            info!(
                "Batch upload complete: {} successful, {} failed",
                summary.successful, summary.failed
            );
        }
        summary
    }

    /// Wait for all uploads of the active run, then optionally trigger analysis.
    ///
    /// The run is cleared even when this returns early or analysis fails.
    #[instrument(skip(self))]
    pub async fn finish(&mut self, trigger_analysis: bool) -> MaskHubResult<RunSummary> {
        let run = self
            .run
            .take()
            .ok_or(MaskHubError::NoActiveRun { operation: "finish" })?;

        if matches!(self.drain, Some(Drain::Batch(_))) {
            self.batch_upload().await;
        }
        self.wait_for_drain().await;

        let mut analysis_triggered = false;
        if let (true, ServiceState::Connected(api), RunMode::Remote { .. }) =
            (trigger_analysis, &self.service, run.mode)
        {
            match api.trigger_die_analysis(&run.config.run_name).await {
                Ok(()) => analysis_triggered = true,
                Err(e) => warn!("Failed to trigger analysis: {}", e),
            }
        }

        let summary = RunSummary {
            run_id: run.run_id,
            run_name: run.config.run_name,
            measurement_count: run.measurements.len(),
            upload_stats: self.ledger.snapshot(),
            failed_uploads: self.ledger.failed_count(),
            analysis_triggered,
            duration_secs: run.started_at.elapsed().as_secs_f64(),
        };
        info!(
            run_id = %summary.run_id,
            measurements = summary.measurement_count,
            successful = summary.upload_stats.successful,
            failed = summary.upload_stats.failed,
            "Finished run"
        );
        Ok(summary)
    }

    async fn wait_for_drain(&self) {
        let Some(Drain::Worker { handle, .. }) = &self.drain else {
            return;
        };

        let drained = self.ledger.wait_until_drained();
        tokio::pin!(drained);
        loop {
            tokio::select! {
                _ = &mut drained => return,
                _ = tokio::time::sleep(self.options.poll_interval) => {
                    if handle.is_finished() {
                        warn!(
                            pending = self.ledger.snapshot().pending,
                            "Upload worker exited before the queue drained"
                        );
                        return;
                    }
                }
            }
        }
    }

    /// Resend every failed upload through the retry policy, in the caller's task.
    ///
    /// Successes leave the failed list; the rest stay with their latest error.
    pub async fn retry_failed(&self) -> RetrySummary {
        let api = match &self.service {
            ServiceState::Connected(api) => Arc::clone(api),
            ServiceState::LocalOnly => return RetrySummary::default(),
        };

        let failures = self.ledger.take_failed();
        if failures.is_empty() {
            return RetrySummary::default();
        }
        info!("Retrying {} failed uploads", failures.len());

        let mut summary = RetrySummary {
            retried: failures.len() as u64,
            ..RetrySummary::default()
        };
        let mut remaining = Vec::new();

        for failure in failures {
            let job = failure.job;
            match send_with_retry(&*api, &self.policy, &job).await {
                UploadOutcome::Uploaded { .. } => {
                    info!(device = %job.device_name, "Retry successful");
                    summary.successful += 1;
                }
                UploadOutcome::Failed {
                    status,
                    error,
                    attempts,
                    ..
                } => {
                    warn!(device = %job.device_name, "Retry failed: {}", error);
                    summary.failed += 1;
                    remaining.push(FailedUpload::new(job, error, status, attempts));
                }
            }
        }

        self.ledger.record_recovered(summary.successful);
        self.ledger.restore_failed(remaining);
        info!(
            "Retry complete: {} successful, {} still failed",
            summary.successful, summary.failed
        );
        summary
    }

    pub fn get_statistics(&self) -> StatisticsSnapshot {
        let stats = self.ledger.snapshot();
        StatisticsSnapshot {
            total: stats.total,
            successful: stats.successful,
            failed: stats.failed,
            pending: stats.pending,
            queue_size: self.queue.depth(),
            failed_uploads_count: self.ledger.failed_count(),
            service_available: self.is_service_available(),
            current_run: self.run_id().map(str::to_string),
        }
    }

    /// Failed uploads currently awaiting a retry.
    pub fn failed_uploads(&self) -> Vec<FailedUpload> {
        self.ledger.failed_uploads()
    }

    /// Write the failed-upload list to `path`, or a timestamped file.
    pub fn save_failed_uploads(&self, path: Option<&Path>) -> MaskHubResult<Option<PathBuf>> {
        self.store
            .save_failed_uploads(&self.ledger.failed_uploads(), path)
    }

    /// Stop the worker and persist any failed uploads.
    ///
    /// If the worker does not stop within `shutdown_timeout` it is left to
    /// finish on its own, and every upload still pending is written out as
    /// failed. Dropping the integration without calling this also stops the
    /// worker, but nothing is written to disk.
    pub async fn close(mut self) -> MaskHubResult<ShutdownReport> {
        if let Some(run) = &self.run {
            warn!(run_id = %run.run_id, "Closing with an unfinished run");
        }

        let worker_stats = match self.drain.take() {
            Some(Drain::Worker { shutdown, handle }) => {
                let _ = shutdown.send(true);
                match tokio::time::timeout(self.options.shutdown_timeout, handle).await {
                    Ok(Ok(stats)) => Some(stats),
                    Ok(Err(e)) => {
                        let abandoned = self.ledger.abandon_pending(ABANDONED_AT_SHUTDOWN);
                        error!(abandoned, "Upload worker failed: {}", e);
                        None
                    }
                    Err(_) => {
                        let abandoned = self.ledger.abandon_pending(ABANDONED_AT_SHUTDOWN);
                        warn!(
                            timeout_secs = self.options.shutdown_timeout.as_secs_f64(),
                            abandoned,
                            "Upload worker did not stop in time, abandoning it"
                        );
                        None
                    }
                }
            }
            Some(Drain::Batch(mut receiver)) => {
                receiver.close();
                while let Some(job) = receiver.try_dequeue() {
                    self.ledger
                        .record_failure(FailedUpload::new(job, CANCELLED_BY_SHUTDOWN, None, 0));
                }
                None
            }
            None => None,
        };

        let failed_uploads_file = self.save_failed_uploads(None)?;
        if let Some(stats) = &worker_stats {
            info!(
                uploaded = stats.jobs_uploaded,
                failed = stats.jobs_failed,
                retries = stats.retries,
                cancelled = stats.jobs_cancelled,
                "MaskHub integration closed"
            );
        }

        Ok(ShutdownReport {
            worker_stats,
            failed_uploads_file,
        })
    }
}

/// Apply an upload outcome to the ledger. Returns true on success.
fn record_outcome(ledger: &UploadLedger, job: UploadJob, outcome: UploadOutcome) -> bool {
    match outcome {
        UploadOutcome::Uploaded { .. } => {
            ledger.record_success(job.idempotency_key);
            true
        }
        UploadOutcome::Failed {
            status,
            error,
            attempts,
            ..
        } => {
            error!(device = %job.device_name, "Failed to upload measurement: {}", error);
            ledger.record_failure(FailedUpload::new(job, error, status, attempts));
            false
        }
    }
}

fn local_run_id() -> String {
    format!("local_run_{}", Local::now().format("%Y%m%d_%H%M%S"))
}
