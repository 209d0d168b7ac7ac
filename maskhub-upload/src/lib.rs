//! # maskhub-upload - Background uploads of laser measurements to MaskHub
//!
//! Laser test stations produce one measurement per device and current
//! setpoint. This crate takes those measurements off the measurement loop:
//! each one is flattened into an upload job, queued, and sent to MaskHub by a
//! single background worker with bounded exponential backoff. Statistics and
//! a failed-upload list report what happened after the fact.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use maskhub_upload::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut integration = LaserMaskHubIntegration::new(None, IntegrationOptions::default())?;
//!
//! let run_id = integration
//!     .start(RunConfig::new(42, "R1").with_wafer("W07").with_operator("jdoe"))
//!     .await?;
//! println!("run {run_id}");
//!
//! for (i, current) in [10.0, 20.0, 30.0].into_iter().enumerate() {
//!     let reading = Measurement::from_test_data("Laser_1", current, current - 0.1, 1.7, Some(2.5), None);
//!     integration.add_measurement(reading, Some(DiePosition::new(i as i32, 0)))?;
//! }
//!
//! let summary = integration.finish(true).await?;
//! println!("{} of {} uploaded", summary.upload_stats.successful, summary.upload_stats.total);
//!
//! integration.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Retry behaviour
//!
//! HTTP 413, 429, 500, 502, 503 and 504 and connection-level errors are
//! retried; the n-th retry waits `min_wait * multiplier^(n-1)` (15s, 30s,
//! 60s, 120s with the defaults). Any other status at or above 400 fails the
//! job immediately. Failed jobs are never retried automatically; call
//! [`LaserMaskHubIntegration::retry_failed`] between runs.
//!
//! ## Local-only mode
//!
//! Without credentials, or when a run cannot be registered, the integration
//! keeps working: measurements are recorded and raw data is written under
//! `laser_data/<run_id>/`, but nothing is uploaded and
//! `get_statistics().service_available` is `false`.
//!
//! ## Configuration
//!
//! See [`config`] for the environment variables and config file locations.

pub mod client;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod prelude;
pub mod queue;
pub mod retry;
pub mod security;
pub mod session;
pub mod storage;
pub mod transport;
pub mod types;
pub mod worker;

pub use client::MaskHubClient;
pub use config::{MaskHubConfig, MaskHubConfigManager, MaskHubCredentials, MaskHubSettings};
pub use error::{MaskHubError, MaskHubResult};
pub use ledger::{FailedUpload, FailedUploadRecord, UploadLedger, UploadStats};
pub use retry::{Classification, RetryPolicy, UploadOutcome};
pub use session::{
    IntegrationOptions, LaserMaskHubIntegration, RetrySummary, RunSummary, ServiceState,
    StatisticsSnapshot,
};
pub use transport::{MaskHubApi, TransportResponse, UploadTransport};
pub use types::{DiePosition, Measurement, RunConfig, RunMetadata, UploadJob};
