//! Bounded exponential-backoff retry.
//!
//! [`RetryPolicy::execute`] is transport-agnostic: it runs an async operation,
//! asks a classifier whether the result is a success, a transient failure or a
//! permanent failure, and sleeps between transient failures. The
//! upload-specific pieces ([`classify_upload`], [`send_with_retry`]) sit on top.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{is_retryable_status, MaskHubError, MaskHubResult};
use crate::transport::{TransportResponse, UploadTransport};
use crate::types::UploadJob;

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    Retryable,
    Permanent,
}

/// Result of running an operation under a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// The last result observed.
    pub result: Result<T, E>,
    /// Number of attempts made, at least 1.
    pub attempts: u32,
    /// Classification of the last result. `Retryable` here means attempts ran out.
    pub classification: Classification,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        self.classification == Classification::Success
    }

    pub fn exhausted(&self) -> bool {
        self.classification == Classification::Retryable
    }
}

/// Exponential backoff: the n-th retry waits `min_wait * multiplier^(n-1)`,
/// optionally capped at `max_wait` and widened by random jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    min_wait: Duration,
    multiplier: f64,
    max_wait: Option<Duration>,
    jitter: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5)
    }
}

impl RetryPolicy {
    /// Create a policy allowing `max_attempts` attempts in total (minimum 1).
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_wait: Duration::from_secs(15),
            multiplier: 2.0,
            max_wait: None,
            jitter: None,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    pub fn with_min_wait(mut self, min_wait: Duration) -> Self {
        self.min_wait = min_wait;
        self
    }

    /// Set the growth factor between consecutive delays. Values below 1 are clamped to 1.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Add up to `jitter` of random extra delay to every backoff.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay slept after the given failed attempt (1-based), before the next one.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.min_wait.as_secs_f64() * self.multiplier.powi(exponent);
        let mut delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        if let Some(max) = self.max_wait {
            delay = delay.min(max);
        }
        match self.jitter {
            Some(jitter) if !jitter.is_zero() => {
                let extra_ms = rand::rng().random_range(0..jitter.as_millis().max(1) as u64);
                delay.saturating_add(Duration::from_millis(extra_ms))
            }
            _ => delay,
        }
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out.
    ///
    /// The operation receives the 1-based attempt number.
    pub async fn execute<T, E, F, Fut, C>(&self, mut operation: F, classify: C) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&Result<T, E>) -> Classification,
    {
        let mut attempt = 1;
        loop {
            let result = operation(attempt).await;
            let classification = classify(&result);

            if classification == Classification::Retryable && attempt < self.max_attempts {
                let delay = self.delay_for(attempt);
                debug!(
                    attempt,
                    max_attempts = self.max_attempts,
                    delay_secs = delay.as_secs_f64(),
                    "Transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            return RetryOutcome {
                result,
                attempts: attempt,
                classification,
            };
        }
    }
}

/// Classify a single transport call.
///
/// Statuses below 400 succeed; 413, 429 and 5xx gateway/availability codes and
/// connection-level errors are transient; everything else is permanent.
pub fn classify_upload(result: &MaskHubResult<TransportResponse>) -> Classification {
    match result {
        Ok(response) if response.is_success() => Classification::Success,
        Ok(response) if is_retryable_status(response.status) => Classification::Retryable,
        Ok(_) => Classification::Permanent,
        Err(MaskHubError::Network { .. }) => Classification::Retryable,
        Err(_) => Classification::Permanent,
    }
}

/// Final, tagged result of uploading one job.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Uploaded {
        status: u16,
        measurement_id: Option<i64>,
        attempts: u32,
    },
    Failed {
        /// Last HTTP status, absent when the last attempt never got a response.
        status: Option<u16>,
        error: String,
        attempts: u32,
        /// True when every attempt failed transiently and the policy gave up.
        exhausted: bool,
    },
}

impl UploadOutcome {
    pub fn is_uploaded(&self) -> bool {
        matches!(self, UploadOutcome::Uploaded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            UploadOutcome::Uploaded { attempts, .. } | UploadOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Upload one job through `transport`, retrying transient failures per `policy`.
///
/// Never returns an error: exhaustion and permanent failures become
/// [`UploadOutcome::Failed`].
pub async fn send_with_retry<T>(transport: &T, policy: &RetryPolicy, job: &UploadJob) -> UploadOutcome
where
    T: UploadTransport + ?Sized,
{
    let outcome = policy
        .execute(
            |attempt| {
                debug!(device = %job.device_name, attempt, "Sending measurement");
                transport.send(job)
            },
            classify_upload,
        )
        .await;

    let attempts = outcome.attempts;
    let exhausted = outcome.exhausted();
    match outcome.result {
        Ok(response) if response.is_success() => UploadOutcome::Uploaded {
            status: response.status,
            measurement_id: response.measurement_id(),
            attempts,
        },
        Ok(response) => {
            warn!(
                device = %job.device_name,
                status = response.status,
                attempts,
                "Upload failed: {}",
                response.error_message()
            );
            UploadOutcome::Failed {
                status: Some(response.status),
                error: response.error_message(),
                attempts,
                exhausted,
            }
        }
        Err(e) => {
            warn!(device = %job.device_name, attempts, "Upload failed: {}", e);
            UploadOutcome::Failed {
                status: None,
                error: e.to_string(),
                attempts,
                exhausted,
            }
        }
    }
}
