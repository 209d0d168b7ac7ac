use thiserror::Error;

/// HTTP status codes that indicate a transient server or gateway condition.
pub const RETRYABLE_STATUS_CODES: [u16; 6] = [413, 429, 500, 502, 503, 504];

/// Status codes below this value are treated as success.
pub const SUPREMUM_GOOD_STATUS_CODE: u16 = 400;

/// Returns true if an HTTP status warrants an automatic retry.
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS_CODES.contains(&status)
}

/// Errors that can occur when talking to MaskHub or managing a run.
#[derive(Debug, Error)]
pub enum MaskHubError {
    /// Authentication failed (invalid or expired API token).
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// Network error (connection refused, reset, timeout).
    #[error("Network error: {message}")]
    Network { message: String },

    /// Rate limited by the server.
    #[error("Rate limited. Retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Server returned an error.
    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    /// Request validation failed.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// The requested resource does not exist.
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Serialization/deserialization error.
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Local file could not be read or written.
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// An operation that needs an active run was called without one.
    #[error("No active run. Call start() before {operation}")]
    NoActiveRun { operation: &'static str },

    /// `start()` was called while another run is still active.
    #[error("Run '{run_name}' is still active. Call finish() first")]
    RunAlreadyActive { run_name: String },
}

impl MaskHubError {
    /// Returns true if this error is transient and the operation should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            MaskHubError::Network { .. } => true,
            MaskHubError::RateLimited { .. } => true,
            MaskHubError::ServerError { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    /// Returns true for programming errors in how a run is driven.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            MaskHubError::NoActiveRun { .. } | MaskHubError::RunAlreadyActive { .. }
        )
    }

    /// Returns the suggested retry delay in seconds, if available.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            MaskHubError::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }

    pub(crate) fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        MaskHubError::Storage {
            message: format!("{context}: {err}"),
        }
    }
}

impl From<serde_json::Error> for MaskHubError {
    fn from(e: serde_json::Error) -> Self {
        MaskHubError::Serialization {
            message: e.to_string(),
        }
    }
}

/// Result type for MaskHub operations.
pub type MaskHubResult<T> = std::result::Result<T, MaskHubError>;
