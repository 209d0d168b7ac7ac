use async_trait::async_trait;
use serde_json::Value;

use crate::error::{MaskHubResult, SUPREMUM_GOOD_STATUS_CODE};
use crate::types::{RunMetadata, UploadJob};

/// Body of an HTTP response, parsed as JSON when possible.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
}

impl ResponseBody {
    /// Parse raw response text, falling back to plain text.
    pub fn parse(text: String) -> Self {
        match serde_json::from_str(&text) {
            Ok(value) => ResponseBody::Json(value),
            Err(_) => ResponseBody::Text(text),
        }
    }
}

/// One HTTP response from the measurement endpoint.
///
/// Error statuses are carried here rather than raised, so the retry layer can
/// inspect them.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: ResponseBody,
}

impl TransportResponse {
    pub fn new(status: u16, body: ResponseBody) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        self.status < SUPREMUM_GOOD_STATUS_CODE
    }

    /// The server-assigned measurement id, when the body carries one.
    pub fn measurement_id(&self) -> Option<i64> {
        match &self.body {
            ResponseBody::Json(value) => value.get("id").and_then(Value::as_i64),
            ResponseBody::Text(_) => None,
        }
    }

    /// Human-readable error detail: the JSON `message` field, or the raw text.
    pub fn error_message(&self) -> String {
        match &self.body {
            ResponseBody::Json(value) => value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string()),
            ResponseBody::Text(text) if text.is_empty() => format!("HTTP {}", self.status),
            ResponseBody::Text(text) => text.clone(),
        }
    }
}

/// Sends a single upload job. Implementations must not retry.
///
/// Returns `Ok` for every HTTP response, including error statuses, and
/// `Err(MaskHubError::Network)` when no response was obtained.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn send(&self, job: &UploadJob) -> MaskHubResult<TransportResponse>;
}

/// The remote operations a run session needs beyond measurement uploads.
#[async_trait]
pub trait MaskHubApi: UploadTransport {
    /// Register a run and return its server id.
    async fn create_run(&self, metadata: &RunMetadata) -> MaskHubResult<i64>;

    /// Ask the server to analyse every die measured in a run.
    async fn trigger_die_analysis(&self, run_name: &str) -> MaskHubResult<()>;
}
