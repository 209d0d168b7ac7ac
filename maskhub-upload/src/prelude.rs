//! Prelude for commonly used types and traits in maskhub-upload.

pub use crate::config::{MaskHubConfig, MaskHubConfigManager};
pub use crate::error::{MaskHubError, MaskHubResult};
pub use crate::retry::RetryPolicy;
pub use crate::session::{IntegrationOptions, LaserMaskHubIntegration, RunSummary, StatisticsSnapshot};
pub use crate::transport::{MaskHubApi, UploadTransport};
pub use crate::types::{DiePosition, Measurement, RunConfig};
