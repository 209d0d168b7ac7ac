//! Local persistence for raw measurement data and failed uploads.

use std::fs::File;
use std::path::{Path, PathBuf};

use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Local};
use parquet::arrow::ArrowWriter;
use tracing::{debug, info, instrument};

use crate::error::{MaskHubError, MaskHubResult};
use crate::ledger::{FailedUpload, FailedUploadRecord};

pub const DEFAULT_DATA_DIR: &str = "laser_data";

/// Writes run data under a base directory.
///
/// Raw tables land in `<data_dir>/<run_id>/<device>_<timestamp>.parquet`;
/// failed-upload reports in `<failed_dir>/failed_uploads_<timestamp>.json`.
#[derive(Debug, Clone)]
pub struct LocalStore {
    data_dir: PathBuf,
    failed_dir: PathBuf,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_DIR, ".")
    }
}

impl LocalStore {
    /// Directories are created lazily on first write.
    pub fn new(data_dir: impl Into<PathBuf>, failed_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            failed_dir: failed_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn failed_dir(&self) -> &Path {
        &self.failed_dir
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.data_dir.join(sanitize_component(run_id))
    }

    /// Path a raw table for `device_id` taken at `timestamp` is written to.
    pub fn raw_data_path(&self, run_id: &str, device_id: &str, timestamp: &DateTime<Local>) -> PathBuf {
        self.run_dir(run_id).join(format!(
            "{}_{}.parquet",
            sanitize_component(device_id),
            timestamp.format("%Y%m%d_%H%M%S_%3f")
        ))
    }

    /// Write a raw data table as parquet and return its path.
    #[instrument(skip(self, batch), fields(rows = batch.num_rows()))]
    pub fn save_raw_data(
        &self,
        run_id: &str,
        device_id: &str,
        timestamp: &DateTime<Local>,
        batch: &RecordBatch,
    ) -> MaskHubResult<PathBuf> {
        let dir = self.run_dir(run_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| MaskHubError::storage("Failed to create run directory", e))?;

        let path = self.raw_data_path(run_id, device_id, timestamp);
        let file = File::create(&path)
            .map_err(|e| MaskHubError::storage(&format!("Failed to create {}", path.display()), e))?;

        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
            .map_err(|e| MaskHubError::storage("Failed to open parquet writer", e))?;
        writer
            .write(batch)
            .map_err(|e| MaskHubError::storage("Failed to write raw data", e))?;
        writer
            .close()
            .map_err(|e| MaskHubError::storage("Failed to finalize parquet file", e))?;

        debug!(path = %path.display(), "Saved raw data");
        Ok(path)
    }

    /// Write failed uploads as a JSON array.
    ///
    /// Returns `None` without touching the filesystem when there is nothing
    /// to save. Without an explicit `path` a timestamped file is created in
    /// the failed-uploads directory.
    pub fn save_failed_uploads(
        &self,
        failures: &[FailedUpload],
        path: Option<&Path>,
    ) -> MaskHubResult<Option<PathBuf>> {
        if failures.is_empty() {
            return Ok(None);
        }

        let path = match path {
            Some(p) => p.to_path_buf(),
            None => self.failed_dir.join(format!(
                "failed_uploads_{}.json",
                Local::now().format("%Y%m%d_%H%M%S")
            )),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| MaskHubError::storage("Failed to create failed-uploads directory", e))?;
        }

        let records: Vec<FailedUploadRecord> = failures.iter().map(FailedUpload::to_record).collect();
        let json = serde_json::to_string_pretty(&records)?;
        std::fs::write(&path, json)
            .map_err(|e| MaskHubError::storage(&format!("Failed to write {}", path.display()), e))?;

        info!(path = %path.display(), count = records.len(), "Saved failed uploads");
        Ok(Some(path))
    }
}

/// Read a failed-uploads file written by [`LocalStore::save_failed_uploads`].
pub fn load_failed_uploads(path: &Path) -> MaskHubResult<Vec<FailedUploadRecord>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| MaskHubError::storage(&format!("Failed to read {}", path.display()), e))?;
    Ok(serde_json::from_str(&raw)?)
}

/// Replace characters that would escape or break a single path component.
fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        _ => cleaned,
    }
}
