use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument};

use crate::config::MaskHubConfig;
use crate::error::{MaskHubError, MaskHubResult};
use crate::logging::{truncate_field, MAX_LOGGED_BODY};
use crate::transport::{MaskHubApi, ResponseBody, TransportResponse, UploadTransport};
use crate::types::{RawDataFile, RunMetadata, UploadJob};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// HTTP client for the MaskHub REST API.
#[derive(Clone)]
pub struct MaskHubClient {
    config: Arc<MaskHubConfig>,
    client: Client,
}

impl MaskHubClient {
    /// Create a new client with the given configuration.
    pub fn new(config: MaskHubConfig) -> MaskHubResult<Self> {
        let mut token = HeaderValue::from_str(config.api_token().expose()).map_err(|_| {
            MaskHubError::Configuration {
                message: "API token contains characters not allowed in a header".to_string(),
            }
        })?;
        token.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static(API_KEY_HEADER), token);

        let client = Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| MaskHubError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &MaskHubConfig {
        &self.config
    }

    /// POST one measurement with its raw data file. Makes exactly one attempt.
    ///
    /// Error statuses come back as `Ok` so the caller can decide whether to
    /// retry; only a missing response is an `Err`.
    #[instrument(skip(self, job), fields(device = %job.device_name))]
    pub async fn upload_measurement(&self, job: &UploadJob) -> MaskHubResult<TransportResponse> {
        let url = format!("{}/measurements", self.config.api_v3_url());

        let raw_data = match &job.raw_data {
            RawDataFile::Path(path) => {
                let bytes = tokio::fs::read(path).await.map_err(|e| {
                    MaskHubError::storage(&format!("Failed to read {}", path.display()), e)
                })?;
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "raw_data.parquet".to_string());
                Part::bytes(bytes).file_name(file_name)
            }
            RawDataFile::Missing => Part::bytes(Vec::new()).file_name("no_data"),
        };

        let form = Form::new()
            .text("mask_id", job.mask_id.to_string())
            .text("run_name", job.run_name.clone())
            .text("lot_name", job.lot_name.clone())
            .text("wafer_name", job.wafer_name.clone())
            .text("die_x", job.die_x.to_string())
            .text("die_y", job.die_y.to_string())
            .text("device_name", job.device_name.clone())
            .text("type", job.measurement_type.clone())
            .text("test_station_name", job.test_station_name.clone())
            .text("test_meta", serde_json::to_string(&job.test_meta)?)
            .text("meta", serde_json::to_string(&job.extra_meta)?)
            .part("raw_data", raw_data);

        let response = send(
            self.client
                .post(&url)
                .header(IDEMPOTENCY_KEY_HEADER, job.idempotency_key.to_string())
                .multipart(form),
        )
        .await?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(network_error)?;
        debug!(status, body = %truncate_field(&body, MAX_LOGGED_BODY), "Measurement endpoint responded");
        Ok(TransportResponse::new(status, ResponseBody::parse(body)))
    }

    /// Register a run and return its id. An existing run (409) is accepted.
    #[instrument(skip(self, metadata), fields(run = %metadata.run_name))]
    pub async fn create_run(&self, metadata: &RunMetadata) -> MaskHubResult<i64> {
        let project_id = match metadata.project_id {
            Some(id) => id,
            None => self.get_mask_project_id(metadata.mask_id).await?,
        };

        let url = format!("{}/runs/", self.config.api_url());
        let response = send(self.client.post(&url).json(&metadata.to_payload(project_id))).await?;
        let body = self.handle_json(response, true).await?;
        let run_id = extract_id(&body, "run")?;

        info!(run_id, "Created MaskHub run");
        Ok(run_id)
    }

    /// Look up the project a mask belongs to.
    pub async fn get_mask_project_id(&self, mask_id: i64) -> MaskHubResult<i64> {
        let url = format!("{}/masks/{}", self.config.api_url(), mask_id);
        let response = send(self.client.get(&url)).await?;
        let body = self.handle_json(response, false).await?;
        body.get("project_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| MaskHubError::Serialization {
                message: format!("mask {mask_id} response has no project_id"),
            })
    }

    /// Start server-side die analysis for a finished run.
    pub async fn trigger_die_analysis(&self, run_name: &str) -> MaskHubResult<()> {
        let url = endpoint(
            self.config.api_url(),
            &["runs", run_name, "trigger_die_analysis"],
        )?;
        let response = send(self.client.post(url)).await?;

        if response.status().is_success() {
            info!(run = %run_name, "Triggered die analysis");
            Ok(())
        } else {
            self.handle_error_response(response).await
        }
    }

    /// Find a test station by name, creating it when none exists.
    pub async fn get_teststation_id(&self, name: &str) -> MaskHubResult<i64> {
        let url = format!("{}/teststations/", self.config.api_url());

        let response = send(self.client.get(&url).query(&[("name", name)])).await?;
        let found = self.handle_json(response, true).await?;
        match found.as_array().map(Vec::as_slice) {
            Some([station]) => return extract_id(station, "test station"),
            Some([]) | None => {}
            Some(stations) => {
                return Err(MaskHubError::InvalidRequest {
                    message: format!("{} test stations named '{}'", stations.len(), name),
                })
            }
        }

        info!(station = %name, "Test station not found, creating one");
        let response = send(self.client.post(&url).json(&json!({ "name": name }))).await?;
        let created = self.handle_json(response, true).await?;
        extract_id(&created, "test station")
    }

    /// Report test station status.
    pub async fn send_heartbeat(
        &self,
        teststation_id: i64,
        status: &str,
        code: &str,
        extra: Map<String, Value>,
    ) -> MaskHubResult<Value> {
        let url = format!("{}/heartbeats/", self.config.api_url());

        let mut heartbeat = extra;
        heartbeat.insert("teststation_id".into(), Value::from(teststation_id));
        heartbeat.insert("status".into(), Value::from(status));
        heartbeat.insert("code".into(), Value::from(code));

        let response = send(self.client.post(&url).json(&heartbeat)).await?;
        self.handle_json(response, true).await
    }

    /// Attach a file to a run.
    pub async fn post_attachment(
        &self,
        run_id: i64,
        path: &Path,
        name: Option<&str>,
    ) -> MaskHubResult<()> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| MaskHubError::storage(&format!("Failed to read {}", path.display()), e))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());

        let form = Form::new()
            .text("target_model_name", "run")
            .text("target_model_id", run_id.to_string())
            .text("name", name.map(str::to_string).unwrap_or_else(|| file_name.clone()))
            .part("files", Part::bytes(bytes).file_name(file_name.clone()));

        let url = format!("{}/attachments/", self.config.api_url());
        let response = send(self.client.post(&url).multipart(form)).await?;

        if response.status().is_success() {
            info!(file = %file_name, run_id, "Uploaded attachment");
            Ok(())
        } else {
            self.handle_error_response(response).await
        }
    }

    /// Parse a JSON body from a successful response (or a 409 when allowed).
    async fn handle_json(&self, response: Response, allow_conflict: bool) -> MaskHubResult<Value> {
        let status = response.status();
        if status.is_success() || (allow_conflict && status == StatusCode::CONFLICT) {
            let text = response.text().await.map_err(network_error)?;
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            Ok(serde_json::from_str(&text)?)
        } else {
            self.handle_error_response(response).await
        }
    }

    /// Convert an error response to a MaskHubError.
    async fn handle_error_response<T>(&self, response: Response) -> MaskHubResult<T> {
        let status = response.status().as_u16();
        let url = response.url().path().to_string();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());

        let body = response.text().await.unwrap_or_default();
        let message = TransportResponse::new(status, ResponseBody::parse(body)).error_message();
        error!(
            status,
            path = %url,
            "MaskHub request failed: {}",
            truncate_field(&message, MAX_LOGGED_BODY)
        );

        match status {
            401 | 403 => Err(MaskHubError::Authentication { message }),
            429 => Err(MaskHubError::RateLimited {
                retry_after_secs: retry_after,
            }),
            400 => Err(MaskHubError::InvalidRequest { message }),
            404 => Err(MaskHubError::NotFound { message }),
            status => Err(MaskHubError::ServerError { status, message }),
        }
    }
}

#[async_trait]
impl UploadTransport for MaskHubClient {
    async fn send(&self, job: &UploadJob) -> MaskHubResult<TransportResponse> {
        self.upload_measurement(job).await
    }
}

#[async_trait]
impl MaskHubApi for MaskHubClient {
    async fn create_run(&self, metadata: &RunMetadata) -> MaskHubResult<i64> {
        MaskHubClient::create_run(self, metadata).await
    }

    async fn trigger_die_analysis(&self, run_name: &str) -> MaskHubResult<()> {
        MaskHubClient::trigger_die_analysis(self, run_name).await
    }
}

async fn send(request: RequestBuilder) -> MaskHubResult<Response> {
    request.send().await.map_err(network_error)
}

/// Only failures on the wire are transient. A request that could not be
/// built (bad URL, invalid header) is a configuration error.
fn network_error(e: reqwest::Error) -> MaskHubError {
    if e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() {
        MaskHubError::Network {
            message: e.to_string(),
        }
    } else {
        MaskHubError::Configuration {
            message: format!("MaskHub request could not be sent: {e}"),
        }
    }
}

/// Append path segments to `base`, percent-encoding each one.
fn endpoint(base: &str, segments: &[&str]) -> MaskHubResult<Url> {
    let invalid = |detail: String| MaskHubError::Configuration {
        message: format!("Invalid MaskHub API URL {base:?}: {detail}"),
    };
    let mut url = Url::parse(base).map_err(|e| invalid(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|()| invalid("cannot have a path".to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn extract_id(body: &Value, what: &str) -> MaskHubResult<i64> {
    body.get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| MaskHubError::Serialization {
            message: format!("{what} response has no id"),
        })
}
