//! HTTP-level tests for `MaskHubClient` against a mock server.

use std::time::Duration;

use maskhub_upload::retry::{classify_upload, send_with_retry};
use maskhub_upload::types::{DiePosition, RawDataFile};
use maskhub_upload::{
    Classification, MaskHubClient, MaskHubConfig, MaskHubCredentials, MaskHubError, Measurement,
    RetryPolicy, RunConfig, RunMetadata, UploadJob, UploadOutcome, UploadTransport,
};
use mockito::Matcher;
use serde_json::json;

fn client_for(base: &str) -> MaskHubClient {
    let credentials =
        MaskHubCredentials::new(format!("{base}/api"), format!("{base}/v3"), "secret-token");
    MaskHubClient::new(MaskHubConfig::new(credentials).with_timeout(Duration::from_secs(5)))
        .unwrap()
}

fn job() -> UploadJob {
    let run = RunConfig::new(42, "R1").with_wafer("W07");
    let measurement = Measurement::new("L1", 25.0, 24.9, 1.7).with_metadata("sweep", "linear");
    UploadJob::new(&run, &measurement, DiePosition::new(2, 3), RawDataFile::Missing)
}

#[tokio::test]
async fn test_upload_sends_multipart_with_headers() {
    let mut server = mockito::Server::new_async().await;
    let job = job();

    let mock = server
        .mock("POST", "/v3/measurements")
        .match_header("x-api-key", "secret-token")
        .match_header("idempotency-key", job.idempotency_key.to_string().as_str())
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#"name="device_name"\s+L1"#.to_string()),
            Matcher::Regex(r#"name="die_x"\s+2"#.to_string()),
            Matcher::Regex(r#"name="wafer_name"\s+W07"#.to_string()),
            Matcher::Regex(r#"name="type"\s+laser_characterization"#.to_string()),
            Matcher::Regex(r#"name="raw_data""#.to_string()),
        ]))
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": 99}"#)
        .create_async()
        .await;

    let client = client_for(&server.url());
    let response = client.send(&job).await.unwrap();

    assert_eq!(response.status, 201);
    assert!(response.is_success());
    assert_eq!(response.measurement_id(), Some(99));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_error_status_is_returned_not_raised() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/v3/measurements")
        .with_status(503)
        .with_body("Service Unavailable")
        .create_async()
        .await;

    let client = client_for(&server.url());
    let result = client.upload_measurement(&job()).await;

    let response = result.unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(response.error_message(), "Service Unavailable");
    assert_eq!(classify_upload(&Ok(response)), Classification::Retryable);
}

#[tokio::test]
async fn test_connection_refused_is_a_network_error() {
    let client = client_for("http://127.0.0.1:1");
    let result = client.upload_measurement(&job()).await;

    assert!(matches!(result, Err(MaskHubError::Network { .. })));
    assert_eq!(classify_upload(&result), Classification::Retryable);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_url_fails_without_retrying() {
    let client = MaskHubClient::new(MaskHubConfig::new(MaskHubCredentials::new(
        "not a url",
        "not a url",
        "secret-token",
    )))
    .unwrap();

    let result = client.upload_measurement(&job()).await;
    assert!(matches!(result, Err(MaskHubError::Configuration { .. })));
    assert_eq!(classify_upload(&result), Classification::Permanent);

    let outcome = send_with_retry(&client, &RetryPolicy::default(), &job()).await;
    assert_eq!(outcome.attempts(), 1);
    assert!(!outcome.is_uploaded());
}

#[tokio::test]
async fn test_missing_raw_data_file_is_permanent() {
    let client = client_for("http://127.0.0.1:1");
    let mut job = job();
    job.raw_data = RawDataFile::Path("does/not/exist.parquet".into());

    let result = client.upload_measurement(&job).await;
    assert!(matches!(result, Err(MaskHubError::Storage { .. })));
    assert_eq!(classify_upload(&result), Classification::Permanent);
}

#[tokio::test]
async fn test_retry_exhaustion_against_server() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v3/measurements")
        .with_status(502)
        .with_body(r#"{"message": "bad gateway"}"#)
        .expect(3)
        .create_async()
        .await;

    let client = client_for(&server.url());
    let policy = RetryPolicy::new(3).with_min_wait(Duration::from_millis(10));
    let outcome = send_with_retry(&client, &policy, &job()).await;

    assert_eq!(
        outcome,
        UploadOutcome::Failed {
            status: Some(502),
            error: "bad gateway".to_string(),
            attempts: 3,
            exhausted: true,
        }
    );
    mock.assert_async().await;
}

#[tokio::test]
async fn test_create_run_looks_up_project() {
    let mut server = mockito::Server::new_async().await;
    let mask = server
        .mock("GET", "/api/masks/42")
        .with_status(200)
        .with_body(r#"{"id": 42, "project_id": 5}"#)
        .create_async()
        .await;
    let run = server
        .mock("POST", "/api/runs/")
        .match_body(Matcher::PartialJson(json!({
            "name": "R1",
            "project_id": 5,
            "test_software_name": "thorlabs_laser_control",
            "expected_measurement_count": 6
        })))
        .with_status(201)
        .with_body(r#"{"id": 314}"#)
        .create_async()
        .await;

    let client = client_for(&server.url());
    let metadata =
        RunMetadata::from_run_config(&RunConfig::new(42, "R1").with_expected_measurements(6));
    let run_id = client.create_run(&metadata).await.unwrap();

    assert_eq!(run_id, 314);
    mask.assert_async().await;
    run.assert_async().await;
}

#[tokio::test]
async fn test_create_run_accepts_existing_run() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/runs/")
        .with_status(409)
        .with_body(r#"{"id": 12, "detail": "run already exists"}"#)
        .create_async()
        .await;

    let client = client_for(&server.url());
    let metadata = RunMetadata::from_run_config(&RunConfig::new(42, "R1").with_project_id(5));
    assert_eq!(client.create_run(&metadata).await.unwrap(), 12);
}

#[tokio::test]
async fn test_create_run_bad_token() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/runs/")
        .with_status(401)
        .with_body(r#"{"message": "invalid API key"}"#)
        .create_async()
        .await;

    let client = client_for(&server.url());
    let metadata = RunMetadata::from_run_config(&RunConfig::new(42, "R1").with_project_id(5));
    match client.create_run(&metadata).await {
        Err(MaskHubError::Authentication { message }) => assert_eq!(message, "invalid API key"),
        other => panic!("expected authentication error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_trigger_die_analysis_errors() {
    let mut server = mockito::Server::new_async().await;
    let _missing = server
        .mock("POST", "/api/runs/R404/trigger_die_analysis")
        .with_status(404)
        .create_async()
        .await;
    let _limited = server
        .mock("POST", "/api/runs/R429/trigger_die_analysis")
        .with_status(429)
        .with_header("Retry-After", "30")
        .create_async()
        .await;
    let _ok = server
        .mock("POST", "/api/runs/R1/trigger_die_analysis")
        .with_status(200)
        .create_async()
        .await;

    let client = client_for(&server.url());
    assert!(client.trigger_die_analysis("R1").await.is_ok());
    assert!(matches!(
        client.trigger_die_analysis("R404").await,
        Err(MaskHubError::NotFound { .. })
    ));

    let limited = client.trigger_die_analysis("R429").await.unwrap_err();
    assert!(limited.is_retryable());
    assert_eq!(limited.retry_after(), Some(30));
}

#[tokio::test]
async fn test_trigger_die_analysis_escapes_run_name() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/runs/R1%2FA%3Fb%23c/trigger_die_analysis")
        .with_status(200)
        .create_async()
        .await;

    let client = client_for(&server.url());
    client.trigger_die_analysis("R1/A?b#c").await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn test_teststation_lookup_creates_missing_station() {
    let mut server = mockito::Server::new_async().await;
    let lookup = server
        .mock("GET", Matcher::Regex("^/api/teststations/".to_string()))
        .match_query(Matcher::UrlEncoded("name".into(), "Bench A".into()))
        .with_status(200)
        .with_body("[]")
        .create_async()
        .await;
    let create = server
        .mock("POST", "/api/teststations/")
        .match_body(Matcher::Json(json!({"name": "Bench A"})))
        .with_status(201)
        .with_body(r#"{"id": 3}"#)
        .create_async()
        .await;

    let client = client_for(&server.url());
    assert_eq!(client.get_teststation_id("Bench A").await.unwrap(), 3);
    lookup.assert_async().await;
    create.assert_async().await;
}

#[tokio::test]
async fn test_teststation_lookup_rejects_duplicates() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", Matcher::Regex("^/api/teststations/".to_string()))
        .with_status(200)
        .with_body(r#"[{"id": 1}, {"id": 2}]"#)
        .create_async()
        .await;

    let client = client_for(&server.url());
    assert!(matches!(
        client.get_teststation_id("Bench A").await,
        Err(MaskHubError::InvalidRequest { .. })
    ));
}

#[tokio::test]
async fn test_heartbeat_payload() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/heartbeats/")
        .match_body(Matcher::Json(json!({
            "teststation_id": 3,
            "status": "running",
            "code": "OK",
            "temperature_c": 25.0
        })))
        .with_status(201)
        .with_body(r#"{"id": 1}"#)
        .create_async()
        .await;

    let client = client_for(&server.url());
    let mut extra = serde_json::Map::new();
    extra.insert("temperature_c".into(), json!(25.0));
    let body = client.send_heartbeat(3, "running", "OK", extra).await.unwrap();

    assert_eq!(body["id"], 1);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_post_attachment() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("sweep.csv");
    std::fs::write(&path, "current_ma,power_mw\n10,0.0\n").unwrap();

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/attachments/")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#"name="target_model_name"\s+run"#.to_string()),
            Matcher::Regex(r#"name="target_model_id"\s+314"#.to_string()),
            Matcher::Regex(r#"filename="sweep.csv""#.to_string()),
        ]))
        .with_status(201)
        .create_async()
        .await;

    let client = client_for(&server.url());
    client.post_attachment(314, &path, None).await.unwrap();
    mock.assert_async().await;
}
