use httpmock::prelude::*;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::broadcast;
use upload_classifier::{build_pipeline, config::Config, telemetry::Metrics, HttpServer};

const APPLE: &str = r#"{"predictions":[{"displayNames":["apple"],"confidences":[0.99]}],"deployedModelId":"1"}"#;
const PREDICT_PATH: &str = "/v1/projects/p/locations/us-central1/endpoints/e:predict";
const TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";

fn config_for(google: &MockServer) -> Config {
    let yaml = format!(
        r#"
log_level: debug
server:
  host: 127.0.0.1
  port: 0
prediction:
  project_id: p
  endpoint_id: e
  api_host: {base}
auth:
  strategy: metadata_service
  metadata_host: {base}
storage:
  base_url: {base}
retry:
  max_retries: 0
"#,
        base = google.base_url()
    );

    config::Config::builder()
        .add_source(config::File::from_str(&yaml, config::FileFormat::Yaml))
        .build()
        .unwrap()
        .try_deserialize()
        .unwrap()
}

async fn start(config: &Config) -> (SocketAddr, broadcast::Sender<()>) {
    let metrics = Arc::new(Metrics::new().unwrap());
    let pipeline = build_pipeline(config, metrics.clone()).unwrap();
    let server = HttpServer::new(Arc::new(pipeline), metrics, "127.0.0.1:0")
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    server.run(shutdown_rx).await.unwrap();

    (addr, shutdown_tx)
}

fn mock_token(google: &MockServer) {
    google.mock(|when, then| {
        when.method(GET)
            .path(TOKEN_PATH)
            .header("metadata-flavor", "Google");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"access_token":"tok","expires_in":3599,"token_type":"Bearer"}"#);
    });
}

fn mock_image(google: &MockServer) {
    google.mock(|when, then| {
        when.method(GET)
            .path_contains("/storage/v1/b/b/o/")
            .path_contains("img1.jpg")
            .query_param("alt", "media")
            .header("authorization", "Bearer tok");
        then.status(200).body(b"\xff\xd8\xff\xe0fake-jpeg");
    });
}

async fn post_event(addr: SocketAddr, body: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{}/", addr))
        .header("content-type", "application/json")
        .header("ce-id", "1234")
        .header("ce-specversion", "1.0")
        .header("ce-type", "google.cloud.storage.object.v1.finalized")
        .header("ce-source", "//storage.googleapis.com/projects/_/buckets/b")
        .body(body.to_string())
        .send()
        .await
        .unwrap()
}

const EVENT: &str = r#"{
    "bucket": "b",
    "name": "apples/img1.jpg",
    "metageneration": "1",
    "timeCreated": "2023-01-01T00:00:00.000Z",
    "updated": "2023-01-01T00:00:00.000Z"
}"#;

#[tokio::test]
async fn test_upload_event_is_classified() {
    let google = MockServer::start_async().await;
    mock_token(&google);
    mock_image(&google);
    let predict = google.mock(|when, then| {
        when.method(POST)
            .path(PREDICT_PATH)
            .header("authorization", "Bearer tok")
            .header("content-type", "application/json");
        then.status(200)
            .header("content-type", "application/json")
            .body(APPLE);
    });

    let (addr, shutdown) = start(&config_for(&google)).await;
    let response = post_event(addr, EVENT).await;

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["label"], "apple");
    assert_eq!(body["name"], "apples/img1.jpg");
    predict.assert();

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_forbidden_prediction_is_reported() {
    let google = MockServer::start_async().await;
    mock_token(&google);
    mock_image(&google);
    let predict = google.mock(|when, then| {
        when.method(POST).path(PREDICT_PATH);
        then.status(403)
            .body(r#"{"error":{"code":403,"status":"PERMISSION_DENIED"}}"#);
    });

    let (addr, shutdown) = start(&config_for(&google)).await;
    let response = post_event(addr, EVENT).await;

    assert_eq!(response.status(), 500);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["stage"], "invoking");
    assert!(body["error"].as_str().unwrap().contains("403"));
    predict.assert_hits(1);

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_malformed_event_is_rejected() {
    let google = MockServer::start_async().await;
    let anything = google.mock(|when, then| {
        when.any_request();
        then.status(500);
    });

    let (addr, shutdown) = start(&config_for(&google)).await;
    let response = post_event(addr, r#"{"bucket":"b"}"#).await;

    assert_eq!(response.status(), 400);
    anything.assert_hits(0);

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_health() {
    let google = MockServer::start_async().await;
    let (addr, shutdown) = start(&config_for(&google)).await;

    let body: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "Available");
    let _ = shutdown.send(());
}

async fn post_reclassify(addr: SocketAddr, body: serde_json::Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{}/reclassify", addr))
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_reclassify_reports_each_object() {
    let google = MockServer::start_async().await;
    mock_token(&google);
    let list = google.mock(|when, then| {
        when.method(GET)
            .path("/storage/v1/b/b/o")
            .query_param("prefix", "apples/")
            .header("authorization", "Bearer tok");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"items":[{"name":"apples/img1.jpg"},{"name":"apples/img2.jpg"}]}"#);
    });
    mock_image(&google);
    google.mock(|when, then| {
        when.method(GET).path_contains("img2.jpg");
        then.status(404).body("No such object");
    });
    let predict = google.mock(|when, then| {
        when.method(POST).path(PREDICT_PATH);
        then.status(200)
            .header("content-type", "application/json")
            .body(APPLE);
    });

    let (addr, shutdown) = start(&config_for(&google)).await;
    let response =
        post_reclassify(addr, serde_json::json!({"bucket": "b", "prefix": "apples/"})).await;

    assert_eq!(response.status(), 200);
    let items: Vec<serde_json::Value> = response.json().await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["name"], "apples/img1.jpg");
    assert_eq!(items[0]["label"], "apple");
    assert!(items[0].get("error").is_none());
    assert_eq!(items[1]["name"], "apples/img2.jpg");
    assert!(items[1].get("label").is_none());
    assert!(items[1]["error"].as_str().unwrap().contains("fetching"));
    list.assert();
    predict.assert_hits(1);

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_reclassify_list_failure_is_bad_gateway() {
    let google = MockServer::start_async().await;
    mock_token(&google);
    google.mock(|when, then| {
        when.method(GET).path("/storage/v1/b/b/o");
        then.status(403).body("Forbidden");
    });
    let predict = google.mock(|when, then| {
        when.method(POST).path(PREDICT_PATH);
        then.status(200).body(APPLE);
    });

    let (addr, shutdown) = start(&config_for(&google)).await;
    let response = post_reclassify(addr, serde_json::json!({"bucket": "b"})).await;

    assert_eq!(response.status(), 502);
    predict.assert_hits(0);

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_reclassify_requires_bucket() {
    let google = MockServer::start_async().await;
    let anything = google.mock(|when, then| {
        when.any_request();
        then.status(500);
    });

    let (addr, shutdown) = start(&config_for(&google)).await;
    let response = post_reclassify(addr, serde_json::json!({"bucket": ""})).await;

    assert_eq!(response.status(), 400);
    anything.assert_hits(0);

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_metrics_exposition() {
    let google = MockServer::start_async().await;
    let (addr, shutdown) = start(&config_for(&google)).await;
    post_reclassify(addr, serde_json::json!({"bucket": ""})).await;

    let response = reqwest::get(format!("http://{}/metrics", addr))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"));
    let body = response.text().await.unwrap();
    assert!(body.contains(r#"route="reclassify""#));

    let _ = shutdown.send(());
}
