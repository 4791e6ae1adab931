//! Integration tests for the control API

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use relayctl::admin::{AdminServer, AdminState};
use relayctl::config::{Config, ProcessConfig};
use relayctl::db::Database;
use relayctl::registration::{RegistrationClient, RegistrationService};
use relayctl::stats::StatsCollector;
use relayctl::supervisor::Supervisor;
use relayctl::synth::Synthesizer;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

struct TestApi {
    port: u16,
    state: Arc<AdminState>,
    shutdown_tx: watch::Sender<bool>,
    _dir: TempDir,
}

/// Start the control API on an ephemeral port with a relay binary that never starts
async fn start_api() -> TestApi {
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.process = ProcessConfig {
        binary: PathBuf::from("/nonexistent/relay-binary"),
        config_path: dir.path().join("relay.json"),
        monitor_interval_ms: 100,
        ..ProcessConfig::default()
    };
    // Nothing listens here; registration calls fail fast
    config.registration.base_url = "http://127.0.0.1:9".to_string();
    config.registration.retry.max_retries = 0;

    let db = Arc::new(Database::open_in_memory().unwrap());
    let synthesizer = Synthesizer::new(db.clone(), db.clone(), &config);
    let supervisor = Supervisor::new(Arc::new(synthesizer), config.process.clone());
    let stats = Arc::new(StatsCollector::new(Arc::clone(&supervisor), Duration::from_secs(1)));
    let client = RegistrationClient::new(&config.registration).unwrap();
    let registration = Arc::new(RegistrationService::new(client, db.clone(), &config.registration));

    let state = Arc::new(AdminState {
        supervisor,
        stats,
        registration,
        db,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = AdminServer::new(listener.local_addr().unwrap(), Arc::clone(&state), shutdown_rx);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestApi {
        port,
        state,
        shutdown_tx,
        _dir: dir,
    }
}

/// Send a raw HTTP/1.1 request and return the full response text
async fn http_request(port: u16, method: &str, path: &str, body: Option<&str>) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();

    let body = body.unwrap_or("");
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        port,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn body_json(response: &str) -> serde_json::Value {
    let body = response.split("\r\n\r\n").nth(1).unwrap_or("");
    serde_json::from_str(body).unwrap()
}

#[tokio::test]
async fn test_health_and_version() {
    let api = start_api().await;

    let response = http_request(api.port, "GET", "/health", None).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("ok"));

    let response = http_request(api.port, "GET", "/version", None).await;
    let json = body_json(&response);
    assert_eq!(json["name"], "relayctl");
    assert_eq!(json["relay_version"], "Unknown");
}

#[tokio::test]
async fn test_status_of_idle_supervisor() {
    let api = start_api().await;

    let response = http_request(api.port, "GET", "/status", None).await;

    assert!(response.starts_with("HTTP/1.1 200"));
    let json = body_json(&response);
    assert_eq!(json["state"], "stopped");
    assert_eq!(json["running"], false);
}

#[tokio::test]
async fn test_stop_when_not_running() {
    let api = start_api().await;

    let response = http_request(api.port, "POST", "/stop", None).await;

    assert!(response.starts_with("HTTP/1.1 409"));
    assert_eq!(body_json(&response)["code"], "NOT_RUNNING");
}

#[tokio::test]
async fn test_restart_failure_reports_crash() {
    let api = start_api().await;

    let response = http_request(api.port, "POST", "/restart?force=true", None).await;
    assert!(response.starts_with("HTTP/1.1 503"));
    assert_eq!(body_json(&response)["code"], "START_FAILED");

    let json = body_json(&http_request(api.port, "GET", "/status", None).await);
    assert_eq!(json["state"], "crashed");
    assert_eq!(json["last_error"]["kind"], "start_failed");
}

#[tokio::test]
async fn test_dirty_marks_restart_flag() {
    let api = start_api().await;
    assert!(!api.state.supervisor.restart_flag().is_dirty());

    let response = http_request(api.port, "POST", "/dirty", None).await;

    assert!(response.starts_with("HTTP/1.1 202"));
    assert!(api.state.supervisor.restart_flag().consume_if_dirty());
    assert!(!api.state.supervisor.restart_flag().consume_if_dirty());
}

#[tokio::test]
async fn test_traffic_requires_running_relay() {
    let api = start_api().await;

    let response = http_request(api.port, "GET", "/traffic", None).await;

    assert!(response.starts_with("HTTP/1.1 409"));
}

#[tokio::test]
async fn test_registration_routes() {
    let api = start_api().await;

    let response = http_request(api.port, "PUT", "/registration/license", Some(r#"{"license": "lic-2"}"#)).await;
    assert!(response.starts_with("HTTP/1.1 412"));
    assert_eq!(body_json(&response)["code"], "MISSING_CREDENTIAL");

    let response = http_request(api.port, "POST", "/registration", Some("{not json")).await;
    assert!(response.starts_with("HTTP/1.1 400"));

    let response = http_request(
        api.port,
        "POST",
        "/registration",
        Some(r#"{"secret_key": "short", "public_key": "short"}"#),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 400"));
    assert!(!api.state.supervisor.restart_flag().is_dirty());
}

#[tokio::test]
async fn test_outbound_traffic_routes() {
    let api = start_api().await;

    let response = http_request(api.port, "GET", "/outbounds/traffic", None).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(body_json(&response), serde_json::json!([]));

    let response = http_request(api.port, "POST", "/outbounds/traffic/reset", Some(r#"{"tag": "-alltags-"}"#)).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(body_json(&response)["reset"], 0);
}

#[tokio::test]
async fn test_unknown_route() {
    let api = start_api().await;

    let response = http_request(api.port, "GET", "/nope", None).await;

    assert!(response.starts_with("HTTP/1.1 404"));
    assert_eq!(body_json(&response)["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let api = start_api().await;
    api.shutdown_tx.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let connected = tokio::time::timeout(
        Duration::from_millis(500),
        TcpStream::connect(format!("127.0.0.1:{}", api.port)),
    )
    .await;

    assert!(!matches!(connected, Ok(Ok(_))));
}
