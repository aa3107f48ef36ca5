//! Integration tests for the HTTP surface
//!
//! A real listener is bound on an ephemeral port; stages are shell scripts.

#![cfg(unix)]

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use common::{boot_image, card_inventory, orchestrator, ScriptLauncher, TestEnv, FAKE_DEVICE};
use flashpipe::core::orchestrator::StageLauncher;
use flashpipe::core::pipeline::Stage;
use flashpipe::server::{self, AppState};
use serde_json::{json, Value};
use tokio::net::TcpListener;

const HALF_STAGE: &str = r#"echo '{"type":"progress","message":"half way","percent":50}'
echo '{"success":true,"message":"ok"}'"#;

struct TestServer {
    addr: SocketAddr,
    env: TestEnv,
    client: reqwest::Client,
}

impl TestServer {
    async fn start(launcher: Arc<dyn StageLauncher>) -> Self {
        let env = TestEnv::new();
        let state = AppState::new(orchestrator(&env, launcher), Arc::new(card_inventory()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server::serve(listener, state));
        Self {
            addr,
            env,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn image(&self) -> String {
        self.env
            .create_file("os.img", &boot_image(2048))
            .display()
            .to_string()
    }

    async fn flash(&self, body: Value) -> reqwest::Response {
        self.client
            .post(self.url("/api/flash"))
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

/// JSON payloads of every `data:` line in a push-event body
fn frames(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .map(|d| serde_json::from_str(d.trim()).unwrap())
        .collect()
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::start(Arc::new(ScriptLauncher::new(&[]))).await;
    let resp = server
        .client
        .get(server.url("/api/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_devices_lists_inventory() {
    let server = TestServer::start(Arc::new(ScriptLauncher::new(&[]))).await;
    let body: Value = server
        .client
        .get(server.url("/api/devices"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body[0]["identifier"], FAKE_DEVICE);
    assert_eq!(body[0]["removable"], true);
}

#[tokio::test]
async fn test_empty_device_is_bad_request() {
    let launcher = Arc::new(ScriptLauncher::new(&[]));
    let server = TestServer::start(launcher.clone()).await;

    let resp = server
        .flash(json!({"device": " ", "image": server.image()}))
        .await;

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(launcher.spawn_count(), 0);
}

#[tokio::test]
async fn test_flash_without_stream_returns_terminal_object() {
    let server = TestServer::start(Arc::new(ScriptLauncher::new(&[]))).await;

    let resp = server
        .flash(json!({"device": FAKE_DEVICE, "image": server.image(), "stream": false}))
        .await;

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert!(body["run_id"].is_string());
}

#[tokio::test]
async fn test_flash_stream_emits_frames_until_terminal() {
    let server = TestServer::start(Arc::new(ScriptLauncher::new(&[
        (Stage::Formatting, HALF_STAGE),
        (Stage::Writing, HALF_STAGE),
    ])))
    .await;

    let resp = server
        .flash(json!({"device": FAKE_DEVICE, "image": server.image(), "stream": true}))
        .await;

    assert_eq!(resp.status(), 200);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"), "{content_type}");

    let events = frames(&resp.text().await.unwrap());
    let last = events.last().unwrap();
    assert_eq!(last["success"], true);

    let percents: Vec<f64> = events
        .iter()
        .filter_map(|e| e["percent"].as_f64())
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
    assert_eq!(percents.last(), Some(&100.0));
    assert!(events.iter().any(|e| e["stage"] == "writing"));
}

#[tokio::test]
async fn test_invalid_identifier_streams_single_failure() {
    let launcher = Arc::new(ScriptLauncher::new(&[]));
    let server = TestServer::start(launcher.clone()).await;

    let resp = server
        .flash(json!({"device": "/dev/sdb1", "image": server.image(), "stream": true}))
        .await;

    let events = frames(&resp.text().await.unwrap());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["success"], false);
    assert_eq!(events[0]["kind"], "ValidationError");
    assert_eq!(launcher.spawn_count(), 0);
}

#[tokio::test]
async fn test_concurrent_run_on_same_device_is_conflict() {
    let server = TestServer::start(Arc::new(ScriptLauncher::new(&[(
        Stage::Formatting,
        "exec sleep 30",
    )])))
    .await;
    let image = server.image();

    let first = server
        .flash(json!({"device": FAKE_DEVICE, "image": image, "stream": true}))
        .await;
    assert_eq!(first.status(), 200);

    let second = server
        .flash(json!({"device": FAKE_DEVICE, "image": image, "stream": true}))
        .await;
    assert_eq!(second.status(), 409);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["kind"], "ConflictError");

    drop(first);
}
