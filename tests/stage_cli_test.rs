//! Integration tests for the `flashpipe stage` child-process entry points
//!
//! Each stage prints newline-delimited JSON on stdout, closes with one
//! terminal object and exits non-zero on failure.

#![cfg(unix)]

mod common;

use common::{boot_image, gzip, ndjson, run_flashpipe, TestEnv};
use flashpipe::core::global_config::GlobalConfig;
use serde_json::Value;

fn terminal(lines: &[Value]) -> &Value {
    let last = lines.last().expect("stage printed nothing");
    assert!(last.get("success").is_some(), "last line is not terminal: {last}");
    last
}

fn assert_progress_lines(lines: &[Value]) {
    for line in &lines[..lines.len() - 1] {
        assert_eq!(line["type"], "progress", "unexpected line {line}");
        assert!(line["message"].is_string());
        match &line["percent"] {
            Value::Null => {}
            Value::Number(n) => {
                let p = n.as_f64().unwrap();
                assert!((0.0..=100.0).contains(&p), "percent out of range: {p}");
            }
            other => panic!("bad percent {other}"),
        }
    }
}

// ============================================
// stage write
// ============================================

#[tokio::test]
async fn test_write_raw_image_to_file_target() {
    let env = TestEnv::new();
    let config = env.write_config(&GlobalConfig::default());
    let image = boot_image(10_000);
    let image_path = env.create_file("os.img", &image);
    let target = env.create_target("card.bin", 64 * 1024);

    let output = run_flashpipe(&[
        "--config",
        config.to_str().unwrap(),
        "stage",
        "write",
        "--image",
        image_path.to_str().unwrap(),
        "--device",
        target.to_str().unwrap(),
        "--assume-privileged",
        "--no-helper",
    ])
    .await;

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let lines = ndjson(&output.stdout);
    assert_progress_lines(&lines);
    let end = terminal(&lines);
    assert_eq!(end["success"], true);
    assert!(end["message"].as_str().unwrap().contains("direct"));

    let written = env.read_file("card.bin");
    assert_eq!(&written[..image.len()], image.as_slice());
    assert!(written[image.len()..].iter().all(|b| *b == 0));
}

#[tokio::test]
async fn test_write_gzip_image_decompresses_on_the_fly() {
    let env = TestEnv::new();
    let config = env.write_config(&GlobalConfig::default());
    let image = boot_image(32 * 1024);
    let image_path = env.create_file("os.img.gz", &gzip(&image));
    let target = env.create_target("card.bin", 128 * 1024);

    let output = run_flashpipe(&[
        "--config",
        config.to_str().unwrap(),
        "stage",
        "write",
        "--image",
        image_path.to_str().unwrap(),
        "--device",
        target.to_str().unwrap(),
        "--assume-privileged",
        "--no-helper",
    ])
    .await;

    assert!(output.status.success());
    let lines = ndjson(&output.stdout);
    assert_eq!(terminal(&lines)["success"], true);
    assert_eq!(&env.read_file("card.bin")[..image.len()], image.as_slice());
}

#[tokio::test]
async fn test_write_rejects_too_small_target_before_writing() {
    let env = TestEnv::new();
    let config = env.write_config(&GlobalConfig::default());
    let image_path = env.create_file("os.img", &boot_image(8192));
    let target = env.create_target("card.bin", 4096);

    let output = run_flashpipe(&[
        "--config",
        config.to_str().unwrap(),
        "stage",
        "write",
        "--image",
        image_path.to_str().unwrap(),
        "--device",
        target.to_str().unwrap(),
        "--assume-privileged",
        "--no-helper",
    ])
    .await;

    assert_eq!(output.status.code(), Some(1));
    let lines = ndjson(&output.stdout);
    let end = terminal(&lines);
    assert_eq!(end["success"], false);
    assert_eq!(end["kind"], "ValidationError");
    assert!(env.read_file("card.bin").iter().all(|b| *b == 0));
}

#[tokio::test]
async fn test_write_without_privilege_fails_with_remedy() {
    if nix::unistd::geteuid().is_root() {
        return;
    }
    let env = TestEnv::new();
    let config = env.write_config(&GlobalConfig::default());
    let image_path = env.create_file("os.img", &boot_image(1024));
    let target = env.create_target("card.bin", 4096);

    let output = run_flashpipe(&[
        "--config",
        config.to_str().unwrap(),
        "stage",
        "write",
        "--image",
        image_path.to_str().unwrap(),
        "--device",
        target.to_str().unwrap(),
        "--no-helper",
    ])
    .await;

    assert!(!output.status.success());
    let lines = ndjson(&output.stdout);
    let end = terminal(&lines);
    assert_eq!(end["kind"], "PrivilegeError");
    assert!(end["error"].as_str().unwrap().contains("sudo"));
    assert!(env.read_file("card.bin").iter().all(|b| *b == 0));
}

// ============================================
// stage verify
// ============================================

#[tokio::test]
async fn test_verify_accepts_written_target() {
    let env = TestEnv::new();
    let target = env.create_file("card.bin", &boot_image(4096));

    let output = run_flashpipe(&["stage", "verify", "--device", target.to_str().unwrap()]).await;

    assert!(output.status.success());
    let lines = ndjson(&output.stdout);
    assert_progress_lines(&lines);
    assert_eq!(terminal(&lines)["success"], true);
}

#[tokio::test]
async fn test_verify_rejects_blank_target() {
    let env = TestEnv::new();
    let target = env.create_target("card.bin", 4096);

    let output = run_flashpipe(&["stage", "verify", "--device", target.to_str().unwrap()]).await;

    assert_eq!(output.status.code(), Some(1));
    let lines = ndjson(&output.stdout);
    let end = terminal(&lines);
    assert_eq!(end["success"], false);
    assert_eq!(end["kind"], "DeviceError");
}

// ============================================
// stage format
// ============================================

#[tokio::test]
async fn test_format_rejects_partition_identifier() {
    let output = run_flashpipe(&["stage", "format", "--device", "/dev/sdb1"]).await;

    assert_eq!(output.status.code(), Some(1));
    let lines = ndjson(&output.stdout);
    assert_eq!(lines.len(), 1, "no progress before validation: {lines:?}");
    assert_eq!(lines[0]["kind"], "ValidationError");
}

// ============================================
// stage fetch
// ============================================

#[tokio::test]
async fn test_fetch_downloads_and_verifies_checksum() {
    use sha2::{Digest, Sha256};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    let body = boot_image(20_000);
    Mock::given(method("GET"))
        .and(path("/os.img"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let config = env.write_config(&GlobalConfig::default());
    let dest = env.path().join("downloads").join("os.img");
    let url = format!("{}/os.img", server.uri());
    let digest = hex::encode(Sha256::digest(&body));

    let output = run_flashpipe(&[
        "--config",
        config.to_str().unwrap(),
        "stage",
        "fetch",
        "--url",
        &url,
        "--dest",
        dest.to_str().unwrap(),
        "--sha256",
        &digest,
    ])
    .await;

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let lines = ndjson(&output.stdout);
    assert_progress_lines(&lines);
    assert_eq!(terminal(&lines)["success"], true);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn test_fetch_checksum_mismatch_fails() {
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not the image".to_vec()))
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let config = env.write_config(&GlobalConfig::default());
    let dest = env.path().join("os.img");

    let output = run_flashpipe(&[
        "--config",
        config.to_str().unwrap(),
        "stage",
        "fetch",
        "--url",
        &format!("{}/os.img", server.uri()),
        "--dest",
        dest.to_str().unwrap(),
        "--sha256",
        &"0".repeat(64),
    ])
    .await;

    assert!(!output.status.success());
    let lines = ndjson(&output.stdout);
    let end = terminal(&lines);
    assert_eq!(end["kind"], "TransferError");
    assert!(!dest.exists());
}
