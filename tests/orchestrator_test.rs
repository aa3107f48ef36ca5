//! End-to-end tests for pipeline runs
//!
//! Stage children are the real `flashpipe stage` binary writing into a
//! temporary file that stands in for the card; only formatting is scripted.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    boot_image, collect, gzip, orchestrator, percents, progress_stages, RedirectLauncher,
    ScriptLauncher, TestEnv, FAKE_DEVICE,
};
use flashpipe::core::global_config::GlobalConfig;
use flashpipe::core::orchestrator::FlashRequest;
use flashpipe::core::pipeline::Stage;
use flashpipe::core::progress::PipelineEvent;
use flashpipe::error::{ErrorKind, PipelineError};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(image: &str) -> FlashRequest {
    FlashRequest {
        device: FAKE_DEVICE.to_string(),
        image: image.to_string(),
        ..FlashRequest::default()
    }
}

fn terminal(events: &[PipelineEvent]) -> &flashpipe::core::progress::TerminalEvent {
    match events.last() {
        Some(PipelineEvent::Finished(t)) => t,
        other => panic!("run did not end with a terminal event: {other:?}"),
    }
}

// ============================================
// Successful runs
// ============================================

#[tokio::test(flavor = "multi_thread")]
async fn test_remote_compressed_image_is_written() {
    let server = MockServer::start().await;
    let image = boot_image(96 * 1024);
    Mock::given(method("GET"))
        .and(path("/releases/os.img.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(gzip(&image)))
        .expect(1)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let launcher = Arc::new(RedirectLauncher {
        target: env.create_target("card.bin", 256 * 1024),
        config: env.write_config(&GlobalConfig::default()),
    });
    let orch = orchestrator(&env, launcher);

    let url = format!("{}/releases/os.img.gz", server.uri());
    let events = collect(orch.start(request(&url)).unwrap()).await;

    let end = terminal(&events);
    assert!(end.success, "run failed: {end:?}");
    assert!(end.run_id.is_some());

    let stages = progress_stages(&events);
    for stage in [
        Stage::Queued,
        Stage::Formatting,
        Stage::Downloading,
        Stage::Writing,
        Stage::Verifying,
        Stage::Done,
    ] {
        assert!(stages.contains(&stage), "missing {stage} in {stages:?}");
    }
    assert!(stages.windows(2).all(|w| w[0] <= w[1]));

    let overall = percents(&events);
    assert!(overall.windows(2).all(|w| w[0] <= w[1]), "{overall:?}");
    assert_eq!(overall.last(), Some(&100.0));

    assert_eq!(&env.read_file("card.bin")[..image.len()], image.as_slice());
    assert!(
        !env.path().join("runs").join(end.run_id.unwrap().to_string()).exists(),
        "per-run download directory was not removed"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_local_image_skips_download() {
    let env = TestEnv::new();
    let image = boot_image(16 * 1024);
    let image_path = env.create_file("os.img", &image);
    let launcher = Arc::new(RedirectLauncher {
        target: env.create_target("card.bin", 64 * 1024),
        config: env.write_config(&GlobalConfig::default()),
    });
    let orch = orchestrator(&env, launcher);

    let events = collect(orch.start(request(image_path.to_str().unwrap())).unwrap()).await;

    assert!(terminal(&events).success);
    assert!(!progress_stages(&events).contains(&Stage::Downloading));
    assert_eq!(&env.read_file("card.bin")[..image.len()], image.as_slice());
}

// ============================================
// Failures
// ============================================

#[tokio::test(flavor = "multi_thread")]
async fn test_download_that_keeps_dropping_never_reaches_writing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/os.img"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(boot_image(4096))
                .set_delay(Duration::from_secs(3)),
        )
        .expect(4)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let mut config = GlobalConfig::default();
    config.fetch.max_retries = Some(3);
    config.fetch.base_delay_ms = Some(10);
    config.fetch.timeout_secs = Some(1);
    config.fetch.connect_timeout_secs = Some(1);
    let launcher = Arc::new(RedirectLauncher {
        target: env.create_target("card.bin", 64 * 1024),
        config: env.write_config(&config),
    });
    let orch = orchestrator(&env, launcher);

    let url = format!("{}/os.img", server.uri());
    let events = collect(orch.start(request(&url)).unwrap()).await;

    let end = terminal(&events);
    assert!(!end.success);
    assert_eq!(end.kind, Some(ErrorKind::TransferError));
    assert_eq!(end.stage, Some(Stage::Downloading));
    assert!(!progress_stages(&events).contains(&Stage::Writing));
    assert!(env.read_file("card.bin").iter().all(|b| *b == 0));
}

#[tokio::test]
async fn test_second_run_on_same_device_conflicts() {
    let env = TestEnv::new();
    let image = env.create_file("os.img", &boot_image(1024));
    let launcher = Arc::new(ScriptLauncher::new(&[(Stage::Formatting, "exec sleep 30")]));
    let orch = orchestrator(&env, launcher);

    let first = orch.start(request(image.to_str().unwrap())).unwrap();
    match orch.start(request(image.to_str().unwrap())) {
        Err(PipelineError::Conflict { device }) => assert_eq!(device, FAKE_DEVICE),
        other => panic!("expected conflict, got {other:?}"),
    }
    drop(first);
}

// ============================================
// Cancellation
// ============================================

#[tokio::test]
async fn test_dropping_handle_stops_run_and_frees_device() {
    let env = TestEnv::new();
    let image = env.create_file("os.img", &boot_image(1024));
    let launcher = Arc::new(ScriptLauncher::new(&[(
        Stage::Formatting,
        r#"echo '{"type":"progress","message":"wiping","percent":10}'
exec sleep 30"#,
    )]));
    let orch = orchestrator(&env, launcher.clone());

    let mut handle = orch.start(request(image.to_str().unwrap())).unwrap();
    loop {
        match handle.next_event().await {
            Some(PipelineEvent::Progress(p)) if p.stage == Stage::Formatting => break,
            Some(_) => {}
            None => panic!("run ended before formatting started"),
        }
    }
    drop(handle);

    // The device is released once the child has been terminated
    let retry = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match orch.start(request(image.to_str().unwrap())) {
                Ok(handle) => return handle,
                Err(PipelineError::Conflict { .. }) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    })
    .await
    .expect("device was never released");
    retry.cancel();

    assert!(!launcher.stages.lock().unwrap().contains(&Stage::Writing));
}
