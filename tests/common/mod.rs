//! Common test utilities and helpers
//!
//! This module provides shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flate2::write::GzEncoder;
use tempfile::TempDir;
use tokio::process::Command;

use flashpipe::core::device::{DeviceInfo, Platform, StaticInventory};
use flashpipe::core::global_config::GlobalConfig;
use flashpipe::core::locator::Locator;
use flashpipe::core::orchestrator::{Orchestrator, OrchestratorSettings, RunHandle, StageLauncher};
use flashpipe::core::pipeline::{Stage, StageRanges};
use flashpipe::core::progress::PipelineEvent;
use flashpipe::core::registry::InFlightDevices;
use flashpipe::infra::listing::HttpListingFetcher;

/// Identifier the tests pretend to image
pub const FAKE_DEVICE: &str = "/dev/sdb";

/// Scratch directory for one test
pub struct TestEnv {
    pub dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Write `bytes` to `name` and return its path
    pub fn create_file(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directories");
        }
        std::fs::write(&path, bytes).expect("Failed to write file");
        path
    }

    /// A zero-filled file standing in for a block device
    pub fn create_target(&self, name: &str, len: usize) -> PathBuf {
        self.create_file(name, &vec![0u8; len])
    }

    /// Write a configuration file and return its path
    pub fn write_config(&self, config: &GlobalConfig) -> PathBuf {
        let path = self.dir.path().join("config.toml");
        config.save_to_path(&path).expect("Failed to write config");
        path
    }

    pub fn read_file(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.dir.path().join(name)).expect("Failed to read file")
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the flashpipe binary and collect its output
pub async fn run_flashpipe(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_flashpipe"))
        .args(args)
        .env_remove("FLASHPIPE_CONFIG")
        .env_remove("RUST_LOG")
        .output()
        .await
        .expect("Failed to execute flashpipe")
}

/// Parse newline-delimited JSON from a stage child's stdout
pub fn ndjson(stdout: &[u8]) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap_or_else(|e| panic!("bad line {l:?}: {e}")))
        .collect()
}

/// A disk image with a boot signature and a recognizable payload
pub fn boot_image(len: usize) -> Vec<u8> {
    let mut data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    data[510] = 0x55;
    data[511] = 0xAA;
    data
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

/// Minimal directory-listing page
pub fn listing_html(entries: &[&str]) -> String {
    let anchors: String = entries
        .iter()
        .map(|e| format!("<a href=\"{e}\">{e}</a>\n"))
        .collect();
    format!("<html><body><a href=\"../\">../</a>\n{anchors}</body></html>")
}

/// Runs one shell snippet per stage; unscripted stages succeed silently
pub struct ScriptLauncher {
    scripts: HashMap<Stage, String>,
    pub spawned: AtomicUsize,
    pub stages: Mutex<Vec<Stage>>,
}

impl ScriptLauncher {
    pub fn new(scripts: &[(Stage, &str)]) -> Self {
        Self {
            scripts: scripts.iter().map(|(s, b)| (*s, (*b).to_string())).collect(),
            spawned: AtomicUsize::new(0),
            stages: Mutex::new(Vec::new()),
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl StageLauncher for ScriptLauncher {
    fn command(&self, stage: Stage, _args: &[String]) -> Command {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        self.stages.lock().unwrap().push(stage);
        let script = self
            .scripts
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| r#"echo '{"success":true}'"#.to_string());
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        cmd
    }
}

/// Runs the real stage children against a file standing in for the device
///
/// Formatting is replaced by a no-op script since it needs real disk tools.
pub struct RedirectLauncher {
    pub target: PathBuf,
    pub config: PathBuf,
}

impl StageLauncher for RedirectLauncher {
    fn command(&self, stage: Stage, args: &[String]) -> Command {
        if stage == Stage::Formatting {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg(
                r#"echo '{"type":"progress","message":"Partition table cleared","percent":40}'
echo '{"success":true,"message":"Formatted"}'"#,
            );
            return cmd;
        }

        let target = self.target.display().to_string();
        let mut args: Vec<String> = args
            .iter()
            .map(|a| if a == FAKE_DEVICE { target.clone() } else { a.clone() })
            .collect();
        if stage == Stage::Writing {
            args.extend(["--assume-privileged".to_string(), "--no-helper".to_string()]);
        }

        let mut cmd = Command::new(env!("CARGO_BIN_EXE_flashpipe"));
        cmd.arg("--config")
            .arg(&self.config)
            .arg("stage")
            .args(args)
            .env_remove("RUST_LOG");
        cmd
    }
}

/// Orchestrator settings rooted in `work_dir`
pub fn test_settings(work_dir: &Path) -> OrchestratorSettings {
    OrchestratorSettings {
        platform: Platform::Linux,
        max_run: Duration::from_secs(60),
        cancel_grace: Duration::from_millis(200),
        channel_capacity: 8,
        max_device_bytes: 1 << 40,
        ranges: StageRanges::default(),
        work_dir: work_dir.to_path_buf(),
    }
}

/// Inventory holding one removable 8 GiB card at [`FAKE_DEVICE`]
pub fn card_inventory() -> StaticInventory {
    StaticInventory::new(vec![DeviceInfo::new(FAKE_DEVICE, 8 << 30, true, Vec::new())])
}

/// Orchestrator with the real locator and a fresh registry
pub fn orchestrator(env: &TestEnv, launcher: Arc<dyn StageLauncher>) -> Orchestrator {
    let locator = Locator::new(HttpListingFetcher::new(
        Duration::from_secs(5),
        Duration::from_secs(5),
    ));
    Orchestrator::new(
        launcher,
        Arc::new(InFlightDevices::new()),
        Arc::new(card_inventory()),
        Arc::new(locator),
        test_settings(&env.path().join("runs")),
    )
}

/// Drain a run's events
pub async fn collect(mut handle: RunHandle) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    events
}

/// Stages of the progress events, in order
pub fn progress_stages(events: &[PipelineEvent]) -> Vec<Stage> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Progress(p) => Some(p.stage),
            PipelineEvent::Finished(_) => None,
        })
        .collect()
}

/// Known overall percents, in order
pub fn percents(events: &[PipelineEvent]) -> Vec<f64> {
    events.iter().filter_map(PipelineEvent::percent).collect()
}
