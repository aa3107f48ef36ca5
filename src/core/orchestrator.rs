//! Pipeline orchestration and progress relay
//!
//! A run validates its target and resolves its image in-process, then
//! sequences the working stages as child processes:
//!
//! ```text
//! Queued -> Formatting -> Downloading (remote only) -> Writing -> Verifying -> Done
//! ```
//!
//! Each child prints newline-delimited JSON on stdout. The relay parses every
//! line, rescales stage-local percents into the stage's overall range and
//! forwards the result over a bounded channel to whoever holds the
//! [`RunHandle`]. Dropping the handle cancels the run: stages not yet started
//! never start, an active child is terminated, except a writer, which is
//! allowed to finish.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::defaults::MAX_DIAGNOSTIC_BYTES;
use crate::core::device::{validate_target, DeviceInventory, Platform, TargetDevice};
use crate::core::global_config::GlobalConfig;
use crate::core::image::ImageSource;
use crate::core::locator::ImageResolver;
use crate::core::pipeline::{PipelineRun, Stage, StageRanges};
use crate::core::progress::{parse_line, PipelineEvent, ProgressEvent, TerminalEvent, WireMessage};
use crate::core::registry::{DeviceClaim, InFlightRegistry};
use crate::error::{ErrorKind, PipelineError, ToolError};
use crate::infra::dirs::FlashpipeDirs;
use crate::infra::process::tail;

/// One imaging request
#[derive(Debug, Clone, Default)]
pub struct FlashRequest {
    /// Platform-specific whole-disk identifier
    pub device: String,
    /// Image descriptor: URL, listing URL or local path
    pub image: String,
    /// Volume label applied while formatting
    pub label: Option<String>,
    /// Expected SHA-256 of the downloaded file
    pub sha256: Option<String>,
}

/// Builds the command for one stage child
pub trait StageLauncher: Send + Sync {
    fn command(&self, stage: Stage, args: &[String]) -> Command;
}

/// Launches `flashpipe stage ...` from the running executable
#[derive(Debug, Clone)]
pub struct SelfExeLauncher {
    exe: PathBuf,
    extra_args: Vec<String>,
}

impl SelfExeLauncher {
    pub fn new(exe: PathBuf) -> Self {
        Self {
            exe,
            extra_args: Vec::new(),
        }
    }

    /// Launcher for the current executable
    pub fn current() -> Result<Self, PipelineError> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Extra arguments placed before the stage arguments (e.g. `--config`)
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

impl StageLauncher for SelfExeLauncher {
    fn command(&self, _stage: Stage, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.args(&self.extra_args).arg("stage").args(args);
        cmd
    }
}

/// Orchestrator knobs
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub platform: Platform,
    pub max_run: Duration,
    pub cancel_grace: Duration,
    pub channel_capacity: usize,
    pub max_device_bytes: u64,
    pub ranges: StageRanges,
    /// Parent of the per-run download directories
    pub work_dir: PathBuf,
}

impl OrchestratorSettings {
    pub fn from_config(config: &GlobalConfig, dirs: &FlashpipeDirs) -> Self {
        Self {
            platform: Platform::detect(),
            max_run: config.max_run_duration(),
            cancel_grace: config.cancel_grace(),
            channel_capacity: config.channel_capacity(),
            max_device_bytes: config.max_device_bytes(),
            ranges: config.stage_ranges(),
            work_dir: dirs.downloads_dir(),
        }
    }
}

/// Starts and supervises pipeline runs
#[derive(Clone)]
pub struct Orchestrator {
    launcher: Arc<dyn StageLauncher>,
    registry: Arc<dyn InFlightRegistry>,
    inventory: Arc<dyn DeviceInventory>,
    resolver: Arc<dyn ImageResolver>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        launcher: Arc<dyn StageLauncher>,
        registry: Arc<dyn InFlightRegistry>,
        inventory: Arc<dyn DeviceInventory>,
        resolver: Arc<dyn ImageResolver>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            launcher,
            registry,
            inventory,
            resolver,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Start a run in the background
    ///
    /// Fails immediately with a conflict when another run holds the device;
    /// every other failure arrives as the run's terminal event.
    pub fn start(&self, request: FlashRequest) -> Result<RunHandle, PipelineError> {
        let claim = DeviceClaim::acquire(&self.registry, &request.device)?;
        let run = PipelineRun::new(self.settings.ranges);
        let id = run.id;
        let (tx, rx) = mpsc::channel(self.settings.channel_capacity.max(1));
        let cancel = CancellationToken::new();

        info!("Run {} started: {} -> {}", id, request.image, request.device);

        let worker = RunWorker {
            orchestrator: self.clone(),
            request,
            run,
            tx,
            cancel: cancel.clone(),
            run_dir: self.settings.work_dir.join(id.to_string()),
        };
        tokio::spawn(worker.execute(claim));

        Ok(RunHandle {
            id,
            events: rx,
            cancel,
        })
    }
}

/// Observer side of a run
///
/// Dropping the handle cancels the run.
#[derive(Debug)]
pub struct RunHandle {
    pub id: Uuid,
    events: mpsc::Receiver<PipelineEvent>,
    cancel: CancellationToken,
}

impl RunHandle {
    /// Next event; `None` once the run has closed its stream
    pub async fn next_event(&mut self) -> Option<PipelineEvent> {
        self.events.recv().await
    }

    /// Drain the run and return its terminal event
    ///
    /// A stream that closes without one is reported as an unknown outcome.
    pub async fn wait_terminal(mut self) -> TerminalEvent {
        while let Some(event) = self.next_event().await {
            if let PipelineEvent::Finished(terminal) = event {
                return terminal;
            }
        }
        TerminalEvent {
            success: false,
            error: Some("Run ended without an outcome: verify the target device manually".to_string()),
            run_id: Some(self.id),
            ..TerminalEvent::default()
        }
    }

    /// Request cancellation without dropping the handle
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// State owned by one running pipeline
struct RunWorker {
    orchestrator: Orchestrator,
    request: FlashRequest,
    run: PipelineRun,
    tx: mpsc::Sender<PipelineEvent>,
    cancel: CancellationToken,
    run_dir: PathBuf,
}

impl RunWorker {
    async fn execute(mut self, claim: DeviceClaim) {
        let limit = self.orchestrator.settings.max_run;
        let outcome = match tokio::time::timeout(limit, self.drive()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Run {} timed out during {}", self.run.id, self.run.stage);
                Err(PipelineError::Timeout {
                    stage: self.run.stage.to_string(),
                    limit_secs: limit.as_secs(),
                })
            }
        };

        let terminal = match outcome {
            Ok(()) => {
                let _ = self.run.advance(Stage::Done);
                self.emit_progress(Stage::Done, "Done", Some(self.run.overall_percent))
                    .await;
                info!("Run {} finished", self.run.id);
                TerminalEvent::success(format!(
                    "Image written to {}",
                    self.request.device
                ))
            }
            Err(err) => {
                let stage = self.run.stage;
                warn!("Run {} failed during {}: {}", self.run.id, stage, err);
                self.run.fail(err.to_string());
                TerminalEvent::failure(&err).at_stage(stage)
            }
        };

        self.cleanup().await;
        drop(claim);
        let _ = self
            .tx
            .send(PipelineEvent::Finished(terminal.for_run(self.run.id)))
            .await;
    }

    async fn drive(&mut self) -> Result<(), PipelineError> {
        let target = self.validate().await?;
        let source = self.resolve().await?;
        debug!("Run {} target {:?} source {:?}", self.run.id, target, source);

        let mut format_args = vec![
            "format".to_string(),
            "--device".to_string(),
            target.identifier.clone(),
        ];
        if let Some(label) = &self.request.label {
            format_args.extend(["--label".to_string(), label.clone()]);
        }
        self.run_stage(Stage::Formatting, format_args).await?;

        let image_path = match source.local_path() {
            Some(path) => path,
            None => {
                let dest = self.run_dir.join(&source.resolved_filename);
                let mut fetch_args = vec![
                    "fetch".to_string(),
                    "--url".to_string(),
                    source.location.clone(),
                    "--dest".to_string(),
                    dest.display().to_string(),
                ];
                if let Some(sha) = &self.request.sha256 {
                    fetch_args.extend(["--sha256".to_string(), sha.clone()]);
                }
                self.run_stage(Stage::Downloading, fetch_args).await?;
                dest
            }
        };

        self.run_stage(
            Stage::Writing,
            vec![
                "write".to_string(),
                "--image".to_string(),
                image_path.display().to_string(),
                "--device".to_string(),
                target.identifier.clone(),
            ],
        )
        .await?;

        self.run_stage(
            Stage::Verifying,
            vec![
                "verify".to_string(),
                "--device".to_string(),
                target.identifier.clone(),
            ],
        )
        .await?;

        Ok(())
    }

    /// Identifier pattern and safety heuristic, before anything is spawned
    async fn validate(&self) -> Result<TargetDevice, PipelineError> {
        let inventory = Arc::clone(&self.orchestrator.inventory);
        let identifier = self.request.device.clone();
        let platform = self.orchestrator.settings.platform;
        let max_bytes = self.orchestrator.settings.max_device_bytes;

        tokio::task::spawn_blocking(move || {
            validate_target(&identifier, platform, inventory.as_ref(), max_bytes)
        })
        .await
        .map_err(|e| PipelineError::Io(std::io::Error::other(e)))?
    }

    async fn resolve(&self) -> Result<ImageSource, PipelineError> {
        self.emit_progress(Stage::Queued, "Resolving image", Some(0.0))
            .await;
        let source = self
            .orchestrator
            .resolver
            .resolve_image(&self.request.image)
            .await?;
        info!(
            "Run {} resolved {} to {}",
            self.run.id, self.request.image, source.location
        );
        Ok(source)
    }

    /// Spawn one stage child and relay its output
    async fn run_stage(
        &mut self,
        stage: Stage,
        args: Vec<String>,
    ) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled {
                stage: stage.to_string(),
            });
        }

        let start = self
            .run
            .advance(stage)
            .map_err(|e| PipelineError::Io(std::io::Error::other(e)))?;
        info!("Run {} entering {}", self.run.id, stage);
        self.emit_progress(stage, format!("Starting {stage}"), Some(start))
            .await;

        let mut cmd = self.orchestrator.launcher.command(stage, &args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| ToolError::Spawn {
            tool: format!("{stage} stage"),
            error: e.to_string(),
        })?;

        let stderr_task = child.stderr.take().map(|err| tokio::spawn(read_tail(err)));
        let Some(stdout) = child.stdout.take() else {
            return Err(ToolError::Spawn {
                tool: format!("{stage} stage"),
                error: "stdout not captured".to_string(),
            }
            .into());
        };

        // A writer already touching the device is never interrupted
        let interruptible = stage != Stage::Writing;
        let mut lines = BufReader::new(stdout).lines();
        let mut last_message = format!("Starting {stage}");
        let mut terminal: Option<TerminalEvent> = None;
        let mut cancelled = false;

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => match parse_line(&line) {
                        Ok(Some(WireMessage::Progress(progress))) => {
                            let percent = self.run.record(progress.percent);
                            last_message.clone_from(&progress.message);
                            self.emit_progress(stage, progress.message, percent).await;
                        }
                        Ok(Some(WireMessage::Terminal(t))) => terminal = Some(t),
                        Ok(None) => {}
                        Err(e) => warn!("Skipping malformed {} line {:?}: {}", stage, line, e),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Reading {} output failed: {}", stage, e);
                        break;
                    }
                },
                () = self.cancel.cancelled(), if interruptible && !cancelled => {
                    info!("Run {} cancelled during {}, terminating child", self.run.id, stage);
                    cancelled = true;
                    terminate(&mut child, self.orchestrator.settings.cancel_grace).await;
                }
            }
        }

        let status = child.wait().await?;
        let diagnostics = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if cancelled {
            return Err(PipelineError::Cancelled {
                stage: stage.to_string(),
            });
        }

        let child_ok = terminal.as_ref().map_or(true, |t| t.success);
        if status.success() && child_ok {
            let message = terminal
                .and_then(|t| t.message)
                .unwrap_or_else(|| format!("{stage} complete"));
            let percent = self.run.record(Some(100.0));
            debug!("{} finished", stage);
            self.emit_progress(stage, message, percent).await;
            return Ok(());
        }

        let terminal = terminal.unwrap_or_default();
        let kind = terminal.kind.unwrap_or(ErrorKind::ToolError);
        let mut detail = terminal
            .detail
            .filter(|d| !d.is_empty())
            .unwrap_or(diagnostics);
        let message = match terminal.error {
            Some(error) => {
                if !detail.is_empty() {
                    detail.push('\n');
                }
                detail.push_str(&format!("last progress: {last_message}"));
                error
            }
            None => format!(
                "{} stage exited with status {}: {}",
                stage,
                status.code().map_or_else(|| "signal".to_string(), |c| c.to_string()),
                last_message
            ),
        };

        Err(PipelineError::Stage {
            kind,
            message,
            detail,
        })
    }

    async fn emit_progress(&self, stage: Stage, message: impl Into<String>, percent: Option<f64>) {
        let event = PipelineEvent::Progress(ProgressEvent::new(stage, message, percent));
        debug!("Run {} event {}", self.run.id, event.to_json());
        if self.tx.send(event).await.is_err() {
            self.cancel.cancel();
        }
    }

    async fn cleanup(&self) {
        match tokio::fs::remove_dir_all(&self.run_dir).await {
            Ok(()) => debug!("Removed {}", self.run_dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.run_dir.display(), e),
        }
    }
}

/// Ask a child to stop, then kill it after `grace`
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                debug!("SIGTERM to {} failed: {}", pid, e);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!("Child ignored termination for {:?}, killing", grace);
        if let Err(e) = child.kill().await {
            warn!("Kill failed: {}", e);
        }
    }
}

/// Read a stream to the end, keeping only its tail
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > MAX_DIAGNOSTIC_BYTES * 2 {
                    buf.drain(..buf.len() - MAX_DIAGNOSTIC_BYTES);
                }
            }
        }
    }
    let text = String::from_utf8_lossy(&buf);
    tail(text.trim(), MAX_DIAGNOSTIC_BYTES).to_string()
}
