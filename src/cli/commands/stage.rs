//! CLI command implementation for `flashpipe stage`
//!
//! Stage children are what the orchestrator spawns. Each writes progress as
//! newline-delimited JSON on stdout, ends with one terminal object, and exits
//! non-zero on failure with diagnostics on stderr.

use anyhow::Result;
use std::io::{self, Stdout};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::core::device::{check_identifier, validate_target, Platform};
use crate::core::format::{format_device, formatter_for};
use crate::core::image::Compression;
use crate::core::progress::{LineEmitter, TerminalEvent};
use crate::core::verify::verify_device;
use crate::core::writer::{DeviceWriter, WriterSettings};
use crate::error::PipelineError;
use crate::infra::decompress::ImageFile;
use crate::infra::devices::SystemInventory;
use crate::infra::download::{DownloadManager, DownloadStatus, DownloadTask, ProgressCallback};
use crate::infra::privilege::probe_for;
use crate::infra::process::SystemRunner;

use super::AppContext;

type SharedEmitter = Arc<Mutex<LineEmitter<Stdout>>>;

fn emitter() -> SharedEmitter {
    Arc::new(Mutex::new(LineEmitter::new(io::stdout())))
}

fn emit(out: &SharedEmitter, message: &str, percent: Option<f64>) {
    let mut out = out.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(e) = out.progress(message, percent) {
        tracing::warn!("Failed to emit progress: {}", e);
    }
}

/// Write the terminal line and turn a failure into the process outcome
fn finish(out: &SharedEmitter, result: Result<String, PipelineError>) -> Result<()> {
    let terminal = match &result {
        Ok(message) => TerminalEvent::success(message.clone()),
        Err(e) => TerminalEvent::failure(e),
    };
    out.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .finish(&terminal)?;

    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            if let Some(detail) = e.detail() {
                eprintln!("{detail}");
            }
            Err(e.into())
        }
    }
}

/// Devices that are plain files are accepted as-is; anything else must match
/// the platform's whole-disk pattern
fn check_target(device: &str) -> Result<(), PipelineError> {
    if Path::new(device).is_file() {
        return Ok(());
    }
    check_identifier(device, Platform::detect())?;
    Ok(())
}

/// `stage format`
pub fn format(ctx: &AppContext, device: &str, label: Option<&str>) -> Result<()> {
    let out = emitter();
    let platform = Platform::detect();

    let result = validate_target(
        device,
        platform,
        &SystemInventory::new(),
        ctx.config.max_device_bytes(),
    )
    .and_then(|target| {
        let formatter = formatter_for(platform);
        format_device(
            formatter.as_ref(),
            &SystemRunner,
            &target,
            label,
            &mut |message, percent| emit(&out, message, Some(percent)),
        )
    })
    .map(|outcome| match outcome.label {
        Some(label) => format!("Formatted {device} as {label}"),
        None => format!("Formatted {device}"),
    });

    finish(&out, result)
}

/// `stage fetch`
pub async fn fetch(ctx: &AppContext, url: &str, dest: &Path, sha256: Option<&str>) -> Result<()> {
    let out = emitter();
    let manager = DownloadManager::from_config(&ctx.config);

    let sink = Arc::clone(&out);
    let callback: ProgressCallback = Box::new(move |task: &DownloadTask| {
        let message = match task.status {
            DownloadStatus::Pending => "Connecting",
            DownloadStatus::Transferring => "Downloading",
            DownloadStatus::Retrying => "Connection lost, retrying",
            DownloadStatus::Complete => "Download complete",
            DownloadStatus::Failed => "Download failed",
        };
        emit(&sink, message, task.percent());
    });

    let result = match sha256 {
        Some(expected) => {
            manager
                .download_verified(url, dest, expected, Some(&callback))
                .await
        }
        None => manager.download(url, dest, Some(&callback)).await,
    }
    .map(|r| format!("Downloaded {} bytes in {} attempt(s)", r.size, r.attempts))
    .map_err(PipelineError::from);

    finish(&out, result)
}

/// Options for `stage write`
#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub image: PathBuf,
    pub device: String,
    pub image_size: Option<u64>,
    pub assume_privileged: bool,
    pub no_helper: bool,
}

/// `stage write`
pub fn write(ctx: &AppContext, options: &WriteOptions) -> Result<()> {
    let out = emitter();

    let result = check_target(&options.device).and_then(|()| {
        let image = ImageFile::open(&options.image, Compression::detect(&options.image))?;

        let mut settings = WriterSettings::from_config(&ctx.config);
        if options.no_helper {
            settings.use_helper = false;
        }
        let probe = probe_for(options.assume_privileged || ctx.config.assume_privileged());
        let writer = DeviceWriter::new(settings, probe);

        let outcome = writer.write(
            &image,
            Path::new(&options.device),
            options.image_size,
            &mut |message, percent| emit(&out, message, percent),
        )?;
        Ok(format!(
            "Wrote {} bytes to {} ({} strategy)",
            outcome.bytes_written, options.device, outcome.strategy
        ))
    });

    finish(&out, result)
}

/// `stage verify`
pub fn verify(device: &str) -> Result<()> {
    let out = emitter();

    let result = check_target(device).and_then(|()| {
        emit(&out, "Syncing device", Some(0.0));
        let bytes = verify_device(Path::new(device))?;
        emit(&out, "Boot sector present", Some(100.0));
        Ok(format!("Verified the first {bytes} bytes of {device}"))
    });

    finish(&out, result)
}
