//! Device writing
//!
//! Two strategies put an image on a device:
//!
//! - **helper**: the external block-copy tool (`dd`). Raw images are passed by
//!   path; compressed images are decoded in-process and piped to its stdin.
//! - **direct**: an in-process block loop over the raw device, available
//!   only when the process holds elevated privilege.
//!
//! Either way the device capacity is compared with the decoded image size
//! before the device is opened.

use regex::Regex;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::config::defaults::{HELPER_LOCATIONS, HELPER_TOOL, MAX_DIAGNOSTIC_BYTES, WRITE_BLOCK_SIZE};
use crate::core::global_config::GlobalConfig;
use crate::core::image::Compression;
use crate::error::{DeviceError, PipelineError, PrivilegeError, ResolutionError, ToolError, ValidationError};
use crate::infra::blockdev::{classify, device_size, open_for_write};
use crate::infra::decompress::{ByteCounter, ImageFile};
use crate::infra::privilege::PrivilegeProbe;
use crate::infra::process::tail;

/// How the image gets onto the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStrategy {
    /// External block-copy tool at this path
    Helper(PathBuf),
    /// In-process block loop
    Direct,
}

impl WriteStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Helper(_) => "helper",
            Self::Direct => "direct",
        }
    }
}

/// Writer knobs
#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub use_helper: bool,
    pub helper_path: Option<PathBuf>,
    pub allow_direct: bool,
    pub block_size: usize,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            use_helper: true,
            helper_path: None,
            allow_direct: true,
            block_size: WRITE_BLOCK_SIZE,
        }
    }
}

impl WriterSettings {
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            use_helper: config.use_helper(),
            helper_path: config.writer.helper_path.clone(),
            allow_direct: config.allow_direct(),
            block_size: config.block_size(),
        }
    }
}

/// Locate the helper tool
///
/// An explicitly configured path is the only candidate when set.
pub fn find_helper(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        return path.is_file().then(|| path.to_path_buf());
    }
    HELPER_LOCATIONS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
        .or_else(|| which::which(HELPER_TOOL).ok())
}

/// Choose a strategy: the helper when found, else direct when allowed
pub fn select_strategy(settings: &WriterSettings) -> Result<WriteStrategy, ToolError> {
    if settings.use_helper {
        if let Some(path) = find_helper(settings.helper_path.as_deref()) {
            debug!("Using helper {}", path.display());
            return Ok(WriteStrategy::Helper(path));
        }
        warn!("Helper '{}' not found", HELPER_TOOL);
    }
    if settings.allow_direct {
        return Ok(WriteStrategy::Direct);
    }
    Err(ToolError::NoStrategy {
        helper: settings
            .helper_path
            .as_ref()
            .map_or_else(|| HELPER_TOOL.to_string(), |p| p.display().to_string()),
    })
}

/// Result of a completed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub bytes_written: u64,
    pub strategy: &'static str,
}

/// Writes images to raw devices
pub struct DeviceWriter {
    settings: WriterSettings,
    probe: Box<dyn PrivilegeProbe>,
}

impl DeviceWriter {
    pub fn new(settings: WriterSettings, probe: Box<dyn PrivilegeProbe>) -> Self {
        Self { settings, probe }
    }

    /// Write `image` to `device`
    ///
    /// `declared_size` is the uncompressed size announced by the caller. The
    /// capacity check uses the larger of it and the image's decoded size,
    /// and runs before the device is opened.
    /// `report` receives `(message, local_percent)`.
    pub fn write(
        &self,
        image: &ImageFile,
        device: &Path,
        declared_size: Option<u64>,
        report: &mut dyn FnMut(&str, Option<f64>),
    ) -> Result<WriteOutcome, PipelineError> {
        let strategy = select_strategy(&self.settings)?;
        if strategy == WriteStrategy::Direct && !self.probe.is_elevated() {
            return Err(PrivilegeError::NotElevated {
                operation: format!("write {} directly", device.display()),
            }
            .into());
        }

        let required = image.required_len(declared_size)?;
        let capacity = device_size(device)?;
        if capacity < required {
            return Err(ValidationError::DeviceTooSmall {
                device: device.display().to_string(),
                device_size: capacity,
                image_size: required,
            }
            .into());
        }

        info!(
            "Writing {} to {} ({} strategy)",
            image.path().display(),
            device.display(),
            strategy.name()
        );
        report(&format!("Writing with {} strategy", strategy.name()), Some(0.0));

        let bytes_written = match &strategy {
            WriteStrategy::Helper(helper) => write_with_helper(helper, image, device, required, report)?,
            WriteStrategy::Direct => {
                write_direct(image, device, capacity, self.settings.block_size, report)?
            }
        };

        report("Write complete", Some(100.0));
        Ok(WriteOutcome {
            bytes_written,
            strategy: strategy.name(),
        })
    }
}

/// Output that can be forced to stable storage
trait DurableWrite: Write {
    fn sync_data(&mut self) -> io::Result<()>;
}

impl DurableWrite for std::fs::File {
    fn sync_data(&mut self) -> io::Result<()> {
        std::fs::File::sync_data(self)
    }
}

/// In-process block loop over the opened device
fn write_direct(
    image: &ImageFile,
    device: &Path,
    capacity: u64,
    block_size: usize,
    report: &mut dyn FnMut(&str, Option<f64>),
) -> Result<u64, PipelineError> {
    let mut out = open_for_write(device)?;
    copy_blocks(image, &mut out, device, capacity, block_size, report)
}

/// Copy the decoded image one block at a time
///
/// Every block is flushed and synced before the next one is read, so a
/// reported percent never runs ahead of what the device holds.
fn copy_blocks(
    image: &ImageFile,
    out: &mut dyn DurableWrite,
    device: &Path,
    capacity: u64,
    block_size: usize,
    report: &mut dyn FnMut(&str, Option<f64>),
) -> Result<u64, PipelineError> {
    let block_size = block_size.max(512);

    image.stream(|reader, counter| {
        let mut buf = vec![0u8; block_size];
        let mut written = 0u64;
        loop {
            let n = read_block(reader, &mut buf).map_err(|e| ResolutionError::UnreadableImage {
                path: image.path().to_path_buf(),
                error: e.to_string(),
            })?;
            if n == 0 {
                break;
            }
            let end = written + n as u64;
            if end > capacity {
                return Err(ValidationError::DeviceTooSmall {
                    device: device.display().to_string(),
                    device_size: capacity,
                    image_size: end,
                }
                .into());
            }
            let fail = |e: io::Error| classify(device, &e, written, capacity.max(end));
            out.write_all(&buf[..n]).map_err(fail)?;
            out.flush().map_err(fail)?;
            out.sync_data().map_err(fail)?;
            written = end;
            report("Writing", image.percent(written, counter.get()));
        }

        debug!("Direct write finished: {} bytes", written);
        Ok(written)
    })
}

/// Fill `buf` as far as the reader allows; short only at end of stream
fn read_block(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Helper arguments for one write
pub fn helper_args(image: Option<&Path>, device: &Path) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(path) = image {
        args.push(format!("if={}", path.display()));
    }
    args.push(format!("of={}", device.display()));
    if cfg!(target_os = "macos") {
        args.push("bs=4m".to_string());
    } else {
        args.push("bs=4M".to_string());
        args.push("conv=fsync,notrunc".to_string());
        if image.is_none() {
            args.push("iflag=fullblock".to_string());
        }
    }
    args.push("status=progress".to_string());
    args
}

fn bytes_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\s*(\d+)\s+bytes").ok())
        .as_ref()
}

/// Bytes-copied count from one helper status segment
pub fn parse_helper_progress(segment: &str) -> Option<u64> {
    bytes_pattern()?
        .captures(segment)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Map a failed helper's stderr onto the error taxonomy
pub fn classify_helper_failure(
    device: &Path,
    stderr: &str,
    code: Option<i32>,
    written: u64,
    required: u64,
) -> PipelineError {
    let path = device.display().to_string();
    if stderr.contains("Permission denied") || stderr.contains("Operation not permitted") {
        PrivilegeError::AccessDenied { path }.into()
    } else if stderr.contains("Device or resource busy") || stderr.contains("Resource busy") {
        DeviceError::Busy { path }.into()
    } else if stderr.contains("No space left on device") {
        ValidationError::DeviceTooSmall {
            device: path,
            device_size: written,
            image_size: required,
        }
        .into()
    } else if stderr.contains("No such file or directory") || stderr.contains("No such device") {
        if written > 0 {
            DeviceError::Removed { path, written }.into()
        } else {
            DeviceError::Missing { path }.into()
        }
    } else {
        ToolError::Failed {
            tool: HELPER_TOOL.to_string(),
            code,
            stderr: tail(stderr.trim(), MAX_DIAGNOSTIC_BYTES).to_string(),
        }
        .into()
    }
}

/// Run the helper, feeding decoded bytes on stdin for compressed images
fn write_with_helper(
    helper: &Path,
    image: &ImageFile,
    device: &Path,
    required: u64,
    report: &mut dyn FnMut(&str, Option<f64>),
) -> Result<u64, PipelineError> {
    let piped = image.compression() != Compression::Raw;
    let args = helper_args((!piped).then(|| image.path()), device);
    debug!("Running {} {}", helper.display(), args.join(" "));

    let spawn_err = |e: io::Error| ToolError::Spawn {
        tool: helper.display().to_string(),
        error: e.to_string(),
    };
    let mut child = Command::new(helper)
        .args(&args)
        .stdin(if piped { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_err)?;

    let stdin = child.stdin.take();
    let stderr = child.stderr.take();
    let counter = ByteCounter::default();

    let (feed_result, diagnostics, written) = std::thread::scope(|scope| {
        let feeder = stdin.map(|mut stdin| {
            let counter = counter.clone();
            scope.spawn(move || {
                image.stream_counted(counter, |reader, _| {
                    let copied = io::copy(reader, &mut stdin);
                    drop(stdin);
                    Ok(copied?)
                })
            })
        });

        let mut diagnostics = String::new();
        let mut written = 0u64;
        if let Some(stderr) = stderr {
            let mut segment = Vec::new();
            for byte in BufReader::new(stderr).bytes() {
                let Ok(byte) = byte else { break };
                if byte == b'\r' || byte == b'\n' {
                    let text = String::from_utf8_lossy(&segment).into_owned();
                    segment.clear();
                    if let Some(bytes) = parse_helper_progress(&text) {
                        written = bytes;
                        report("Writing", image.percent(written, counter.get()));
                    } else if !text.trim().is_empty() {
                        diagnostics.push_str(&text);
                        diagnostics.push('\n');
                    }
                } else {
                    segment.push(byte);
                }
            }
            diagnostics.push_str(&String::from_utf8_lossy(&segment));
        }

        let feed_result = feeder.map(|handle| {
            handle.join().unwrap_or_else(|_| {
                Err(ToolError::Spawn {
                    tool: HELPER_TOOL.to_string(),
                    error: "stdin feeder panicked".to_string(),
                }
                .into())
            })
        });
        (feed_result, diagnostics, written)
    });

    let status = child.wait().map_err(spawn_err)?;
    if !status.success() {
        return Err(classify_helper_failure(
            device,
            &diagnostics,
            status.code(),
            written,
            required,
        ));
    }

    match feed_result {
        Some(Ok(fed)) => Ok(fed),
        Some(Err(e)) => Err(e),
        None => Ok(image.compressed_len()),
    }
}
