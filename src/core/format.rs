//! Device formatting
//!
//! Each host platform has a back end that turns a validated target into a
//! plan of native tool invocations. Plans are executed through a
//! [`CommandRunner`]; nothing runs unless the target passed validation and
//! its identifier matches the back end's platform pattern.

use tracing::{info, warn};

use crate::core::device::{check_identifier, disk_number, normalize_identifier, partition_path, Platform, TargetDevice};
use crate::error::{PipelineError, ValidationError};
use crate::infra::process::{CommandOutput, CommandRunner, CommandSpec};

/// Longest FAT volume label
pub const MAX_LABEL_LEN: usize = 11;

/// Fixed progress milestones of a format run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    Start,
    PartitionClear,
    LabelSet,
    Done,
}

impl Milestone {
    pub fn percent(self) -> f64 {
        match self {
            Self::Start => 0.0,
            Self::PartitionClear => 40.0,
            Self::LabelSet => 80.0,
            Self::Done => 100.0,
        }
    }
}

/// Normalize a requested label to FAT rules: upper-case, at most 11 chars
pub fn normalize_label(label: &str) -> Option<String> {
    let cleaned: String = label
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ' '))
        .map(|c| c.to_ascii_uppercase())
        .take(MAX_LABEL_LEN)
        .collect();
    let cleaned = cleaned.trim_end().to_string();
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Per-platform partitioning back end
pub trait Formatter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Commands releasing the device; failures are tolerated
    fn unmount_plan(&self, device: &TargetDevice) -> Vec<CommandSpec>;

    /// Commands clearing the partition table
    fn clear_plan(&self, device: &TargetDevice) -> Vec<CommandSpec>;

    /// Commands creating one FAT32 partition with `label`
    fn label_plan(&self, device: &TargetDevice, label: &str) -> Vec<CommandSpec>;
}

/// Linux: `umount`, `wipefs`, `parted`, `mkfs.vfat`
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxFormatter;

impl Formatter for LinuxFormatter {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    fn unmount_plan(&self, device: &TargetDevice) -> Vec<CommandSpec> {
        device
            .mount_points
            .iter()
            .map(|mount| CommandSpec::new("umount", [mount.as_str()]))
            .collect()
    }

    fn clear_plan(&self, device: &TargetDevice) -> Vec<CommandSpec> {
        vec![CommandSpec::new(
            "wipefs",
            ["--all", "--force", device.identifier.as_str()],
        )]
    }

    fn label_plan(&self, device: &TargetDevice, label: &str) -> Vec<CommandSpec> {
        let dev = device.identifier.as_str();
        vec![
            CommandSpec::new(
                "parted",
                ["--script", dev, "mklabel", "msdos", "mkpart", "primary", "fat32", "1MiB", "100%"],
            ),
            CommandSpec::new(
                "mkfs.vfat",
                vec![
                    "-F".to_string(),
                    "32".to_string(),
                    "-n".to_string(),
                    label.to_string(),
                    partition_path(dev, 1),
                ],
            ),
        ]
    }
}

/// macOS: `diskutil`
#[derive(Debug, Clone, Copy, Default)]
pub struct MacFormatter;

impl Formatter for MacFormatter {
    fn platform(&self) -> Platform {
        Platform::MacOs
    }

    fn unmount_plan(&self, device: &TargetDevice) -> Vec<CommandSpec> {
        let disk = normalize_identifier(&device.identifier);
        vec![CommandSpec::new("diskutil", ["unmountDisk", "force", disk.as_str()])]
    }

    fn clear_plan(&self, device: &TargetDevice) -> Vec<CommandSpec> {
        let disk = normalize_identifier(&device.identifier);
        vec![CommandSpec::new(
            "diskutil",
            ["partitionDisk", disk.as_str(), "MBR", "free", "%noformat%", "100%"],
        )]
    }

    fn label_plan(&self, device: &TargetDevice, label: &str) -> Vec<CommandSpec> {
        let disk = normalize_identifier(&device.identifier);
        vec![CommandSpec::new(
            "diskutil",
            ["eraseDisk", "FAT32", label, "MBRFormat", disk.as_str()],
        )]
    }
}

/// Windows: `diskpart` driven by a script on stdin
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsFormatter;

impl WindowsFormatter {
    fn script(device: &TargetDevice, body: &[String]) -> CommandSpec {
        let number = disk_number(&device.identifier).unwrap_or(u32::MAX);
        let mut script = format!("select disk {number}\n");
        for line in body {
            script.push_str(line);
            script.push('\n');
        }
        script.push_str("exit\n");
        CommandSpec::new("diskpart", Vec::<String>::new()).with_stdin(script)
    }
}

impl Formatter for WindowsFormatter {
    fn platform(&self) -> Platform {
        Platform::Windows
    }

    fn unmount_plan(&self, _device: &TargetDevice) -> Vec<CommandSpec> {
        Vec::new()
    }

    fn clear_plan(&self, device: &TargetDevice) -> Vec<CommandSpec> {
        vec![Self::script(device, &["clean".to_string()])]
    }

    fn label_plan(&self, device: &TargetDevice, label: &str) -> Vec<CommandSpec> {
        vec![Self::script(
            device,
            &[
                "create partition primary".to_string(),
                format!("format fs=fat32 label={label} quick"),
                "assign".to_string(),
            ],
        )]
    }
}

/// Back end for a platform
pub fn formatter_for(platform: Platform) -> Box<dyn Formatter> {
    match platform {
        Platform::Linux => Box::new(LinuxFormatter),
        Platform::MacOs => Box::new(MacFormatter),
        Platform::Windows => Box::new(WindowsFormatter),
    }
}

/// Result of a successful format
#[derive(Debug, Clone, Default)]
pub struct FormatOutcome {
    /// Label applied, if any
    pub label: Option<String>,
    /// Captured tool output
    pub diagnostics: String,
}

/// Format a validated device
///
/// `report` receives `(message, percent)` at each milestone. The target is
/// re-checked against the platform pattern before any command runs.
pub fn format_device(
    formatter: &dyn Formatter,
    runner: &dyn CommandRunner,
    device: &TargetDevice,
    label: Option<&str>,
    report: &mut dyn FnMut(&str, f64),
) -> Result<FormatOutcome, PipelineError> {
    check_identifier(&device.identifier, formatter.platform())?;
    if !device.validated {
        return Err(ValidationError::UnknownDevice {
            identifier: device.identifier.clone(),
        }
        .into());
    }

    report(
        &format!("Preparing {}", device.identifier),
        Milestone::Start.percent(),
    );

    let mut diagnostics = Vec::new();
    for spec in formatter.unmount_plan(device) {
        match runner.run(&spec) {
            Ok(output) if output.success => push_diagnostics(&mut diagnostics, &output),
            Ok(output) => warn!("'{}' failed: {}", spec, output.diagnostics()),
            Err(e) => warn!("'{}' could not run: {}", spec, e),
        }
    }

    for spec in formatter.clear_plan(device) {
        let output = runner.run(&spec)?.check(&spec.program)?;
        push_diagnostics(&mut diagnostics, &output);
    }
    report("Partition table cleared", Milestone::PartitionClear.percent());

    let label = label.and_then(normalize_label);
    match &label {
        Some(label) => {
            for spec in formatter.label_plan(device, label) {
                let output = runner.run(&spec)?.check(&spec.program)?;
                push_diagnostics(&mut diagnostics, &output);
            }
            report(&format!("Label set to {label}"), Milestone::LabelSet.percent());
        }
        None => report("Label skipped", Milestone::LabelSet.percent()),
    }

    info!("Formatted {}", device.identifier);
    report("Format complete", Milestone::Done.percent());

    Ok(FormatOutcome {
        label,
        diagnostics: diagnostics.join("\n"),
    })
}

fn push_diagnostics(acc: &mut Vec<String>, output: &CommandOutput) {
    let text = output.diagnostics();
    if !text.is_empty() {
        acc.push(text);
    }
}
