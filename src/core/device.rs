//! Target device identification and safety checks
//!
//! Nothing destructive may run against a device until [`validate_target`]
//! accepts it: the identifier must match the host platform's whole-disk
//! pattern, the device must be known to the inventory, and it must not look
//! like a system disk.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use tracing::debug;

use crate::error::{DeviceError, PipelineError, ValidationError};

/// Mount points that mark a disk as holding the running system
pub const SYSTEM_MOUNTS: &[&str] = &[
    "/",
    "/boot",
    "/boot/efi",
    "/usr",
    "/var",
    "/home",
    "/System/Volumes/Data",
    "C:\\",
];

/// Host platform family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    /// Platform of the running host
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(windows) {
            Self::Windows
        } else {
            Self::Linux
        }
    }

    fn identifier_pattern(self) -> Option<&'static Regex> {
        static LINUX: OnceLock<Option<Regex>> = OnceLock::new();
        static MACOS: OnceLock<Option<Regex>> = OnceLock::new();
        static WINDOWS: OnceLock<Option<Regex>> = OnceLock::new();

        let (cell, pattern) = match self {
            Self::Linux => (
                &LINUX,
                r"^/dev/(?:(?:sd|vd|hd|xvd)[a-z]+|mmcblk\d+|nvme\d+n\d+)$",
            ),
            Self::MacOs => (&MACOS, r"^/dev/r?disk\d+$"),
            Self::Windows => (&WINDOWS, r"(?i)^\\\\\.\\PhysicalDrive\d+$"),
        };
        cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
    }

    /// Whether an identifier names a whole disk on this platform
    pub fn is_valid_identifier(self, identifier: &str) -> bool {
        self.identifier_pattern()
            .is_some_and(|re| re.is_match(identifier))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Linux => "linux",
            Self::MacOs => "macos",
            Self::Windows => "windows",
        };
        f.write_str(name)
    }
}

/// Canonical form of an identifier, used for in-flight bookkeeping
///
/// `/dev/rdiskN` and `/dev/diskN` name the same macOS disk.
pub fn normalize_identifier(identifier: &str) -> String {
    let trimmed = identifier.trim();
    if let Some(rest) = trimmed.strip_prefix("/dev/rdisk") {
        return format!("/dev/disk{rest}");
    }
    if let Some(drive) = trimmed
        .get(..4)
        .filter(|prefix| *prefix == r"\\.\")
        .and_then(|_| trimmed.get(4..))
    {
        return format!(r"\\.\{}", drive.to_ascii_lowercase());
    }
    trimmed.to_string()
}

/// Disk number of a Windows physical drive identifier
pub fn disk_number(identifier: &str) -> Option<u32> {
    let lower = identifier.to_ascii_lowercase();
    lower
        .strip_prefix(r"\\.\physicaldrive")
        .and_then(|n| n.parse().ok())
}

/// Path of the `n`th partition of a Linux whole-disk device
///
/// Devices whose name ends in a digit (`mmcblk0`, `nvme0n1`) separate the
/// partition number with `p`.
pub fn partition_path(device: &str, n: u32) -> String {
    if device.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{device}p{n}")
    } else {
        format!("{device}{n}")
    }
}

/// A device as reported by the inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Platform-specific device path
    pub identifier: String,
    /// Capacity in bytes
    pub size_bytes: u64,
    /// Whether the OS flags the device as removable
    pub removable: bool,
    /// Mount points of the device's partitions
    #[serde(default)]
    pub mount_points: Vec<String>,
    /// Whether any mount point is a system mount
    pub is_system: bool,
}

impl DeviceInfo {
    /// Build an entry, deriving `is_system` from the mount points
    pub fn new(identifier: &str, size_bytes: u64, removable: bool, mount_points: Vec<String>) -> Self {
        let is_system = system_mount(&mount_points).is_some();
        Self {
            identifier: identifier.to_string(),
            size_bytes,
            removable,
            mount_points,
            is_system,
        }
    }
}

fn system_mount(mount_points: &[String]) -> Option<&str> {
    mount_points
        .iter()
        .map(String::as_str)
        .find(|m| SYSTEM_MOUNTS.iter().any(|s| s.eq_ignore_ascii_case(m)))
}

/// Source of attached-device facts
pub trait DeviceInventory: Send + Sync {
    /// List candidate target devices
    fn list(&self) -> Result<Vec<DeviceInfo>, DeviceError>;

    /// Look up one device by identifier
    fn find(&self, identifier: &str) -> Result<Option<DeviceInfo>, DeviceError> {
        let wanted = normalize_identifier(identifier);
        Ok(self
            .list()?
            .into_iter()
            .find(|d| normalize_identifier(&d.identifier) == wanted))
    }
}

/// Fixed device list, for hosts configured by hand and for tests
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    devices: Vec<DeviceInfo>,
}

impl StaticInventory {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self { devices }
    }
}

impl DeviceInventory for StaticInventory {
    fn list(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        Ok(self.devices.clone())
    }
}

/// A device that passed (or is about to pass) validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDevice {
    pub identifier: String,
    pub size_bytes: u64,
    pub validated: bool,
    #[serde(default)]
    pub mount_points: Vec<String>,
    pub removable: bool,
}

/// Check an identifier against the platform pattern only
pub fn check_identifier(identifier: &str, platform: Platform) -> Result<(), ValidationError> {
    if platform.is_valid_identifier(identifier) {
        Ok(())
    } else {
        Err(ValidationError::InvalidIdentifier {
            identifier: identifier.to_string(),
            platform: platform.to_string(),
        })
    }
}

/// Validate a target device before any destructive call
///
/// Rejects identifiers that fail the platform pattern, devices the inventory
/// doesn't know, devices holding a system mount, empty readers and devices
/// above `max_bytes`.
pub fn validate_target(
    identifier: &str,
    platform: Platform,
    inventory: &dyn DeviceInventory,
    max_bytes: u64,
) -> Result<TargetDevice, PipelineError> {
    check_identifier(identifier, platform)?;

    let info = inventory
        .find(identifier)?
        .ok_or_else(|| ValidationError::UnknownDevice {
            identifier: identifier.to_string(),
        })?;

    if let Some(mount) = system_mount(&info.mount_points) {
        return Err(ValidationError::SystemDisk {
            identifier: identifier.to_string(),
            mount: mount.to_string(),
        }
        .into());
    }
    if info.is_system {
        return Err(ValidationError::SystemDisk {
            identifier: identifier.to_string(),
            mount: "/".to_string(),
        }
        .into());
    }
    if info.size_bytes == 0 {
        return Err(ValidationError::NoMedia {
            identifier: identifier.to_string(),
        }
        .into());
    }
    if info.size_bytes > max_bytes {
        return Err(ValidationError::TooLarge {
            identifier: identifier.to_string(),
            size: info.size_bytes,
            limit: max_bytes,
        }
        .into());
    }

    debug!(
        "Validated {} ({} bytes, removable: {})",
        identifier, info.size_bytes, info.removable
    );

    Ok(TargetDevice {
        identifier: identifier.to_string(),
        size_bytes: info.size_bytes,
        validated: true,
        mount_points: info.mount_points,
        removable: info.removable,
    })
}
