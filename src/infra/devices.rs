//! Host device enumeration
//!
//! Linux devices come from `/sys/block` with mount points from `sysinfo`;
//! macOS devices are grouped from `sysinfo`'s partition list; Windows disks
//! come from `Get-Disk`.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::core::device::{DeviceInfo, DeviceInventory};
use crate::error::DeviceError;

#[cfg(windows)]
use crate::infra::process::{CommandRunner, CommandSpec, SystemRunner};

/// Block device name prefixes that are never imaging targets
const SKIPPED_PREFIXES: &[&str] = &["loop", "ram", "zram", "dm-", "md", "sr"];

/// Inventory backed by the running host
#[derive(Debug, Clone)]
pub struct SystemInventory {
    sys_block: PathBuf,
}

impl Default for SystemInventory {
    fn default() -> Self {
        Self {
            sys_block: PathBuf::from("/sys/block"),
        }
    }
}

impl SystemInventory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceInventory for SystemInventory {
    fn list(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let mounts = partition_mounts();
        let devices = if cfg!(target_os = "linux") {
            scan_sys_block(&self.sys_block, &mounts)?
        } else if cfg!(target_os = "macos") {
            group_partitions(&mounts)
        } else {
            list_windows_disks()?
        };
        debug!("Inventory found {} device(s)", devices.len());
        Ok(devices)
    }
}

/// A mounted partition as reported by `sysinfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMount {
    /// Partition name without the `/dev/` prefix
    pub name: String,
    pub mount_point: String,
    pub total_space: u64,
    pub removable: bool,
}

fn partition_mounts() -> Vec<PartitionMount> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .map(|disk| {
            let name = disk.name().to_string_lossy();
            PartitionMount {
                name: name.trim_start_matches("/dev/").to_string(),
                mount_point: disk.mount_point().to_string_lossy().into_owned(),
                total_space: disk.total_space(),
                removable: disk.is_removable(),
            }
        })
        .collect()
}

/// Whether `partition` is `disk` itself or one of its partitions
fn belongs_to(partition: &str, disk: &str) -> bool {
    let Some(rest) = partition.strip_prefix(disk) else {
        return false;
    };
    let rest = rest.strip_prefix('p').unwrap_or(rest);
    let rest = rest.strip_prefix('s').unwrap_or(rest);
    rest.chars().all(|c| c.is_ascii_digit())
}

fn read_sys_file(root: &Path, device: &str, file: &str) -> Option<String> {
    fs::read_to_string(root.join(device).join(file))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Enumerate whole disks under a `/sys/block`-shaped directory
pub fn scan_sys_block(root: &Path, mounts: &[PartitionMount]) -> Result<Vec<DeviceInfo>, DeviceError> {
    let entries = fs::read_dir(root)
        .map_err(|e| DeviceError::Enumeration(format!("{}: {e}", root.display())))?;

    let mut devices = Vec::new();
    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if SKIPPED_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }

        let removable = read_sys_file(root, &name, "removable").is_some_and(|s| s == "1");
        let sectors = read_sys_file(root, &name, "size")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let mount_points = mounts
            .iter()
            .filter(|m| belongs_to(&m.name, &name) && !m.mount_point.is_empty())
            .map(|m| m.mount_point.clone())
            .collect();

        devices.push(DeviceInfo::new(
            &format!("/dev/{name}"),
            sectors * 512,
            removable,
            mount_points,
        ));
    }

    devices.sort_by(|a, b| a.identifier.cmp(&b.identifier));
    Ok(devices)
}

/// Group macOS partitions (`disk4s1`) under their whole disk (`disk4`)
pub fn group_partitions(mounts: &[PartitionMount]) -> Vec<DeviceInfo> {
    let mut disks: Vec<(String, u64, bool, Vec<String>)> = Vec::new();
    for mount in mounts {
        let Some(idx) = mount.name.rfind('s').filter(|i| *i > "disk".len()) else {
            continue;
        };
        let disk = &mount.name[..idx];
        match disks.iter_mut().find(|(name, ..)| name == disk) {
            Some(entry) => {
                entry.1 += mount.total_space;
                entry.3.push(mount.mount_point.clone());
            }
            None => disks.push((
                disk.to_string(),
                mount.total_space,
                mount.removable,
                vec![mount.mount_point.clone()],
            )),
        }
    }

    disks
        .into_iter()
        .map(|(name, size, removable, mounts)| {
            DeviceInfo::new(&format!("/dev/{name}"), size, removable, mounts)
        })
        .collect()
}

/// One entry of `Get-Disk | ConvertTo-Json`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WindowsDisk {
    number: u32,
    size: u64,
    #[serde(default)]
    bus_type: Option<serde_json::Value>,
    #[serde(default)]
    is_boot: bool,
    #[serde(default)]
    is_system: bool,
}

/// Parse `Get-Disk` JSON, which is an object for one disk and an array for many
pub fn parse_windows_disks(json: &str) -> Result<Vec<DeviceInfo>, DeviceError> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| DeviceError::Enumeration(e.to_string()))?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Null => Vec::new(),
        other => vec![other],
    };

    let mut devices = Vec::new();
    for item in items {
        let disk: WindowsDisk = match serde_json::from_value(item) {
            Ok(disk) => disk,
            Err(e) => {
                warn!("Skipping unparseable disk entry: {}", e);
                continue;
            }
        };
        let removable = disk.bus_type.as_ref().is_some_and(|b| {
            b.as_str().is_some_and(|s| s.eq_ignore_ascii_case("USB") || s.eq_ignore_ascii_case("SD"))
                || b.as_u64().is_some_and(|n| n == 7 || n == 12)
        });
        let mounts = if disk.is_boot || disk.is_system {
            vec!["C:\\".to_string()]
        } else {
            Vec::new()
        };
        devices.push(DeviceInfo::new(
            &format!(r"\\.\PhysicalDrive{}", disk.number),
            disk.size,
            removable,
            mounts,
        ));
    }
    Ok(devices)
}

#[cfg(windows)]
fn list_windows_disks() -> Result<Vec<DeviceInfo>, DeviceError> {
    let spec = CommandSpec::new(
        "powershell",
        [
            "-NoProfile",
            "-Command",
            "Get-Disk | Select-Object Number,Size,BusType,IsBoot,IsSystem | ConvertTo-Json",
        ],
    );
    let output = SystemRunner
        .run(&spec)
        .map_err(|e| DeviceError::Enumeration(e.to_string()))?
        .check("powershell")
        .map_err(|e| DeviceError::Enumeration(e.to_string()))?;
    parse_windows_disks(&output.stdout)
}

#[cfg(not(windows))]
fn list_windows_disks() -> Result<Vec<DeviceInfo>, DeviceError> {
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_block(root: &Path, name: &str, removable: &str, sectors: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("removable"), format!("{removable}\n")).unwrap();
        fs::write(dir.join("size"), format!("{sectors}\n")).unwrap();
    }

    fn mount(name: &str, point: &str) -> PartitionMount {
        PartitionMount {
            name: name.to_string(),
            mount_point: point.to_string(),
            total_space: 0,
            removable: false,
        }
    }

    #[test]
    fn test_belongs_to() {
        assert!(belongs_to("sda1", "sda"));
        assert!(belongs_to("mmcblk0p2", "mmcblk0"));
        assert!(belongs_to("disk4s1", "disk4"));
        assert!(!belongs_to("sdab1", "sda"));
        assert!(!belongs_to("sdb1", "sda"));
    }

    #[test]
    fn test_scan_sys_block() {
        let temp = TempDir::new().unwrap();
        fake_block(temp.path(), "sda", "0", "1000000");
        fake_block(temp.path(), "sdb", "1", "8192");
        fake_block(temp.path(), "loop0", "0", "100");

        let mounts = vec![mount("sda2", "/"), mount("sdb1", "/media/card")];
        let devices = scan_sys_block(temp.path(), &mounts).unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].identifier, "/dev/sda");
        assert!(devices[0].is_system);
        assert_eq!(devices[1].identifier, "/dev/sdb");
        assert!(devices[1].removable);
        assert_eq!(devices[1].size_bytes, 8192 * 512);
        assert_eq!(devices[1].mount_points, vec!["/media/card".to_string()]);
    }

    #[test]
    fn test_scan_missing_root_is_enumeration_error() {
        let err = scan_sys_block(Path::new("/nonexistent/sys/block"), &[]).unwrap_err();
        assert!(matches!(err, DeviceError::Enumeration(_)));
    }

    #[test]
    fn test_group_partitions() {
        let mounts = vec![
            PartitionMount {
                name: "disk4s1".to_string(),
                mount_point: "/Volumes/BOOT".to_string(),
                total_space: 100,
                removable: true,
            },
            PartitionMount {
                name: "disk4s2".to_string(),
                mount_point: "/Volumes/ROOT".to_string(),
                total_space: 200,
                removable: true,
            },
        ];
        let devices = group_partitions(&mounts);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].identifier, "/dev/disk4");
        assert_eq!(devices[0].size_bytes, 300);
        assert_eq!(devices[0].mount_points.len(), 2);
    }

    #[test]
    fn test_parse_windows_disks() {
        let json = r#"[
            {"Number":0,"Size":512110190592,"BusType":"NVMe","IsBoot":true,"IsSystem":true},
            {"Number":2,"Size":31914983424,"BusType":"USB","IsBoot":false,"IsSystem":false}
        ]"#;
        let devices = parse_windows_disks(json).unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices[0].is_system);
        assert_eq!(devices[1].identifier, r"\\.\PhysicalDrive2");
        assert!(devices[1].removable);
    }

    #[test]
    fn test_parse_single_windows_disk_object() {
        let json = r#"{"Number":1,"Size":1024,"BusType":7,"IsBoot":false,"IsSystem":false}"#;
        let devices = parse_windows_disks(json).unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].removable);
    }
}
