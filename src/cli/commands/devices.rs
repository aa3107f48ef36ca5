//! CLI command implementation for `flashpipe devices`

use anyhow::Result;

use crate::cli::output::{format_size, OutputConfig};
use crate::core::device::DeviceInventory;
use crate::infra::devices::SystemInventory;

/// Execute the devices command
pub fn execute(all: bool) -> Result<()> {
    let devices: Vec<_> = SystemInventory::new()
        .list()?
        .into_iter()
        .filter(|d| all || !d.is_system)
        .collect();

    let output = OutputConfig::global();
    if output.json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        if !output.quiet {
            println!("No candidate devices found.");
        }
        return Ok(());
    }

    println!("{:<24} {:>12} {:<10} MOUNTS", "DEVICE", "SIZE", "REMOVABLE");
    for device in &devices {
        let mut mounts = device.mount_points.join(", ");
        if device.is_system {
            mounts.push_str(" (system)");
        }
        println!(
            "{:<24} {:>12} {:<10} {}",
            device.identifier,
            format_size(device.size_bytes),
            if device.removable { "yes" } else { "no" },
            mounts
        );
    }
    Ok(())
}
