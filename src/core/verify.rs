//! Post-write sanity check

use std::path::Path;
use tracing::debug;

use crate::config::defaults::BOOT_SECTOR_SIZE;
use crate::error::{DeviceError, PipelineError};
use crate::infra::blockdev::{read_head, sync_device};

/// Flush the device and confirm its boot sector isn't blank
///
/// Returns the number of bytes inspected. A device whose first sector reads
/// back as all zeros almost certainly did not receive the image.
pub fn verify_device(device: &Path) -> Result<usize, PipelineError> {
    sync_device(device)?;
    let head = read_head(device, BOOT_SECTOR_SIZE)?;
    debug!("Read {} bytes back from {}", head.len(), device.display());

    if head.is_empty() || head.iter().all(|b| *b == 0) {
        return Err(DeviceError::BlankBootSector {
            path: device.display().to_string(),
            bytes: head.len(),
        }
        .into());
    }
    Ok(head.len())
}
