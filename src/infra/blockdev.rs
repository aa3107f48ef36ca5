//! Raw block device access
//!
//! Opening, sizing and reading back devices, and translating OS errors into
//! the pipeline's error families so "permission denied", "busy" and
//! "too small" stay distinguishable.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{DeviceError, PipelineError, PrivilegeError, ValidationError};

/// Capacity of a device (or regular file) in bytes
pub fn device_size(path: &Path) -> Result<u64, PipelineError> {
    let mut file = File::open(path).map_err(|e| classify(path, &e, 0, 0))?;
    file.seek(SeekFrom::End(0))
        .map_err(|e| classify(path, &e, 0, 0))
}

/// Open a device for exclusive binary writing
///
/// Linux block devices are opened with `O_EXCL`, which fails with `EBUSY`
/// while any partition is mounted.
pub fn open_for_write(path: &Path) -> Result<File, PipelineError> {
    let mut options = OpenOptions::new();
    options.write(true);

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
        let is_block = std::fs::metadata(path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false);
        if is_block {
            options.custom_flags(libc::O_EXCL);
        }
    }

    options.open(path).map_err(|e| classify(path, &e, 0, 0))
}

/// Read the first `len` bytes of a device
pub fn read_head(path: &Path, len: usize) -> Result<Vec<u8>, PipelineError> {
    let file = File::open(path).map_err(|e| classify(path, &e, 0, 0))?;
    let mut buf = Vec::with_capacity(len);
    file.take(len as u64)
        .read_to_end(&mut buf)
        .map_err(|e| classify(path, &e, 0, 0))?;
    Ok(buf)
}

/// Flush the device's dirty buffers to stable storage
pub fn sync_device(path: &Path) -> Result<(), PipelineError> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .or_else(|_| File::open(path))
        .map_err(|e| classify(path, &e, 0, 0))?;
    file.sync_all().map_err(|e| classify(path, &e, 0, 0))
}

/// Translate an OS error on `path` into a pipeline error
///
/// `written` is the number of bytes already on the device and `image_size`
/// the number the write needed; both only matter for mid-write failures.
pub fn classify(path: &Path, err: &io::Error, written: u64, image_size: u64) -> PipelineError {
    let device = path.display().to_string();

    if err.kind() == io::ErrorKind::PermissionDenied {
        return PrivilegeError::AccessDenied { path: device }.into();
    }
    if is_busy(err) {
        return DeviceError::Busy { path: device }.into();
    }
    if is_no_space(err) {
        return ValidationError::DeviceTooSmall {
            device,
            device_size: written,
            image_size,
        }
        .into();
    }
    if err.kind() == io::ErrorKind::NotFound || is_gone(err) {
        return if written > 0 {
            DeviceError::Removed { path: device, written }.into()
        } else {
            DeviceError::Missing { path: device }.into()
        };
    }
    DeviceError::Io {
        path: device,
        error: err.to_string(),
    }
    .into()
}

#[cfg(unix)]
fn is_busy(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EBUSY)
}

#[cfg(unix)]
pub(crate) fn is_no_space(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ENOSPC | libc::EFBIG))
}

#[cfg(unix)]
fn is_gone(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENXIO | libc::ENODEV | libc::EIO)
    )
}

#[cfg(windows)]
fn is_busy(err: &io::Error) -> bool {
    // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
    matches!(err.raw_os_error(), Some(32 | 33))
}

#[cfg(windows)]
pub(crate) fn is_no_space(err: &io::Error) -> bool {
    // ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL
    matches!(err.raw_os_error(), Some(39 | 112))
}

#[cfg(windows)]
fn is_gone(err: &io::Error) -> bool {
    // ERROR_NOT_READY, ERROR_DEVICE_NOT_CONNECTED
    matches!(err.raw_os_error(), Some(21 | 1167))
}

#[cfg(not(any(unix, windows)))]
fn is_busy(_err: &io::Error) -> bool {
    false
}

#[cfg(not(any(unix, windows)))]
pub(crate) fn is_no_space(_err: &io::Error) -> bool {
    false
}

#[cfg(not(any(unix, windows)))]
fn is_gone(_err: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::NamedTempFile;

    #[test]
    fn test_device_size_of_regular_file() {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(4096).unwrap();
        assert_eq!(device_size(file.path()).unwrap(), 4096);
    }

    #[test]
    fn test_missing_device() {
        let err = device_size(Path::new("/nonexistent/dev/sdz")).unwrap_err();
        assert!(matches!(err, PipelineError::Device(DeviceError::Missing { .. })));
    }

    #[test]
    fn test_read_head_short_file() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"abc").unwrap();
        assert_eq!(read_head(file.path(), 512).unwrap(), b"abc");
    }

    #[test]
    fn test_classify_permission_denied() {
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(
            classify(Path::new("/dev/sdb"), &err, 0, 0).kind(),
            ErrorKind::PrivilegeError
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_os_codes() {
        let path = Path::new("/dev/sdb");
        let busy = io::Error::from_raw_os_error(libc::EBUSY);
        assert!(matches!(
            classify(path, &busy, 0, 0),
            PipelineError::Device(DeviceError::Busy { .. })
        ));

        let full = io::Error::from_raw_os_error(libc::ENOSPC);
        match classify(path, &full, 100, 200) {
            PipelineError::Validation(ValidationError::DeviceTooSmall {
                device_size,
                image_size,
                ..
            }) => {
                assert_eq!(device_size, 100);
                assert_eq!(image_size, 200);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let gone = io::Error::from_raw_os_error(libc::ENODEV);
        assert!(matches!(
            classify(path, &gone, 4096, 0),
            PipelineError::Device(DeviceError::Removed { written: 4096, .. })
        ));
    }
}
