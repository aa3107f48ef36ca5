//! In-flight device registry
//!
//! Runs targeting the same device are mutually exclusive. The registry is an
//! explicit object handed to the orchestrator; a successful claim returns a
//! [`DeviceClaim`] that releases the identifier when dropped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::core::device::normalize_identifier;
use crate::error::PipelineError;

/// Set of device identifiers currently being imaged
pub trait InFlightRegistry: Send + Sync {
    /// Insert an identifier; `false` when it is already present
    fn try_insert(&self, identifier: &str) -> bool;

    /// Remove an identifier
    fn remove(&self, identifier: &str);

    /// Whether an identifier is present
    fn contains(&self, identifier: &str) -> bool;
}

/// Mutex-guarded registry used by the server and CLI
#[derive(Debug, Default)]
pub struct InFlightDevices {
    devices: Mutex<HashSet<String>>,
}

impl InFlightDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of devices currently claimed
    pub fn len(&self) -> usize {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InFlightRegistry for InFlightDevices {
    fn try_insert(&self, identifier: &str) -> bool {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(normalize_identifier(identifier))
    }

    fn remove(&self, identifier: &str) {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&normalize_identifier(identifier));
    }

    fn contains(&self, identifier: &str) -> bool {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&normalize_identifier(identifier))
    }
}

/// Exclusive claim on a device, released on drop
pub struct DeviceClaim {
    registry: Arc<dyn InFlightRegistry>,
    identifier: String,
}

impl DeviceClaim {
    /// Claim a device or fail with a conflict
    pub fn acquire(
        registry: &Arc<dyn InFlightRegistry>,
        identifier: &str,
    ) -> Result<Self, PipelineError> {
        if !registry.try_insert(identifier) {
            return Err(PipelineError::Conflict {
                device: identifier.to_string(),
            });
        }
        debug!("Claimed {}", identifier);
        Ok(Self {
            registry: Arc::clone(registry),
            identifier: identifier.to_string(),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.registry.remove(&self.identifier);
        debug!("Released {}", self.identifier);
    }
}

impl std::fmt::Debug for DeviceClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClaim")
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<dyn InFlightRegistry> {
        Arc::new(InFlightDevices::new())
    }

    #[test]
    fn test_second_claim_conflicts() {
        let reg = registry();
        let _first = DeviceClaim::acquire(&reg, "/dev/sdb").unwrap();
        let second = DeviceClaim::acquire(&reg, "/dev/sdb");
        assert!(matches!(second, Err(PipelineError::Conflict { .. })));
    }

    #[test]
    fn test_claim_released_on_drop() {
        let reg = registry();
        {
            let _claim = DeviceClaim::acquire(&reg, "/dev/sdb").unwrap();
            assert!(reg.contains("/dev/sdb"));
        }
        assert!(!reg.contains("/dev/sdb"));
        assert!(DeviceClaim::acquire(&reg, "/dev/sdb").is_ok());
    }

    #[test]
    fn test_raw_alias_conflicts() {
        let reg = registry();
        let _claim = DeviceClaim::acquire(&reg, "/dev/disk4").unwrap();
        assert!(DeviceClaim::acquire(&reg, "/dev/rdisk4").is_err());
    }

    #[test]
    fn test_different_devices_coexist() {
        let reg = registry();
        let _a = DeviceClaim::acquire(&reg, "/dev/sdb").unwrap();
        let _b = DeviceClaim::acquire(&reg, "/dev/sdc").unwrap();
        assert!(reg.contains("/dev/sdb") && reg.contains("/dev/sdc"));
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let reg = registry();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || DeviceClaim::acquire(&reg, "/dev/sdb").ok())
            })
            .collect();
        let claims: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(claims.len(), 1);
    }
}
