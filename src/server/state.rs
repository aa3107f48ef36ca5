//! Shared server state

use std::sync::Arc;

use crate::core::device::DeviceInventory;
use crate::core::orchestrator::Orchestrator;

/// State handed to every handler
#[derive(Clone)]
pub struct AppState {
    /// Starts pipeline runs; owns the in-flight registry
    pub orchestrator: Orchestrator,
    /// Device enumeration for `/api/devices`
    pub inventory: Arc<dyn DeviceInventory>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, inventory: Arc<dyn DeviceInventory>) -> Self {
        Self {
            orchestrator,
            inventory,
        }
    }
}
