//! Device fact suppliers and filesystem probes.
//!
//! The decision engine never talks to the disk-management bus itself; it
//! consumes facts from a [`DeviceSource`] implemented here.

mod backup;
mod manifest;
mod simulated;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::core::device::DeviceSource;

pub use backup::probe_backup_destination;
pub use manifest::ManifestSource;
pub use simulated::{SimulatedSource, Simulator};

/// Pick the device source for this run.
///
/// With a manifest, facts are re-read from the file on every query so edits
/// between planning and execution are noticed. Without one, a simulated
/// source with three blank demo sticks is returned.
pub fn get_source(manifest: Option<&Path>) -> Result<Arc<dyn DeviceSource>> {
    match manifest {
        Some(path) => Ok(Arc::new(ManifestSource::open(path)?)),
        None => {
            let (source, controller) = SimulatedSource::new();
            controller.add_device("sim-1", 8);
            controller.add_device("sim-2", 16);
            controller.add_device("sim-3", 32);
            Ok(Arc::new(source))
        }
    }
}
