use std::sync::{Arc, Mutex};

use crate::core::device::{DeviceKind, DeviceSource, StorageDeviceFacts};

type DeviceList = Arc<Mutex<Vec<StorageDeviceFacts>>>;

/// Handle used by tests and demos to plug devices in and out.
#[derive(Clone)]
pub struct Simulator {
    devices: DeviceList,
}

impl Simulator {
    /// Add a blank removable device of `size_gb` GiB.
    pub fn add_device(&self, id: &str, size_gb: u64) {
        self.insert(StorageDeviceFacts {
            id: id.to_string(),
            vendor: "Simulated".to_string(),
            model: format!("TEST_DEVICE_{}", id),
            size: size_gb * 1024 * 1024 * 1024,
            kind: DeviceKind::Removable,
            boot_device: false,
            partitions: Vec::new(),
        });
    }

    /// Add or replace a device with explicit facts.
    pub fn insert(&self, device: StorageDeviceFacts) {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        devices.retain(|d| d.id != device.id);
        devices.push(device);
    }

    pub fn remove_device(&self, id: &str) {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        devices.retain(|d| d.id != id);
    }
}

/// In-memory device source.
pub struct SimulatedSource {
    devices: DeviceList,
}

impl SimulatedSource {
    pub fn new() -> (Self, Simulator) {
        let devices: DeviceList = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                devices: devices.clone(),
            },
            Simulator { devices },
        )
    }
}

impl DeviceSource for SimulatedSource {
    fn list_devices(&self) -> anyhow::Result<Vec<StorageDeviceFacts>> {
        let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        Ok(devices.clone())
    }
}
