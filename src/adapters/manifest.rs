use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::device::{DeviceSource, StorageDeviceFacts};

#[derive(Deserialize)]
struct Manifest {
    #[serde(default, rename = "device")]
    devices: Vec<StorageDeviceFacts>,
}

/// Device facts read from a TOML manifest, one `[[device]]` table per device.
///
/// ```toml
/// [[device]]
/// id = "usb-1"
/// size = 16000000000
/// kind = "removable"
///
/// [[device.partitions]]
/// number = 1
/// offset = 1048576
/// size = 268435456
/// filesystem = "vfat"
/// roles = { efi = true }
/// ```
pub struct ManifestSource {
    path: PathBuf,
}

impl ManifestSource {
    /// Open a manifest, failing early if it cannot be parsed.
    pub fn open(path: &Path) -> Result<Self> {
        let source = Self {
            path: path.to_path_buf(),
        };
        source.read()?;
        Ok(source)
    }

    fn read(&self) -> Result<Vec<StorageDeviceFacts>> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read device manifest {}", self.path.display()))?;
        let manifest: Manifest = toml::from_str(&content)
            .with_context(|| format!("Failed to parse device manifest {}", self.path.display()))?;
        debug!(
            path = %self.path.display(),
            devices = manifest.devices.len(),
            "Loaded device manifest"
        );
        Ok(manifest.devices)
    }
}

impl DeviceSource for ManifestSource {
    fn list_devices(&self) -> Result<Vec<StorageDeviceFacts>> {
        self.read()
    }
}
