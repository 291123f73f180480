use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Sizes that drive feasibility decisions for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizingParameters {
    /// Size of the system image taken from the installation source.
    pub system_size: u64,
    pub efi_size: u64,
    /// Exchange partition requested by the operator (install only).
    pub exchange_size: Option<u64>,
    /// Headroom added to `system_size` for upgrade comparisons, in percent.
    pub upgrade_margin_percent: u32,
    /// Smallest surplus that becomes a persistence partition.
    pub min_persistence_size: u64,
}

impl SizingParameters {
    pub fn enlarged_system_size(&self) -> u64 {
        let percent = u64::from(self.upgrade_margin_percent);
        let margin = (self.system_size / 100)
            .saturating_mul(percent)
            .saturating_add(self.system_size % 100 * percent / 100);
        self.system_size.saturating_add(margin)
    }
}

/// Pre-validated facts about the automatic backup destination.
///
/// The probing itself happens outside the decision engine; see
/// [`crate::adapters::probe_backup_destination`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDestination {
    pub path: PathBuf,
    pub exists: bool,
    pub writable: bool,
    /// Free bytes on the destination filesystem, `None` if it could not be
    /// determined.
    pub free_space: Option<u64>,
}

impl BackupDestination {
    pub fn is_valid(&self) -> bool {
        !self.path.as_os_str().is_empty() && self.exists && self.writable
    }

    /// Whether `bytes` fit on the destination. Unknown free space is not
    /// held against it.
    pub fn has_room_for(&self, bytes: u64) -> bool {
        self.free_space.is_none_or(|free| free >= bytes)
    }
}
