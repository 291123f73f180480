//! Capacity classification of install targets.
//!
//! Pure function of the device size and the requested partition sizes. The
//! result is consumed by the coordinator for admission and by views for
//! layout previews.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Partition layout a device can host for a given image size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PartitionLayoutState {
    /// The device cannot even hold EFI + system; `missing` bytes are lacking.
    TooSmall { missing: u64 },
    /// EFI + system fit, with no surplus worth a persistence partition.
    SystemOnly,
    /// Surplus space becomes a persistence partition.
    WithPersistence { persistence: u64 },
    /// Operator-elected exchange partition plus persistence in the remainder.
    WithExchangeAndPersistence { exchange: u64, persistence: u64 },
}

impl PartitionLayoutState {
    pub fn is_too_small(&self) -> bool {
        matches!(self, Self::TooSmall { .. })
    }

    pub fn exchange_size(&self) -> u64 {
        match self {
            Self::WithExchangeAndPersistence { exchange, .. } => *exchange,
            _ => 0,
        }
    }

    pub fn persistence_size(&self) -> u64 {
        match self {
            Self::WithPersistence { persistence }
            | Self::WithExchangeAndPersistence { persistence, .. } => *persistence,
            _ => 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::TooSmall { .. } => "too small",
            Self::SystemOnly => "system only",
            Self::WithPersistence { .. } => "with persistence",
            Self::WithExchangeAndPersistence { .. } => "with exchange and persistence",
        }
    }
}

/// Smallest surplus that is worth a persistence partition.
pub const DEFAULT_MIN_PERSISTENCE_SIZE: u64 = 1024 * 1024 * 1024;

/// Classify a device against the required sizes using the default
/// persistence threshold.
pub fn classify(
    device_size: u64,
    efi_size: u64,
    system_size: u64,
    exchange_size: Option<u64>,
) -> PartitionLayoutState {
    classify_with_threshold(
        device_size,
        efi_size,
        system_size,
        exchange_size,
        DEFAULT_MIN_PERSISTENCE_SIZE,
    )
}

/// Classify a device against the required sizes.
///
/// An exchange request that does not fit next to EFI and system is clamped
/// to zero, so the device degrades to a layout without exchange partition.
/// Without exchange partition, a surplus below `min_persistence` is left
/// unused and the device is `SystemOnly`.
pub fn classify_with_threshold(
    device_size: u64,
    efi_size: u64,
    system_size: u64,
    exchange_size: Option<u64>,
    min_persistence: u64,
) -> PartitionLayoutState {
    let required = efi_size.saturating_add(system_size);
    if device_size < required {
        return PartitionLayoutState::TooSmall {
            missing: required - device_size,
        };
    }

    let surplus = device_size - required;
    let exchange = match exchange_size {
        Some(size) if size > 0 && size <= surplus => size,
        Some(size) if size > 0 => {
            debug!(
                requested = size,
                available = surplus,
                "Exchange partition does not fit, clamping to zero"
            );
            0
        }
        _ => 0,
    };

    if exchange > 0 {
        return PartitionLayoutState::WithExchangeAndPersistence {
            exchange,
            persistence: surplus - exchange,
        };
    }

    if surplus == 0 || surplus < min_persistence {
        PartitionLayoutState::SystemOnly
    } else {
        PartitionLayoutState::WithPersistence {
            persistence: surplus,
        }
    }
}
