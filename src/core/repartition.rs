//! Exchange partition strategy for upgrades.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::sizing::BackupDestination;
use super::upgrade::EfiUpgradeVariant;

/// Operator request, as entered. `Resize` carries the raw size text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "size", rename_all = "snake_case")]
pub enum RepartitionRequest {
    Keep,
    Resize(String),
    Remove,
}

/// Validated strategy for the exchange partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "size", rename_all = "snake_case")]
pub enum RepartitionStrategy {
    Keep,
    Resize(u64),
    Remove,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SizingError {
    #[error("No exchange partition size given")]
    EmptySize,

    #[error("Invalid exchange partition size: {0:?}")]
    UnparsableSize(String),

    #[error("Exchange partition size {requested} exceeds the available {available} bytes")]
    ExceedsAvailable { requested: u64, available: u64 },

    #[error("No valid backup destination")]
    NoBackupDestination,

    #[error("Backup needs {required} bytes, destination has {available} bytes free")]
    InsufficientBackupSpace { required: u64, available: u64 },
}

/// Validate an exchange partition request.
///
/// `backup` is the pre-validated backup destination, if the operator set one.
pub fn plan(
    request: &RepartitionRequest,
    current_exchange_size: u64,
    free_space: u64,
    efi_variant: EfiUpgradeVariant,
    backup: Option<&BackupDestination>,
) -> Result<RepartitionStrategy, SizingError> {
    let raw = match request {
        RepartitionRequest::Keep => return Ok(RepartitionStrategy::Keep),
        RepartitionRequest::Remove => return Ok(RepartitionStrategy::Remove),
        RepartitionRequest::Resize(raw) => raw.trim(),
    };

    let size = parse_size(raw)?;

    let available = current_exchange_size.saturating_add(free_space);
    if size > available {
        return Err(SizingError::ExceedsAvailable {
            requested: size,
            available,
        });
    }

    if efi_variant == EfiUpgradeVariant::EnlargeRequiresBackup
        && !backup.is_some_and(BackupDestination::is_valid)
    {
        return Err(SizingError::NoBackupDestination);
    }

    Ok(RepartitionStrategy::Resize(size))
}

/// Parse a strictly positive byte count.
pub fn parse_size(raw: &str) -> Result<u64, SizingError> {
    if raw.is_empty() {
        return Err(SizingError::EmptySize);
    }
    if !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SizingError::UnparsableSize(raw.to_string()));
    }
    match raw.parse::<u64>() {
        Ok(size) if size > 0 => Ok(size),
        _ => Err(SizingError::UnparsableSize(raw.to_string())),
    }
}
