//! Feasibility pre-check for a batch.
//!
//! Every selected device is evaluated before anything is touched. A single
//! infeasible device rejects the whole batch; all reasons are collected so
//! the operator sees them in one message.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use tracing::debug;

use super::classifier::{PartitionLayoutState, classify_with_threshold};
use super::device::StorageDeviceFacts;
use super::numbering::AutoNumbering;
use super::repartition::{self, RepartitionRequest, RepartitionStrategy, SizingError};
use super::sizing::{BackupDestination, SizingParameters};
use super::upgrade::{EfiUpgradeVariant, SystemUpgradeVariant, UpgradeVerdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    Install,
    Upgrade,
    Reset,
}

impl fmt::Display for BatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Install => "install",
            Self::Upgrade => "upgrade",
            Self::Reset => "reset",
        })
    }
}

impl std::str::FromStr for BatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(Self::Install),
            "upgrade" => Ok(Self::Upgrade),
            "reset" => Ok(Self::Reset),
            other => Err(format!("unknown batch mode: {other}")),
        }
    }
}

/// Operator choices that only matter for upgrades.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeOptions {
    pub repartition: RepartitionRequest,
    pub auto_backup: bool,
    pub backup_destination: Option<BackupDestination>,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            repartition: RepartitionRequest::Keep,
            auto_backup: false,
            backup_destination: None,
        }
    }
}

/// Everything the coordinator needs besides the device list.
///
/// Owned by whoever starts the batch and passed down explicitly.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub mode: BatchMode,
    pub sizing: SizingParameters,
    pub upgrade: UpgradeOptions,
    pub numbering: AutoNumbering,
}

/// What will be done to one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DevicePlan {
    Install {
        layout: PartitionLayoutState,
    },
    Upgrade {
        verdict: UpgradeVerdict,
        exchange: RepartitionStrategy,
    },
    Reset {
        persistence: bool,
        exchange: bool,
    },
}

/// A device that passed admission, with its plan and numbering.
#[derive(Debug, Clone)]
pub struct AdmittedDevice {
    pub facts: StorageDeviceFacts,
    pub plan: DevicePlan,
    pub sequence_number: Option<u32>,
    pub exchange_label: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeasibilityError {
    #[error("No devices selected")]
    EmptyBatch,

    #[error("{device}: selected more than once")]
    DuplicateDevice { device: String },

    #[error("{device}: is the boot device of the running system")]
    BootDevice { device: String },

    #[error("{device}: too small ({available} bytes, {required} bytes required)")]
    DeviceTooSmall {
        device: String,
        required: u64,
        available: u64,
    },

    #[error("{device}: no installed system found, a full installation is required")]
    InstallationRequired { device: String },

    #[error("{device}: not enough space can be reclaimed for the upgrade")]
    UpgradeImpossible { device: String },

    #[error("{device}: upgrade needs a backup, but automatic backup is disabled")]
    BackupNotEnabled { device: String },

    #[error("{device}: {source}")]
    Sizing {
        device: String,
        #[source]
        source: SizingError,
    },
}

/// Evaluate one device. `index` is its zero-based position in the batch.
pub fn evaluate(
    device: &StorageDeviceFacts,
    index: usize,
    options: &BatchOptions,
) -> Result<AdmittedDevice, FeasibilityError> {
    if device.boot_device {
        return Err(FeasibilityError::BootDevice {
            device: device.id.clone(),
        });
    }

    let sequence_number = options.numbering.sequence_number(index);
    let numbered_label = |has_exchange: bool| {
        (has_exchange && options.numbering.enabled)
            .then(|| options.numbering.exchange_label(sequence_number))
    };

    let (plan, exchange_label) = match options.mode {
        BatchMode::Install => {
            let layout = evaluate_install(device, &options.sizing)?;
            // A freshly created exchange partition always needs a label; the
            // number is only appended when numbering is enabled.
            let label = (layout.exchange_size() > 0)
                .then(|| options.numbering.exchange_label(sequence_number));
            (DevicePlan::Install { layout }, label)
        }
        BatchMode::Upgrade => {
            let (verdict, exchange) = evaluate_upgrade(device, &options.sizing, &options.upgrade)?;
            let keeps_exchange = device.exchange_partition().is_some()
                && exchange != RepartitionStrategy::Remove;
            (
                DevicePlan::Upgrade { verdict, exchange },
                numbered_label(keeps_exchange),
            )
        }
        BatchMode::Reset => {
            if device.system_partition().is_none() {
                return Err(FeasibilityError::InstallationRequired {
                    device: device.id.clone(),
                });
            }
            let exchange = device.exchange_partition().is_some();
            (
                DevicePlan::Reset {
                    persistence: device.data_partition().is_some(),
                    exchange,
                },
                numbered_label(exchange),
            )
        }
    };

    debug!(device = %device.id, ?plan, "Device admitted");

    Ok(AdmittedDevice {
        facts: device.clone(),
        plan,
        sequence_number,
        exchange_label,
    })
}

fn evaluate_install(
    device: &StorageDeviceFacts,
    sizing: &SizingParameters,
) -> Result<PartitionLayoutState, FeasibilityError> {
    let layout = classify_with_threshold(
        device.size,
        sizing.efi_size,
        sizing.system_size,
        sizing.exchange_size,
        sizing.min_persistence_size,
    );
    if layout.is_too_small() {
        return Err(FeasibilityError::DeviceTooSmall {
            device: device.id.clone(),
            required: sizing.efi_size.saturating_add(sizing.system_size),
            available: device.size,
        });
    }
    Ok(layout)
}

fn evaluate_upgrade(
    device: &StorageDeviceFacts,
    sizing: &SizingParameters,
    upgrade: &UpgradeOptions,
) -> Result<(UpgradeVerdict, RepartitionStrategy), FeasibilityError> {
    let id = || device.id.clone();
    let (verdict, spare) =
        UpgradeVerdict::resolve_with_spare(device, sizing.enlarged_system_size(), sizing.efi_size);

    match verdict.system {
        SystemUpgradeVariant::InstallationRequired => {
            return Err(FeasibilityError::InstallationRequired { device: id() });
        }
        SystemUpgradeVariant::Impossible => {
            return Err(FeasibilityError::UpgradeImpossible { device: id() });
        }
        _ => {}
    }

    let backup = upgrade.backup_destination.as_ref();
    if verdict.requires_backup() {
        if !upgrade.auto_backup {
            return Err(FeasibilityError::BackupNotEnabled { device: id() });
        }
        let Some(destination) = backup.filter(|b| b.is_valid()) else {
            return Err(FeasibilityError::Sizing {
                device: id(),
                source: SizingError::NoBackupDestination,
            });
        };
        let required = backup_payload(device, &verdict);
        if !destination.has_room_for(required) {
            return Err(FeasibilityError::Sizing {
                device: id(),
                source: SizingError::InsufficientBackupSpace {
                    required,
                    available: destination.free_space.unwrap_or(0),
                },
            });
        }
    }

    let exchange = match device.exchange_partition() {
        Some(partition) => repartition::plan(
            &upgrade.repartition,
            partition.size.saturating_sub(spare.exchange_taken),
            spare.unallocated,
            verdict.efi,
            backup,
        )
        .map_err(|source| FeasibilityError::Sizing {
            device: id(),
            source,
        })?,
        None => {
            if upgrade.repartition != RepartitionRequest::Keep {
                debug!(device = %device.id, "No exchange partition, ignoring repartition request");
            }
            RepartitionStrategy::Keep
        }
    };

    Ok((verdict, exchange))
}

/// Bytes that must be moved off the device for a backup cycle. Unknown
/// usage counts as a full partition.
fn backup_payload(device: &StorageDeviceFacts, verdict: &UpgradeVerdict) -> u64 {
    let used = |p: &super::device::Partition| p.used.unwrap_or(p.size);
    let mut payload = 0u64;
    if verdict.requires_backup() {
        payload = payload.saturating_add(device.data_partition().map(used).unwrap_or(0));
    }
    if verdict.efi == EfiUpgradeVariant::EnlargeRequiresBackup {
        payload = payload.saturating_add(device.exchange_partition().map(used).unwrap_or(0));
    }
    payload
}

/// Evaluate all devices. Returns every admitted device in order, or every
/// reason the batch cannot start.
pub fn admit(
    devices: &[StorageDeviceFacts],
    options: &BatchOptions,
) -> Result<Vec<AdmittedDevice>, Vec<FeasibilityError>> {
    if devices.is_empty() {
        return Err(vec![FeasibilityError::EmptyBatch]);
    }

    let mut seen = HashSet::new();
    let mut admitted = Vec::with_capacity(devices.len());
    let mut errors = Vec::new();

    for (index, device) in devices.iter().enumerate() {
        if !seen.insert(device.id.as_str()) {
            errors.push(FeasibilityError::DuplicateDevice {
                device: device.id.clone(),
            });
            continue;
        }
        match evaluate(device, index, options) {
            Ok(ok) => admitted.push(ok),
            Err(e) => errors.push(e),
        }
    }

    if errors.is_empty() {
        Ok(admitted)
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::fixtures::*;
    use std::path::PathBuf;

    fn options(mode: BatchMode) -> BatchOptions {
        BatchOptions {
            mode,
            sizing: SizingParameters {
                system_size: 3 * GIB,
                efi_size: 256 * MIB,
                exchange_size: None,
                upgrade_margin_percent: 10,
                min_persistence_size: GIB,
            },
            upgrade: UpgradeOptions::default(),
            numbering: AutoNumbering::default(),
        }
    }

    fn installed(id: &str, data_used: Option<u64>) -> StorageDeviceFacts {
        device(
            id,
            16 * GIB,
            vec![efi(256 * MIB), data(12 * GIB, data_used), system(16 * GIB - 256 * MIB - 12 * GIB)],
        )
    }

    #[test]
    fn test_install_admits_large_devices() {
        let devices = vec![device("a", 4 * GIB, vec![]), device("b", 16 * GIB, vec![])];
        let admitted = admit(&devices, &options(BatchMode::Install)).unwrap();
        assert_eq!(admitted.len(), 2);
        assert_eq!(
            admitted[0].plan,
            DevicePlan::Install {
                layout: PartitionLayoutState::SystemOnly
            }
        );
        assert!(matches!(
            admitted[1].plan,
            DevicePlan::Install {
                layout: PartitionLayoutState::WithPersistence { .. }
            }
        ));
    }

    #[test]
    fn test_one_small_device_rejects_batch() {
        let devices = vec![
            device("ok", 16 * GIB, vec![]),
            device("tiny", 2 * GIB, vec![]),
            device("ok2", 16 * GIB, vec![]),
        ];
        let errors = admit(&devices, &options(BatchMode::Install)).unwrap_err();
        assert_eq!(
            errors,
            vec![FeasibilityError::DeviceTooSmall {
                device: "tiny".into(),
                required: 3 * GIB + 256 * MIB,
                available: 2 * GIB,
            }]
        );
    }

    #[test]
    fn test_empty_and_duplicate_selection() {
        assert_eq!(
            admit(&[], &options(BatchMode::Install)).unwrap_err(),
            vec![FeasibilityError::EmptyBatch]
        );

        let dev = device("a", 16 * GIB, vec![]);
        let errors = admit(&[dev.clone(), dev], &options(BatchMode::Install)).unwrap_err();
        assert_eq!(
            errors,
            vec![FeasibilityError::DuplicateDevice { device: "a".into() }]
        );
    }

    #[test]
    fn test_boot_device_is_never_admitted() {
        let mut dev = device("boot", 64 * GIB, vec![]);
        dev.boot_device = true;
        for mode in [BatchMode::Install, BatchMode::Upgrade, BatchMode::Reset] {
            assert_eq!(
                evaluate(&dev, 0, &options(mode)).unwrap_err(),
                FeasibilityError::BootDevice {
                    device: "boot".into()
                }
            );
        }
    }

    #[test]
    fn test_install_exchange_gets_numbered_label() {
        let mut opts = options(BatchMode::Install);
        opts.sizing.exchange_size = Some(2 * GIB);
        opts.numbering = AutoNumbering {
            enabled: true,
            start: 10,
            increment: 1,
            label_pattern: "Lab-{n}".into(),
        };
        let admitted = evaluate(&device("a", 16 * GIB, vec![]), 2, &opts).unwrap();
        assert_eq!(admitted.sequence_number, Some(12));
        assert_eq!(admitted.exchange_label.as_deref(), Some("Lab-12"));
    }

    #[test]
    fn test_install_exchange_label_without_numbering() {
        let mut opts = options(BatchMode::Install);
        opts.sizing.exchange_size = Some(2 * GIB);
        let admitted = evaluate(&device("a", 16 * GIB, vec![]), 2, &opts).unwrap();
        assert_eq!(admitted.sequence_number, None);
        assert_eq!(admitted.exchange_label.as_deref(), Some("Exchange"));

        opts.sizing.exchange_size = None;
        let admitted = evaluate(&device("a", 16 * GIB, vec![]), 2, &opts).unwrap();
        assert_eq!(admitted.exchange_label, None);
    }

    #[test]
    fn test_upgrade_of_blank_device_requires_installation() {
        let err = evaluate(&device("blank", 16 * GIB, vec![]), 0, &options(BatchMode::Upgrade))
            .unwrap_err();
        assert_eq!(
            err,
            FeasibilityError::InstallationRequired {
                device: "blank".into()
            }
        );
    }

    #[test]
    fn test_upgrade_regular() {
        let admitted = evaluate(&installed("a", None), 0, &options(BatchMode::Upgrade)).unwrap();
        match admitted.plan {
            DevicePlan::Upgrade { verdict, exchange } => {
                assert_eq!(verdict.system, SystemUpgradeVariant::Regular);
                assert_eq!(verdict.efi, EfiUpgradeVariant::Regular);
                assert_eq!(exchange, RepartitionStrategy::Keep);
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn test_upgrade_backup_needs_option_and_destination() {
        let mut opts = options(BatchMode::Upgrade);
        opts.sizing.system_size = 8 * GIB;
        let dev = installed("a", Some(12 * GIB));

        assert_eq!(
            evaluate(&dev, 0, &opts).unwrap_err(),
            FeasibilityError::BackupNotEnabled { device: "a".into() }
        );

        opts.upgrade.auto_backup = true;
        assert_eq!(
            evaluate(&dev, 0, &opts).unwrap_err(),
            FeasibilityError::Sizing {
                device: "a".into(),
                source: SizingError::NoBackupDestination
            }
        );

        opts.upgrade.backup_destination = Some(BackupDestination {
            path: PathBuf::from("/mnt/backup"),
            exists: true,
            writable: true,
            free_space: None,
        });
        let admitted = evaluate(&dev, 0, &opts).unwrap();
        assert!(matches!(
            admitted.plan,
            DevicePlan::Upgrade { verdict, .. } if verdict.system == SystemUpgradeVariant::Backup
        ));
    }

    #[test]
    fn test_upgrade_backup_destination_must_hold_data() {
        let mut opts = options(BatchMode::Upgrade);
        opts.sizing.system_size = 8 * GIB;
        opts.upgrade.auto_backup = true;
        opts.upgrade.backup_destination = Some(BackupDestination {
            path: PathBuf::from("/mnt/backup"),
            exists: true,
            writable: true,
            free_space: Some(GIB),
        });
        let dev = installed("a", Some(12 * GIB));

        assert_eq!(
            evaluate(&dev, 0, &opts).unwrap_err(),
            FeasibilityError::Sizing {
                device: "a".into(),
                source: SizingError::InsufficientBackupSpace {
                    required: 12 * GIB,
                    available: GIB,
                }
            }
        );

        if let Some(dest) = opts.upgrade.backup_destination.as_mut() {
            dest.free_space = Some(12 * GIB);
        }
        assert!(evaluate(&dev, 0, &opts).is_ok());
    }

    #[test]
    fn test_upgrade_efi_and_system_share_unallocated_space() {
        // System growth needs every unallocated byte; EFI growth must not
        // count them again.
        let dev = device(
            "a",
            16 * GIB,
            vec![efi(100 * MIB), data(12 * GIB, Some(12 * GIB)), system(3 * GIB)],
        );
        let mut opts = options(BatchMode::Upgrade);
        opts.sizing.upgrade_margin_percent = 0;
        opts.sizing.system_size = 3 * GIB + dev.unallocated();

        assert_eq!(
            evaluate(&dev, 0, &opts).unwrap_err(),
            FeasibilityError::BackupNotEnabled { device: "a".into() }
        );

        opts.upgrade.auto_backup = true;
        opts.upgrade.backup_destination = Some(BackupDestination {
            path: PathBuf::from("/mnt/backup"),
            exists: true,
            writable: true,
            free_space: None,
        });
        let admitted = evaluate(&dev, 0, &opts).unwrap();
        match admitted.plan {
            DevicePlan::Upgrade { verdict, .. } => {
                assert_eq!(verdict.system, SystemUpgradeVariant::Repartition);
                assert_eq!(verdict.efi, EfiUpgradeVariant::EnlargeRequiresBackup);
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn test_upgrade_exchange_resize_uses_space_left_by_system() {
        let dev = device(
            "x",
            16 * GIB,
            vec![efi(256 * MIB), exchange(2 * GIB, None), data(8 * GIB, None), system(4 * GIB)],
        );
        let mut opts = options(BatchMode::Upgrade);
        opts.sizing.upgrade_margin_percent = 0;
        opts.sizing.system_size = 5 * GIB;
        opts.upgrade.repartition = RepartitionRequest::Resize((3 * GIB).to_string());

        assert_eq!(
            evaluate(&dev, 0, &opts).unwrap_err(),
            FeasibilityError::Sizing {
                device: "x".into(),
                source: SizingError::ExceedsAvailable {
                    requested: 3 * GIB,
                    available: 2 * GIB + 768 * MIB,
                }
            }
        );

        opts.upgrade.repartition = RepartitionRequest::Resize((2 * GIB + 768 * MIB).to_string());
        assert!(evaluate(&dev, 0, &opts).is_ok());
    }

    #[test]
    fn test_upgrade_impossible() {
        let mut opts = options(BatchMode::Upgrade);
        opts.sizing.system_size = 32 * GIB;
        assert_eq!(
            evaluate(&installed("a", None), 0, &opts).unwrap_err(),
            FeasibilityError::UpgradeImpossible { device: "a".into() }
        );
    }

    #[test]
    fn test_upgrade_exchange_resize_is_validated() {
        let mut opts = options(BatchMode::Upgrade);
        let dev = device(
            "x",
            16 * GIB,
            vec![efi(256 * MIB), exchange(2 * GIB, None), data(8 * GIB, None), system(4 * GIB)],
        );

        opts.upgrade.repartition = RepartitionRequest::Resize("abc".into());
        assert_eq!(
            evaluate(&dev, 0, &opts).unwrap_err(),
            FeasibilityError::Sizing {
                device: "x".into(),
                source: SizingError::UnparsableSize("abc".into())
            }
        );

        opts.upgrade.repartition = RepartitionRequest::Resize(GIB.to_string());
        let admitted = evaluate(&dev, 0, &opts).unwrap();
        assert!(matches!(
            admitted.plan,
            DevicePlan::Upgrade { exchange: RepartitionStrategy::Resize(size), .. } if size == GIB
        ));
    }

    #[test]
    fn test_reset_requires_installed_system() {
        let opts = options(BatchMode::Reset);
        assert!(matches!(
            evaluate(&device("blank", GIB, vec![]), 0, &opts),
            Err(FeasibilityError::InstallationRequired { .. })
        ));
        let admitted = evaluate(&installed("a", None), 0, &opts).unwrap();
        assert_eq!(
            admitted.plan,
            DevicePlan::Reset {
                persistence: true,
                exchange: false
            }
        );
    }
}
