//! In-place upgrade feasibility.
//!
//! Two independent axes are evaluated: whether the system partition can hold
//! the enlarged image, and whether the EFI partition is large enough. The
//! caller combines both into an [`UpgradeVerdict`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::device::StorageDeviceFacts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemUpgradeVariant {
    /// The existing system partition already holds the enlarged image.
    Regular,
    /// Unallocated space or shrinkable data makes room without a backup.
    Repartition,
    /// The data partition must be backed up and restored to make room.
    Backup,
    /// Nothing to upgrade; the device needs a fresh installation.
    InstallationRequired,
    /// No combination of reclaimed space is sufficient.
    Impossible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EfiUpgradeVariant {
    Regular,
    EnlargeRequiresRepartition,
    EnlargeRequiresBackup,
}

/// Resolve how the system partition of `device` can be upgraded.
///
/// Rules are evaluated in order, first match wins:
/// no system and no data partition, system already large enough, deficit
/// covered by unallocated space plus shrinkable data slack, deficit covered
/// by reclaiming the whole data partition, otherwise impossible.
pub fn resolve_system_variant(
    device: &StorageDeviceFacts,
    enlarged_system_size: u64,
) -> SystemUpgradeVariant {
    let system = device.system_partition();
    let data = device.data_partition();

    if system.is_none() && data.is_none() {
        return SystemUpgradeVariant::InstallationRequired;
    }

    let current = system.map(|p| p.size).unwrap_or(0);
    if current >= enlarged_system_size {
        return SystemUpgradeVariant::Regular;
    }

    let deficit = enlarged_system_size - current;
    let unallocated = device.unallocated();
    let slack = data
        .filter(|p| p.is_shrinkable())
        .map(|p| p.slack())
        .unwrap_or(0);

    debug!(
        device = %device.id,
        deficit,
        unallocated,
        data_slack = slack,
        "System partition too small for upgrade"
    );

    if unallocated.saturating_add(slack) >= deficit {
        return SystemUpgradeVariant::Repartition;
    }

    if let Some(data) = data {
        if unallocated.saturating_add(data.size) >= deficit {
            return SystemUpgradeVariant::Backup;
        }
    }

    SystemUpgradeVariant::Impossible
}

/// Resolve how the EFI partition can reach `required_efi_size`.
///
/// `reclaimable` is the space that can be handed to the EFI partition
/// without destroying data. A missing EFI partition counts as size zero.
/// This never yields an impossible verdict: at worst a backup cycle is needed.
pub fn resolve_efi_variant(
    current_efi_size: u64,
    required_efi_size: u64,
    reclaimable: u64,
) -> EfiUpgradeVariant {
    if current_efi_size >= required_efi_size {
        EfiUpgradeVariant::Regular
    } else if reclaimable >= required_efi_size - current_efi_size {
        EfiUpgradeVariant::EnlargeRequiresRepartition
    } else {
        EfiUpgradeVariant::EnlargeRequiresBackup
    }
}

/// Unallocated space the system partition takes for `variant`.
///
/// Growth is served from unallocated space first; whatever is missing comes
/// from the data partition.
fn system_claim(
    device: &StorageDeviceFacts,
    enlarged_system_size: u64,
    variant: SystemUpgradeVariant,
) -> u64 {
    match variant {
        SystemUpgradeVariant::Repartition | SystemUpgradeVariant::Backup => {
            let current = device.system_partition().map(|p| p.size).unwrap_or(0);
            enlarged_system_size
                .saturating_sub(current)
                .min(device.unallocated())
        }
        _ => 0,
    }
}

/// Space still free for the exchange partition after the system and EFI
/// partitions have claimed theirs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpareSpace {
    /// Unallocated bytes nobody claimed.
    pub unallocated: u64,
    /// Bytes the EFI partition takes out of the exchange partition.
    pub exchange_taken: u64,
}

/// Combined verdict of both upgrade axes for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeVerdict {
    pub system: SystemUpgradeVariant,
    pub efi: EfiUpgradeVariant,
}

impl UpgradeVerdict {
    pub fn resolve(
        device: &StorageDeviceFacts,
        enlarged_system_size: u64,
        required_efi_size: u64,
    ) -> Self {
        Self::resolve_with_spare(device, enlarged_system_size, required_efi_size).0
    }

    /// Resolve both axes against one shared space budget.
    ///
    /// The system partition claims unallocated space first. The EFI partition
    /// may only use what is left plus free space inside the exchange
    /// partition; if that is not enough it needs a backup cycle.
    pub fn resolve_with_spare(
        device: &StorageDeviceFacts,
        enlarged_system_size: u64,
        required_efi_size: u64,
    ) -> (Self, SpareSpace) {
        let system = resolve_system_variant(device, enlarged_system_size);
        let mut unallocated = device
            .unallocated()
            .saturating_sub(system_claim(device, enlarged_system_size, system));

        let current_efi = device.efi_partition().map(|p| p.size).unwrap_or(0);
        let exchange_slack = device.exchange_partition().map(|p| p.slack()).unwrap_or(0);
        let efi = resolve_efi_variant(
            current_efi,
            required_efi_size,
            unallocated.saturating_add(exchange_slack),
        );

        let mut exchange_taken = 0;
        if efi == EfiUpgradeVariant::EnlargeRequiresRepartition {
            let deficit = required_efi_size - current_efi;
            let from_unallocated = deficit.min(unallocated);
            unallocated -= from_unallocated;
            exchange_taken = deficit - from_unallocated;
        }

        debug!(
            device = %device.id,
            ?system,
            ?efi,
            spare = unallocated,
            exchange_taken,
            "Resolved upgrade verdict"
        );

        (
            Self { system, efi },
            SpareSpace {
                unallocated,
                exchange_taken,
            },
        )
    }

    /// Whether either axis requires the automatic backup option.
    pub fn requires_backup(&self) -> bool {
        self.system == SystemUpgradeVariant::Backup
            || self.efi == EfiUpgradeVariant::EnlargeRequiresBackup
    }

    /// Whether the system axis rules the upgrade out entirely.
    pub fn is_blocked(&self) -> bool {
        matches!(
            self.system,
            SystemUpgradeVariant::Impossible | SystemUpgradeVariant::InstallationRequired
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::fixtures::*;

    const ENLARGED: u64 = 4 * GIB;

    #[test]
    fn test_blank_device_requires_installation() {
        let dev = device("blank", 16 * GIB, vec![]);
        assert_eq!(
            resolve_system_variant(&dev, ENLARGED),
            SystemUpgradeVariant::InstallationRequired
        );
    }

    #[test]
    fn test_large_system_partition_is_regular() {
        let dev = device(
            "d",
            16 * GIB,
            vec![efi(256 * MIB), data(8 * GIB, None), system(5 * GIB)],
        );
        assert_eq!(
            resolve_system_variant(&dev, ENLARGED),
            SystemUpgradeVariant::Regular
        );
    }

    #[test]
    fn test_unallocated_space_allows_repartition() {
        let dev = device(
            "d",
            16 * GIB,
            vec![efi(256 * MIB), data(8 * GIB, None), system(3 * GIB)],
        );
        assert_eq!(
            resolve_system_variant(&dev, ENLARGED),
            SystemUpgradeVariant::Repartition
        );
    }

    #[test]
    fn test_data_slack_allows_repartition() {
        // Device fully allocated, but the data partition is mostly empty.
        let dev = device(
            "d",
            16 * GIB,
            vec![efi(GIB), data(12 * GIB, Some(2 * GIB)), system(3 * GIB)],
        );
        assert_eq!(
            resolve_system_variant(&dev, ENLARGED),
            SystemUpgradeVariant::Repartition
        );
    }

    #[test]
    fn test_full_data_partition_needs_backup() {
        let dev = device(
            "d",
            16 * GIB,
            vec![efi(GIB), data(12 * GIB, Some(12 * GIB)), system(3 * GIB)],
        );
        assert_eq!(
            resolve_system_variant(&dev, ENLARGED),
            SystemUpgradeVariant::Backup
        );
    }

    #[test]
    fn test_unknown_usage_needs_backup() {
        let dev = device(
            "d",
            16 * GIB,
            vec![efi(GIB), data(12 * GIB, None), system(3 * GIB)],
        );
        assert_eq!(
            resolve_system_variant(&dev, ENLARGED),
            SystemUpgradeVariant::Backup
        );
    }

    #[test]
    fn test_non_shrinkable_data_needs_backup() {
        let mut persistence = data(12 * GIB, Some(GIB));
        persistence.filesystem = "btrfs".into();
        let dev = device("d", 16 * GIB, vec![efi(GIB), persistence, system(3 * GIB)]);
        assert_eq!(
            resolve_system_variant(&dev, ENLARGED),
            SystemUpgradeVariant::Backup
        );
    }

    #[test]
    fn test_nothing_to_reclaim_is_impossible() {
        let dev = device(
            "d",
            4 * GIB,
            vec![efi(GIB), data(512 * MIB, None), system(2 * GIB + 512 * MIB)],
        );
        assert_eq!(
            resolve_system_variant(&dev, 8 * GIB),
            SystemUpgradeVariant::Impossible
        );
    }

    #[test]
    fn test_system_without_data_and_no_space_is_impossible() {
        let dev = device("d", 3 * GIB + 256 * MIB, vec![efi(256 * MIB), system(3 * GIB)]);
        assert_eq!(
            resolve_system_variant(&dev, ENLARGED),
            SystemUpgradeVariant::Impossible
        );
    }

    #[test]
    fn test_efi_variants_prefer_regular_then_repartition() {
        assert_eq!(
            resolve_efi_variant(256 * MIB, 256 * MIB, 0),
            EfiUpgradeVariant::Regular
        );
        assert_eq!(
            resolve_efi_variant(100 * MIB, 256 * MIB, 156 * MIB),
            EfiUpgradeVariant::EnlargeRequiresRepartition
        );
        assert_eq!(
            resolve_efi_variant(100 * MIB, 256 * MIB, 155 * MIB),
            EfiUpgradeVariant::EnlargeRequiresBackup
        );
    }

    #[test]
    fn test_verdict_uses_exchange_slack_for_efi() {
        let dev = device(
            "d",
            16 * GIB,
            vec![
                efi(100 * MIB),
                exchange(4 * GIB, Some(GIB)),
                data(8 * GIB, None),
                system(16 * GIB - 100 * MIB - 12 * GIB),
            ],
        );
        let verdict = UpgradeVerdict::resolve(&dev, 3 * GIB, 256 * MIB);
        assert_eq!(verdict.system, SystemUpgradeVariant::Regular);
        assert_eq!(verdict.efi, EfiUpgradeVariant::EnlargeRequiresRepartition);
        assert!(!verdict.requires_backup());
        assert!(!verdict.is_blocked());
    }

    #[test]
    fn test_efi_cannot_reuse_space_claimed_by_system() {
        // The system growth eats every unallocated byte.
        let dev = device(
            "d",
            16 * GIB,
            vec![efi(100 * MIB), data(12 * GIB, Some(12 * GIB)), system(3 * GIB)],
        );
        let unallocated = dev.unallocated();
        assert_eq!(unallocated, 924 * MIB);

        let (verdict, spare) = UpgradeVerdict::resolve_with_spare(&dev, 3 * GIB + unallocated, 256 * MIB);
        assert_eq!(verdict.system, SystemUpgradeVariant::Repartition);
        assert_eq!(verdict.efi, EfiUpgradeVariant::EnlargeRequiresBackup);
        assert!(verdict.requires_backup());
        assert_eq!(spare.unallocated, 0);

        // With 156 MiB less system growth the EFI partition fits again.
        let (verdict, spare) =
            UpgradeVerdict::resolve_with_spare(&dev, 3 * GIB + unallocated - 156 * MIB, 256 * MIB);
        assert_eq!(verdict.efi, EfiUpgradeVariant::EnlargeRequiresRepartition);
        assert_eq!(spare, SpareSpace::default());
    }

    #[test]
    fn test_spare_space_after_both_claims() {
        let dev = device(
            "d",
            16 * GIB,
            vec![efi(100 * MIB), exchange(GIB, Some(512 * MIB)), data(8 * GIB, None), system(3 * GIB)],
        );
        let unallocated = dev.unallocated();

        // System takes 512 MiB, EFI takes 156 MiB of what remains.
        let (verdict, spare) =
            UpgradeVerdict::resolve_with_spare(&dev, 3 * GIB + 512 * MIB, 256 * MIB);
        assert_eq!(verdict.system, SystemUpgradeVariant::Repartition);
        assert_eq!(verdict.efi, EfiUpgradeVariant::EnlargeRequiresRepartition);
        assert_eq!(spare.unallocated, unallocated - 512 * MIB - 156 * MIB);
        assert_eq!(spare.exchange_taken, 0);

        // Only 100 MiB unallocated left for EFI; the rest comes from exchange slack.
        let (verdict, spare) =
            UpgradeVerdict::resolve_with_spare(&dev, 3 * GIB + unallocated - 100 * MIB, 256 * MIB);
        assert_eq!(verdict.efi, EfiUpgradeVariant::EnlargeRequiresRepartition);
        assert_eq!(spare.unallocated, 0);
        assert_eq!(spare.exchange_taken, 56 * MIB);
    }

    #[test]
    fn test_verdict_flags_backup_from_either_axis() {
        let dev = device(
            "d",
            16 * GIB,
            vec![efi(100 * MIB), data(12 * GIB, Some(12 * GIB)), system(16 * GIB - 100 * MIB - 12 * GIB)],
        );
        let verdict = UpgradeVerdict::resolve(&dev, 3 * GIB, 256 * MIB);
        assert_eq!(verdict.system, SystemUpgradeVariant::Regular);
        assert_eq!(verdict.efi, EfiUpgradeVariant::EnlargeRequiresBackup);
        assert!(verdict.requires_backup());
    }
}
