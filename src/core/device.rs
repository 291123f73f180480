use serde::{Deserialize, Serialize};

/// Kind of storage device as reported by the enumeration layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    FixedDisk,
    Removable,
    MemoryCard,
}

/// Role flags of a partition. A partition may carry none of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionRoles {
    pub efi: bool,
    pub system: bool,
    pub data: bool,
    pub exchange: bool,
    pub extended: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub number: u32,
    pub offset: u64,
    pub size: u64,
    #[serde(default)]
    pub label: String,
    /// Filesystem identifier as reported by the bus (e.g. "vfat", "ext4").
    #[serde(default)]
    pub filesystem: String,
    #[serde(default)]
    pub roles: PartitionRoles,
    /// Used bytes, if the enumeration layer could determine them.
    #[serde(default)]
    pub used: Option<u64>,
}

impl Partition {
    /// Bytes that could be released by shrinking this partition's filesystem.
    /// Unknown usage yields no slack.
    pub fn slack(&self) -> u64 {
        match self.used {
            Some(used) => self.size.saturating_sub(used),
            None => 0,
        }
    }

    /// Whether the filesystem can be shrunk in place without a backup cycle.
    pub fn is_shrinkable(&self) -> bool {
        matches!(
            self.filesystem.to_lowercase().as_str(),
            "ext2" | "ext3" | "ext4"
        )
    }
}

/// Immutable facts about one candidate device, captured at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDeviceFacts {
    /// Stable identity of the device (serial, by-id path, ...).
    pub id: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub model: String,
    pub size: u64,
    pub kind: DeviceKind,
    #[serde(default)]
    pub boot_device: bool,
    /// Partitions in on-disk order.
    #[serde(default)]
    pub partitions: Vec<Partition>,
}

impl StorageDeviceFacts {
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.vendor, self.model);
        let name = name.trim();
        if name.is_empty() {
            self.id.clone()
        } else {
            format!("{} ({})", name, self.id)
        }
    }

    fn find(&self, pred: impl Fn(&PartitionRoles) -> bool) -> Option<&Partition> {
        self.partitions.iter().find(|p| pred(&p.roles))
    }

    pub fn efi_partition(&self) -> Option<&Partition> {
        self.find(|r| r.efi)
    }

    pub fn system_partition(&self) -> Option<&Partition> {
        self.find(|r| r.system)
    }

    pub fn data_partition(&self) -> Option<&Partition> {
        self.find(|r| r.data)
    }

    pub fn exchange_partition(&self) -> Option<&Partition> {
        self.find(|r| r.exchange)
    }

    /// Space not covered by any partition. Extended containers are skipped
    /// because their logical partitions are listed separately.
    pub fn unallocated(&self) -> u64 {
        let allocated: u64 = self
            .partitions
            .iter()
            .filter(|p| !p.roles.extended)
            .map(|p| p.size)
            .sum();
        self.size.saturating_sub(allocated)
    }
}

/// Supplier of device facts (the disk-management bus in production).
pub trait DeviceSource: Send + Sync {
    /// List all currently connected candidate devices.
    fn list_devices(&self) -> anyhow::Result<Vec<StorageDeviceFacts>>;

    /// Re-read a single device. `None` means the device is gone.
    fn device(&self, id: &str) -> anyhow::Result<Option<StorageDeviceFacts>> {
        Ok(self.list_devices()?.into_iter().find(|d| d.id == id))
    }
}
