pub mod admission;
pub mod batch;
pub mod classifier;
pub mod device;
pub mod executor;
pub mod numbering;
pub mod operation;
pub mod progress;
pub mod repartition;
pub mod report;
pub mod sizing;
pub mod upgrade;

pub use admission::{BatchMode, BatchOptions, DevicePlan, FeasibilityError, UpgradeOptions};
pub use batch::{BatchCoordinator, BatchError, BatchEvent};
pub use classifier::{PartitionLayoutState, classify};
pub use device::{DeviceKind, DeviceSource, Partition, PartitionRoles, StorageDeviceFacts};
pub use executor::{DeviceExecutor, ExecutionRequest, SimulatedExecutor};
pub use numbering::AutoNumbering;
pub use operation::{Clock, LifecycleError, ManualClock, Operation, OperationPhase, OperationStatus, SystemClock};
pub use progress::ProgressTracker;
pub use repartition::{RepartitionRequest, RepartitionStrategy, SizingError};
pub use report::{BatchResult, BatchSummary, ReportRow};
pub use sizing::{BackupDestination, SizingParameters};
pub use upgrade::{EfiUpgradeVariant, SpareSpace, SystemUpgradeVariant, UpgradeVerdict};
