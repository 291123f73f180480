//! Execution seam for the destructive per-device work.
//!
//! Partitioning, formatting and copying live behind [`DeviceExecutor`]. The
//! executor reports coarse phases over a one-way channel and returns the
//! outcome; the coordinator alone turns both into lifecycle transitions.

mod simulated;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::admission::{AdmittedDevice, BatchMode, DevicePlan};
use super::device::StorageDeviceFacts;
use super::operation::OperationPhase;

pub use simulated::{SimulatedExecutor, phases_for};

/// Everything an executor needs to process one device.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub device: StorageDeviceFacts,
    pub mode: BatchMode,
    pub plan: DevicePlan,
    pub sequence_number: Option<u32>,
    pub exchange_label: Option<String>,
}

impl ExecutionRequest {
    pub fn new(mode: BatchMode, admitted: AdmittedDevice) -> Self {
        Self {
            device: admitted.facts,
            mode,
            plan: admitted.plan,
            sequence_number: admitted.sequence_number,
            exchange_label: admitted.exchange_label,
        }
    }
}

#[async_trait]
pub trait DeviceExecutor: Send + Sync {
    /// Process one device. Any error is recorded as that device's failure.
    async fn execute(
        &self,
        request: ExecutionRequest,
        phases: mpsc::UnboundedSender<OperationPhase>,
    ) -> anyhow::Result<()>;
}
