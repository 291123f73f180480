use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tracing::debug;

use super::{DeviceExecutor, ExecutionRequest};
use crate::core::admission::DevicePlan;
use crate::core::operation::OperationPhase;
use crate::core::repartition::RepartitionStrategy;
use crate::core::upgrade::{EfiUpgradeVariant, SystemUpgradeVariant};

/// Executor that walks the phases of each plan without touching hardware.
///
/// Failures can be injected per device id; the failing device stops at its
/// main write phase with the configured message.
pub struct SimulatedExecutor {
    pub step_delay: Duration,
    failures: HashMap<String, String>,
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(500),
            failures: HashMap::new(),
        }
    }
}

impl SimulatedExecutor {
    pub fn new(step_delay: Duration) -> Self {
        Self {
            step_delay,
            failures: HashMap::new(),
        }
    }

    pub fn with_failure(mut self, device_id: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures.insert(device_id.into(), message.into());
        self
    }
}

#[async_trait]
impl DeviceExecutor for SimulatedExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        phases: mpsc::UnboundedSender<OperationPhase>,
    ) -> Result<()> {
        let failure = self.failures.get(&request.device.id);

        for phase in phases_for(&request.plan) {
            debug!(device = %request.device.id, %phase, "Simulated phase");
            let _ = phases.send(phase);
            sleep(self.step_delay).await;

            if let Some(message) = failure {
                if matches!(
                    phase,
                    OperationPhase::CopyingSystem
                        | OperationPhase::ResettingPersistence
                        | OperationPhase::ResettingExchange
                ) {
                    bail!("{message}");
                }
            }
        }

        if let Some(message) = failure {
            bail!("{message}");
        }

        Ok(())
    }
}

/// Phases a real executor would go through for `plan`, in order.
pub fn phases_for(plan: &DevicePlan) -> Vec<OperationPhase> {
    use OperationPhase::*;

    let mut phases = vec![Unmounting];
    match plan {
        DevicePlan::Install { layout } => {
            phases.extend([Partitioning, FormattingEfi]);
            if layout.exchange_size() > 0 {
                phases.push(FormattingExchange);
            }
            if layout.persistence_size() > 0 {
                phases.push(FormattingPersistence);
            }
            phases.extend([FormattingSystem, CopyingEfi, CopyingSystem, WritingBootSector]);
        }
        DevicePlan::Upgrade { verdict, exchange } => {
            let backup = verdict.requires_backup();
            if backup {
                phases.push(BackingUp);
            }
            if verdict.system != SystemUpgradeVariant::Regular
                || verdict.efi != EfiUpgradeVariant::Regular
                || *exchange != RepartitionStrategy::Keep
            {
                phases.push(Partitioning);
            }
            if matches!(exchange, RepartitionStrategy::Resize(_)) {
                phases.push(FormattingExchange);
            }
            if verdict.efi != EfiUpgradeVariant::Regular {
                phases.push(FormattingEfi);
            }
            phases.extend([FormattingSystem, CopyingEfi, CopyingSystem]);
            if backup {
                phases.push(Restoring);
            }
            phases.push(WritingBootSector);
        }
        DevicePlan::Reset {
            persistence,
            exchange,
        } => {
            if *persistence {
                phases.push(ResettingPersistence);
            }
            if *exchange {
                phases.push(ResettingExchange);
            }
        }
    }
    phases
}
