//! Sequential batch execution.
//!
//! The coordinator admits the whole batch up front, then drives one
//! [`Operation`] per device strictly in selection order. It is the only owner
//! of the operations while running; views receive snapshots through events
//! and the [`ProgressTracker`].

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::admission::{self, AdmittedDevice, BatchMode, BatchOptions, FeasibilityError};
use super::device::{DeviceSource, StorageDeviceFacts};
use super::executor::{DeviceExecutor, ExecutionRequest};
use super::operation::{Clock, LifecycleError, Operation, OperationPhase, SystemClock};
use super::progress::ProgressTracker;
use super::report::{BatchResult, BatchSummary};
use crate::logging::LogThrottle;

/// One-way notifications for the view layer.
#[derive(Debug, Clone)]
pub enum BatchEvent {
    Started {
        batch_id: Uuid,
        mode: BatchMode,
        total: usize,
    },
    DeviceStarted {
        device_id: String,
        device_name: String,
        ordinal: usize,
        total: usize,
    },
    PhaseChanged {
        device_id: String,
        phase: OperationPhase,
    },
    DeviceFinished(Operation),
    Summary(BatchSummary),
}

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Batch rejected:\n{}", format_rejections(.0))]
    Rejected(Vec<FeasibilityError>),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

fn format_rejections(errors: &[FeasibilityError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct BatchCoordinator {
    executor: Arc<dyn DeviceExecutor>,
    source: Arc<dyn DeviceSource>,
    progress: ProgressTracker,
    clock: Arc<dyn Clock>,
    events: Option<mpsc::UnboundedSender<BatchEvent>>,
    cancel: CancellationToken,
}

impl BatchCoordinator {
    pub fn new(
        executor: Arc<dyn DeviceExecutor>,
        source: Arc<dyn DeviceSource>,
        progress: ProgressTracker,
    ) -> Self {
        Self {
            executor,
            source,
            progress,
            clock: Arc::new(SystemClock),
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<BatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Token to stop the batch before the next device begins.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the batch on a background task.
    pub fn spawn(
        self: Arc<Self>,
        devices: Vec<StorageDeviceFacts>,
        options: BatchOptions,
    ) -> JoinHandle<Result<BatchResult, BatchError>> {
        tokio::spawn(async move { self.run(&devices, &options).await })
    }

    /// Admit every device, then process them one after another.
    ///
    /// Device failures are recorded and never stop the batch. Rejection
    /// happens before any device is touched.
    pub async fn run(
        &self,
        devices: &[StorageDeviceFacts],
        options: &BatchOptions,
    ) -> Result<BatchResult, BatchError> {
        let admitted = admission::admit(devices, options).map_err(|errors| {
            warn!(rejections = errors.len(), "Batch rejected during admission");
            BatchError::Rejected(errors)
        })?;

        let operations = admitted
            .iter()
            .map(|d| {
                Operation::new(
                    d.facts.id.clone(),
                    d.facts.display_name(),
                    d.facts.size,
                    d.sequence_number,
                )
            })
            .collect();
        let mut result = BatchResult::new(options.mode, operations);
        let total = admitted.len();

        let span = info_span!("batch", batch_id = %result.id, mode = %options.mode);

        async {
            info!(devices = total, "Starting batch");

            self.progress.clear().await;
            for op in &result.operations {
                self.progress.update(op.clone()).await;
            }
            self.publish(BatchEvent::Started {
                batch_id: result.id,
                mode: options.mode,
                total,
            });

            for (index, device) in admitted.into_iter().enumerate() {
                if self.cancel.is_cancelled() {
                    info!(remaining = total - index, "Batch cancelled before next device");
                    result.cancelled = true;
                    break;
                }

                info!(device = %device.facts.id, "Processing device {} of {}", index + 1, total);
                self.publish(BatchEvent::DeviceStarted {
                    device_id: device.facts.id.clone(),
                    device_name: device.facts.display_name(),
                    ordinal: index + 1,
                    total,
                });

                let op = &mut result.operations[index];
                self.process(op, options.mode, device).await?;

                self.publish(BatchEvent::DeviceFinished(op.clone()));
                self.publish(BatchEvent::Summary(result.summary(self.clock.as_ref())));
            }

            result.complete = true;
            let summary = result.summary(self.clock.as_ref());
            info!(
                successful = summary.successful,
                failed = summary.failed,
                pending = summary.pending,
                duration = ?summary.duration(),
                "Batch finished"
            );
            self.publish(BatchEvent::Summary(summary));

            Ok::<_, BatchError>(result)
        }
        .instrument(span)
        .await
    }

    async fn process(
        &self,
        op: &mut Operation,
        mode: BatchMode,
        device: AdmittedDevice,
    ) -> Result<(), LifecycleError> {
        let clock = self.clock.as_ref();
        op.begin(clock)?;
        self.progress.update(op.clone()).await;

        match self.stale_reason(&device.facts).await {
            Some(reason) => {
                warn!(device = %op.device_id, %reason, "Device facts went stale");
                op.fail(reason, clock)?;
            }
            None => {
                let request = ExecutionRequest::new(mode, device);
                match self.execute(op, request).await? {
                    Ok(()) => {
                        info!(device = %op.device_id, "Device finished");
                        op.succeed(clock)?;
                    }
                    Err(e) => {
                        warn!(device = %op.device_id, error = %e, "Device failed");
                        op.fail(format!("{e:#}"), clock)?;
                    }
                }
            }
        }

        self.progress.update(op.clone()).await;
        Ok(())
    }

    /// Drive the executor, translating reported phases into `advance` calls.
    async fn execute(
        &self,
        op: &mut Operation,
        request: ExecutionRequest,
    ) -> Result<anyhow::Result<()>, LifecycleError> {
        let (phase_tx, mut phase_rx) = mpsc::unbounded_channel();
        let throttle = LogThrottle::new(Duration::from_millis(250));

        let execution = self.executor.execute(request, phase_tx);
        tokio::pin!(execution);

        let outcome = loop {
            tokio::select! {
                biased;
                Some(phase) = phase_rx.recv() => {
                    self.advance(op, phase, &throttle).await?;
                }
                outcome = &mut execution => break outcome,
            }
        };

        while let Ok(phase) = phase_rx.try_recv() {
            self.advance(op, phase, &throttle).await?;
        }

        Ok(outcome)
    }

    async fn advance(
        &self,
        op: &mut Operation,
        phase: OperationPhase,
        throttle: &LogThrottle,
    ) -> Result<(), LifecycleError> {
        op.advance(phase)?;
        if throttle.should_log() {
            debug!(device = %op.device_id, %phase, "Phase changed");
        }
        self.progress.update(op.clone()).await;
        self.publish(BatchEvent::PhaseChanged {
            device_id: op.device_id.clone(),
            phase,
        });
        Ok(())
    }

    /// Re-read the device; report why it can no longer be trusted, if so.
    ///
    /// Sources may hit the filesystem, so the lookup runs on the blocking pool.
    async fn stale_reason(&self, admitted: &StorageDeviceFacts) -> Option<String> {
        let source = Arc::clone(&self.source);
        let id = admitted.id.clone();
        let current = match tokio::task::spawn_blocking(move || source.device(&id)).await {
            Ok(current) => current,
            Err(e) => return Some(format!("could not re-read device: {e}")),
        };

        match current {
            Ok(Some(current)) if current == *admitted => None,
            Ok(Some(_)) => Some("device changed since the feasibility check".to_string()),
            Ok(None) => Some("device was removed".to_string()),
            Err(e) => Some(format!("could not re-read device: {e:#}")),
        }
    }

    fn publish(&self, event: BatchEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}
