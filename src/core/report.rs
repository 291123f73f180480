//! Batch results and their tabular form.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::admission::BatchMode;
use super::operation::{Clock, Operation, OperationStatus};

/// Ordered per-device snapshots of one batch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub id: Uuid,
    pub mode: BatchMode,
    /// One entry per selected device, in selection order.
    pub operations: Vec<Operation>,
    /// False while the batch is still running.
    pub complete: bool,
    pub cancelled: bool,
}

/// Aggregate view over a batch, derived on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub pending: usize,
    pub start: Option<DateTime<Utc>>,
    pub finish: Option<DateTime<Utc>>,
}

impl BatchSummary {
    pub fn duration(&self) -> Option<Duration> {
        match (self.start, self.finish) {
            (Some(start), Some(finish)) => Some((finish - start).max(Duration::zero())),
            _ => None,
        }
    }
}

/// One line of the result table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub number: Option<u32>,
    pub device: String,
    pub size: u64,
    pub duration: Option<Duration>,
    pub status: String,
    pub error: Option<String>,
}

impl BatchResult {
    pub fn new(mode: BatchMode, operations: Vec<Operation>) -> Self {
        Self {
            id: Uuid::now_v7(),
            mode,
            operations,
            complete: false,
            cancelled: false,
        }
    }

    /// Summary for the current state. An in-flight batch finishes "now".
    pub fn summary(&self, clock: &dyn Clock) -> BatchSummary {
        let count = |status: OperationStatus| {
            self.operations
                .iter()
                .filter(|op| op.status == status)
                .count()
        };

        let start = self.operations.iter().find_map(|op| op.start);
        let finish = if start.is_none() {
            None
        } else if self.complete {
            self.operations.iter().rev().find_map(|op| op.end)
        } else {
            Some(clock.now())
        };

        BatchSummary {
            total: self.operations.len(),
            successful: count(OperationStatus::Successful),
            failed: count(OperationStatus::Failed),
            pending: count(OperationStatus::Pending),
            start,
            finish,
        }
    }

    /// Table rows: one per device, plus a summary row for multi-device batches.
    pub fn rows(&self, clock: &dyn Clock) -> Vec<ReportRow> {
        let mut rows: Vec<ReportRow> = self
            .operations
            .iter()
            .map(|op| ReportRow {
                number: op.sequence_number,
                device: op.device_name.clone(),
                size: op.device_size,
                duration: op.duration(clock),
                status: match (op.status, op.detail) {
                    (OperationStatus::Ongoing, Some(phase)) => phase.to_string(),
                    (status, _) => status.to_string(),
                },
                error: op.error.clone(),
            })
            .collect();

        if self.operations.len() > 1 {
            let summary = self.summary(clock);
            rows.push(ReportRow {
                number: None,
                device: "Total".to_string(),
                size: self.operations.iter().map(|op| op.device_size).sum(),
                duration: summary.duration(),
                status: format!("{}/{} OK", summary.successful, summary.total),
                error: None,
            });
        }

        rows
    }
}

/// Format a duration as `HH:MM:SS`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds().max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}

/// Format a byte count with binary units, one decimal.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
