//! Per-device operation state machine.
//!
//! `Pending -> Ongoing -> Successful | Failed`. Terminal states are final and
//! no transition skips `Ongoing`. Timestamps come from an injected [`Clock`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;

/// Source of "now" for lifecycle timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used by tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Ongoing,
    Successful,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Successful | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Ongoing => "Ongoing",
            Self::Successful => "OK",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse sub-phase of a running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPhase {
    Unmounting,
    BackingUp,
    Partitioning,
    FormattingEfi,
    FormattingExchange,
    FormattingPersistence,
    FormattingSystem,
    CopyingEfi,
    CopyingSystem,
    ResettingPersistence,
    ResettingExchange,
    Restoring,
    WritingBootSector,
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unmounting => "unmounting partitions",
            Self::BackingUp => "backing up data partition",
            Self::Partitioning => "partitioning",
            Self::FormattingEfi => "formatting EFI partition",
            Self::FormattingExchange => "formatting exchange partition",
            Self::FormattingPersistence => "formatting persistence partition",
            Self::FormattingSystem => "formatting system partition",
            Self::CopyingEfi => "copying boot files",
            Self::CopyingSystem => "copying system files",
            Self::ResettingPersistence => "resetting persistence partition",
            Self::ResettingExchange => "resetting exchange partition",
            Self::Restoring => "restoring data partition",
            Self::WritingBootSector => "writing boot sector",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Begin,
    Advance,
    Succeed,
    Fail,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Invalid transition {action:?} from {from:?} on device {device}")]
    InvalidTransition {
        device: String,
        from: OperationStatus,
        action: Transition,
    },
}

/// State, timing and outcome of one device within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub device_id: String,
    pub device_name: String,
    pub device_size: u64,
    pub status: OperationStatus,
    pub detail: Option<OperationPhase>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub sequence_number: Option<u32>,
}

impl Operation {
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_size: u64,
        sequence_number: Option<u32>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_size,
            status: OperationStatus::Pending,
            detail: None,
            start: None,
            end: None,
            error: None,
            sequence_number,
        }
    }

    fn require(&self, required: OperationStatus, action: Transition) -> Result<(), LifecycleError> {
        if self.status == required {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition {
                device: self.device_id.clone(),
                from: self.status,
                action,
            })
        }
    }

    pub fn begin(&mut self, clock: &dyn Clock) -> Result<(), LifecycleError> {
        self.require(OperationStatus::Pending, Transition::Begin)?;
        self.status = OperationStatus::Ongoing;
        self.start = Some(clock.now());
        Ok(())
    }

    pub fn advance(&mut self, phase: OperationPhase) -> Result<(), LifecycleError> {
        self.require(OperationStatus::Ongoing, Transition::Advance)?;
        self.detail = Some(phase);
        Ok(())
    }

    pub fn succeed(&mut self, clock: &dyn Clock) -> Result<(), LifecycleError> {
        self.require(OperationStatus::Ongoing, Transition::Succeed)?;
        self.finish(OperationStatus::Successful, clock);
        Ok(())
    }

    /// Mark the operation failed. An empty message is stored as "unknown error".
    pub fn fail(&mut self, message: impl Into<String>, clock: &dyn Clock) -> Result<(), LifecycleError> {
        self.require(OperationStatus::Ongoing, Transition::Fail)?;
        let message = message.into();
        self.error = Some(if message.trim().is_empty() {
            "unknown error".to_string()
        } else {
            message
        });
        self.finish(OperationStatus::Failed, clock);
        Ok(())
    }

    fn finish(&mut self, status: OperationStatus, clock: &dyn Clock) {
        let now = clock.now();
        // The wall clock may step backwards; never record an end before start.
        let end = match self.start {
            Some(start) if now < start => start,
            _ => now,
        };
        self.end = Some(end);
        self.detail = None;
        self.status = status;
    }

    /// Elapsed time: live while ongoing, fixed once finished, `None` before start.
    pub fn duration(&self, clock: &dyn Clock) -> Option<Duration> {
        let start = self.start?;
        let end = self.end.unwrap_or_else(|| clock.now());
        Some((end - start).max(Duration::zero()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    }

    fn op() -> Operation {
        Operation::new("dev-1", "Generic Flash", 8 << 30, Some(1))
    }

    fn assert_invalid(result: Result<(), LifecycleError>, from: OperationStatus, action: Transition) {
        match result {
            Err(LifecycleError::InvalidTransition { from: f, action: a, .. }) => {
                assert_eq!(f, from);
                assert_eq!(a, action);
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
    }

    #[test]
    fn test_pending_rejects_everything_but_begin() {
        let clock = clock();
        let mut op = op();
        assert_invalid(op.succeed(&clock), OperationStatus::Pending, Transition::Succeed);
        assert_invalid(op.fail("boom", &clock), OperationStatus::Pending, Transition::Fail);
        assert_invalid(
            op.advance(OperationPhase::Partitioning),
            OperationStatus::Pending,
            Transition::Advance,
        );
        assert_eq!(op.status, OperationStatus::Pending);
        assert!(op.duration(&clock).is_none());
    }

    #[test]
    fn test_begin_twice_is_invalid() {
        let clock = clock();
        let mut op = op();
        op.begin(&clock).unwrap();
        assert_invalid(op.begin(&clock), OperationStatus::Ongoing, Transition::Begin);
    }

    #[test]
    fn test_successful_run() {
        let clock = clock();
        let mut op = op();
        op.begin(&clock).unwrap();
        op.advance(OperationPhase::Partitioning).unwrap();
        op.advance(OperationPhase::CopyingSystem).unwrap();
        assert_eq!(op.detail, Some(OperationPhase::CopyingSystem));

        clock.advance(Duration::seconds(30));
        assert_eq!(op.duration(&clock), Some(Duration::seconds(30)));
        clock.advance(Duration::seconds(30));
        assert_eq!(op.duration(&clock), Some(Duration::seconds(60)));

        op.succeed(&clock).unwrap();
        assert_eq!(op.status, OperationStatus::Successful);
        assert_eq!(op.detail, None);
        assert!(op.end.unwrap() >= op.start.unwrap());

        clock.advance(Duration::seconds(100));
        assert_eq!(op.duration(&clock), Some(Duration::seconds(60)));
    }

    #[test]
    fn test_failure_records_message_and_is_terminal() {
        let clock = clock();
        let mut op = op();
        op.begin(&clock).unwrap();
        op.advance(OperationPhase::FormattingSystem).unwrap();
        op.fail("write failed", &clock).unwrap();

        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.error.as_deref(), Some("write failed"));
        assert_eq!(op.detail, None);

        assert_invalid(op.succeed(&clock), OperationStatus::Failed, Transition::Succeed);
        assert_invalid(op.fail("again", &clock), OperationStatus::Failed, Transition::Fail);
        assert_invalid(op.begin(&clock), OperationStatus::Failed, Transition::Begin);
        assert_eq!(op.error.as_deref(), Some("write failed"));
    }

    #[test]
    fn test_empty_failure_message_is_replaced() {
        let clock = clock();
        let mut op = op();
        op.begin(&clock).unwrap();
        op.fail("  ", &clock).unwrap();
        assert_eq!(op.error.as_deref(), Some("unknown error"));
    }

    #[test]
    fn test_end_never_precedes_start() {
        let clock = clock();
        let mut op = op();
        op.begin(&clock).unwrap();
        clock.advance(Duration::seconds(-5));
        op.succeed(&clock).unwrap();
        assert_eq!(op.end, op.start);
        assert_eq!(op.duration(&clock), Some(Duration::zero()));
    }
}
