//! Batch history: one `batches` row per run, one `operations` row per device.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tokio_rusqlite::rusqlite::OptionalExtension;
use tokio_rusqlite::{Connection, params, rusqlite};
use uuid::Uuid;

use crate::core::{BatchMode, BatchResult, BatchSummary, Operation, OperationStatus};

/// A stored batch, as listed by `history`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRecord {
    pub id: Uuid,
    pub mode: BatchMode,
    pub device_count: usize,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub async fn record(conn: &Connection, result: &BatchResult, summary: &BatchSummary) -> Result<()> {
    let result = result.clone();
    let summary = summary.clone();

    conn.call(move |c| {
        let tx = c.transaction()?;

        tx.execute(
            "INSERT INTO batches
                (id, mode, device_count, successful, failed, cancelled, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                result.id.to_string(),
                result.mode.to_string(),
                summary.total as i64,
                summary.successful as i64,
                summary.failed as i64,
                result.cancelled,
                summary.start.map(|t| t.to_rfc3339()),
                summary.finish.map(|t| t.to_rfc3339()),
            ],
        )?;

        for (position, op) in result.operations.iter().enumerate() {
            tx.execute(
                "INSERT INTO operations
                    (batch_id, position, device_id, device_name, device_size,
                     sequence_number, status, started_at, finished_at, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    result.id.to_string(),
                    position as i64,
                    &op.device_id,
                    &op.device_name,
                    op.device_size as i64,
                    op.sequence_number,
                    status_key(op.status),
                    op.start.map(|t| t.to_rfc3339()),
                    op.end.map(|t| t.to_rfc3339()),
                    &op.error,
                ],
            )?;
        }

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

/// Most recent batches first.
pub async fn list(conn: &Connection, limit: usize) -> Result<Vec<BatchRecord>> {
    let rows = conn
        .call(move |c| {
            let mut stmt = c.prepare(
                "SELECT id, mode, device_count, successful, failed, cancelled, started_at, finished_at
                 FROM batches
                 ORDER BY rowid DESC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await
        .map_err(|e| anyhow!("Failed to list batches: {}", e))?;

    rows.into_iter()
        .map(
            |(id, mode, count, successful, failed, cancelled, started, finished)| {
                Ok(BatchRecord {
                    id: parse_id(&id)?,
                    mode: parse_mode(&mode)?,
                    device_count: count as usize,
                    successful: successful as usize,
                    failed: failed as usize,
                    cancelled,
                    started_at: parse_time(started)?,
                    finished_at: parse_time(finished)?,
                })
            },
        )
        .collect()
}

/// Reload a stored batch with its operations in selection order.
pub async fn get(conn: &Connection, id: Uuid) -> Result<Option<BatchResult>> {
    let key = id.to_string();
    let loaded = conn
        .call(move |c| {
            let header = c
                .query_row(
                    "SELECT mode, cancelled FROM batches WHERE id = ?1",
                    params![&key],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
                )
                .optional()?;

            let Some(header) = header else {
                return Ok::<_, rusqlite::Error>(None);
            };

            let mut stmt = c.prepare(
                "SELECT device_id, device_name, device_size, sequence_number,
                        status, started_at, finished_at, error
                 FROM operations
                 WHERE batch_id = ?1
                 ORDER BY position",
            )?;
            let ops = stmt
                .query_map(params![&key], |row| {
                    Ok(StoredOperation {
                        device_id: row.get(0)?,
                        device_name: row.get(1)?,
                        device_size: row.get(2)?,
                        sequence_number: row.get(3)?,
                        status: row.get(4)?,
                        started_at: row.get(5)?,
                        finished_at: row.get(6)?,
                        error: row.get(7)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Some((header, ops)))
        })
        .await
        .map_err(|e| anyhow!("Failed to get batch: {}", e))?;

    let Some(((mode, cancelled), ops)) = loaded else {
        return Ok(None);
    };

    let operations = ops
        .into_iter()
        .map(StoredOperation::into_operation)
        .collect::<Result<Vec<_>>>()?;

    Ok(Some(BatchResult {
        id,
        mode: parse_mode(&mode)?,
        operations,
        complete: true,
        cancelled,
    }))
}

struct StoredOperation {
    device_id: String,
    device_name: String,
    device_size: i64,
    sequence_number: Option<u32>,
    status: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    error: Option<String>,
}

impl StoredOperation {
    fn into_operation(self) -> Result<Operation> {
        let mut op = Operation::new(
            self.device_id,
            self.device_name,
            self.device_size as u64,
            self.sequence_number,
        );
        op.status = parse_status(&self.status)?;
        op.start = parse_time(self.started_at)?;
        op.end = parse_time(self.finished_at)?;
        op.error = self.error;
        Ok(op)
    }
}

fn status_key(status: OperationStatus) -> &'static str {
    match status {
        OperationStatus::Pending => "pending",
        OperationStatus::Ongoing => "ongoing",
        OperationStatus::Successful => "successful",
        OperationStatus::Failed => "failed",
    }
}

fn parse_status(key: &str) -> Result<OperationStatus> {
    match key {
        "pending" => Ok(OperationStatus::Pending),
        "ongoing" => Ok(OperationStatus::Ongoing),
        "successful" => Ok(OperationStatus::Successful),
        "failed" => Ok(OperationStatus::Failed),
        other => Err(anyhow!("Unknown operation status in history: {other}")),
    }
}

fn parse_mode(mode: &str) -> Result<BatchMode> {
    mode.parse().map_err(|e: String| anyhow!(e))
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).map_err(|e| anyhow!("Invalid batch id {id}: {e}"))
}

fn parse_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| anyhow!("Invalid timestamp {s}: {e}"))
        })
        .transpose()
}
