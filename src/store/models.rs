//! Conversions between in-memory domain types and their row representation.
//!
//! Kept deliberately free of any I/O — this module only knows how to turn a
//! `sqlx::sqlite::SqliteRow` into a `PersistedTask`/`Session` and back into
//! bind values, the same separation the teacher draws between its
//! `persistence.rs` (pure shapes) and `checkpointer_sqlite.rs` (I/O).

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::errors::PersistenceError;
use crate::task::{PersistedTask, Session, SessionStatus};
use crate::types::{OperationType, ResourceGroup, TaskStatus};

/// A malformed UUID column is a store corruption, not a recoverable case —
/// surface it the same way a bad JSON blob would be.
fn parse_uuid(s: &str) -> Result<Uuid, PersistenceError> {
    Uuid::parse_str(s).map_err(|e| PersistenceError::TaskNotFound {
        id: format!("malformed uuid {s}: {e}"),
    })
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_optional_timestamp(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_timestamp(&s))
}

fn parse_optional_json(s: Option<String>) -> Result<Option<Value>, PersistenceError> {
    match s {
        None => Ok(None),
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
    }
}

/// Build a `PersistedTask` from a `queue_tasks` row.
pub fn task_from_row(row: &SqliteRow) -> Result<PersistedTask, PersistenceError> {
    let id: String = row.try_get("id")?;
    let session_id: String = row.try_get("session_id")?;
    let operation_type_raw: String = row.try_get("type")?;
    let resource_group_raw: String = row.try_get("resource_group")?;
    let status_raw: String = row.try_get("status")?;

    let operation_type =
        OperationType::decode(&operation_type_raw).ok_or_else(|| PersistenceError::TaskNotFound {
            id: format!("unknown operation type {operation_type_raw}"),
        })?;
    let resource_group =
        ResourceGroup::decode(&resource_group_raw).ok_or_else(|| PersistenceError::TaskNotFound {
            id: format!("unknown resource group {resource_group_raw}"),
        })?;
    let status = TaskStatus::decode(&status_raw).ok_or_else(|| PersistenceError::TaskNotFound {
        id: format!("unknown status {status_raw}"),
    })?;

    Ok(PersistedTask {
        id: parse_uuid(&id)?,
        session_id: parse_uuid(&session_id)?,
        operation_type,
        resource_group,
        priority: row.try_get::<i64, _>("priority")? as u8,
        max_retries: row.try_get::<i64, _>("max_retries")? as u32,
        status,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?),
        started_at: parse_optional_timestamp(row.try_get("started_at")?),
        completed_at: parse_optional_timestamp(row.try_get("completed_at")?),
        estimated_duration_ms: row.try_get("estimated_duration_ms")?,
        actual_duration_ms: row.try_get("actual_duration_ms")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        last_error: row.try_get("last_error")?,
        error_stack: row.try_get("error_stack")?,
        file_path: row.try_get("file_path")?,
        file_size: row.try_get("file_size")?,
        file_hash: row.try_get("file_hash")?,
        operation_data: parse_optional_json(row.try_get("operation_data")?)?,
        result_data: parse_optional_json(row.try_get("result_data")?)?,
        memory_usage_kb: row.try_get("memory_usage_kb")?,
        cpu_time_ms: row.try_get("cpu_time_ms")?,
    })
}

/// Build a `Session` from a `queue_sessions` row.
pub fn session_from_row(row: &SqliteRow) -> Result<Session, PersistenceError> {
    let session_id: String = row.try_get("session_id")?;
    let status_raw: String = row.try_get("status")?;
    let status = SessionStatus::decode(&status_raw).unwrap_or(SessionStatus::Crashed);

    Ok(Session {
        session_id: parse_uuid(&session_id)?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?),
        started_at: parse_optional_timestamp(row.try_get("started_at")?),
        last_activity: parse_optional_timestamp(row.try_get("last_activity")?),
        ended_at: parse_optional_timestamp(row.try_get("ended_at")?),
        command_line: row.try_get("command_line")?,
        working_directory: row.try_get("working_directory")?,
        process_id: row
            .try_get::<Option<i64>, _>("process_id")?
            .map(|v| v as u32),
        status,
        completed_count: row.try_get::<i64, _>("completed_count")? as u64,
        failed_count: row.try_get::<i64, _>("failed_count")? as u64,
        cancelled_count: row.try_get::<i64, _>("cancelled_count")? as u64,
    })
}
