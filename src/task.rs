//! Task, session, and submission data model.
//!
//! `Task` is the in-memory unit of submitted work; `PersistedTask` is its
//! on-disk superset as loaded from the store. The two are kept as distinct
//! types (rather than one struct with `Option` fields for everything) so
//! that submission call sites cannot accidentally read lifecycle fields that
//! only exist once the store has assigned them — the same separation the
//! teacher draws between its in-memory channel state and `Persisted*` shapes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{OperationType, ResourceGroup, TaskStatus};

/// Default priority when a submission does not specify one. 1 = highest,
/// 10 = lowest.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Default retry budget for a submitted task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Caller-supplied knobs for a single submission. Every field is optional;
/// absent fields fall back to the group's configured defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// 1 (highest) .. 10 (lowest). Defaults to [`DEFAULT_PRIORITY`].
    pub priority: Option<u8>,
    /// Defaults to [`DEFAULT_MAX_RETRIES`].
    pub max_retries: Option<u32>,
    /// Advisory only; used for metrics and backlog estimation, not enforced.
    pub estimated_duration: Option<Duration>,
    /// Opaque, serializable descriptor the registered factory for this
    /// task's `OperationType` uses to reconstruct the operation on crash
    /// recovery. Never interpreted by the queue itself.
    pub operation_data: Option<Value>,
    /// When set on a `Computation` submission, routes the task to the
    /// `memory-intensive` group instead of `computation`.
    pub is_memory_intensive: bool,
}

/// The in-memory unit of submitted work.
///
/// `Task` does not carry the submitter's executable operation directly —
/// that lives in the queue's in-flight registry, keyed by `id`, so that
/// `Task` itself stays `Serialize`/`Clone` and can flow through the same
/// code paths as its persisted counterpart.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub session_id: Uuid,
    pub operation_type: OperationType,
    pub resource_group: ResourceGroup,
    pub priority: u8,
    pub max_retries: u32,
    pub estimated_duration: Option<Duration>,
    pub operation_data: Option<Value>,
}

impl Task {
    /// Build a fresh task for submission, applying the defaults spec'd for
    /// any field the caller left unset in `options`.
    #[must_use]
    pub fn new(
        session_id: Uuid,
        operation_type: OperationType,
        resource_group: ResourceGroup,
        options: SubmitOptions,
    ) -> Self {
        Task {
            id: Uuid::new_v4(),
            session_id,
            operation_type,
            resource_group,
            priority: options.priority.unwrap_or(DEFAULT_PRIORITY),
            max_retries: options.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            estimated_duration: options.estimated_duration,
            operation_data: options.operation_data,
        }
    }

    /// The dispatch-ordering score used within a group: lower sorts first.
    /// `age_minutes` bounds starvation for lower-priority tasks; `retry_count`
    /// nudges retried tasks ahead of fresh ones at the same priority.
    #[must_use]
    pub fn dispatch_score(&self, age_minutes: f64, retry_count: u32) -> f64 {
        f64::from(self.priority) + 0.01 * age_minutes + 0.5 * f64::from(retry_count)
    }
}

/// The on-disk superset of [`Task`], as loaded from the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedTask {
    pub id: Uuid,
    pub session_id: Uuid,
    pub operation_type: OperationType,
    pub resource_group: ResourceGroup,
    pub priority: u8,
    pub max_retries: u32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_duration_ms: Option<i64>,
    pub actual_duration_ms: Option<i64>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub error_stack: Option<String>,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub file_hash: Option<String>,
    pub operation_data: Option<Value>,
    pub result_data: Option<Value>,
    pub memory_usage_kb: Option<i64>,
    pub cpu_time_ms: Option<i64>,
}

impl PersistedTask {
    /// Build the initial persisted row for a freshly submitted task.
    #[must_use]
    pub fn from_new(task: &Task, now: DateTime<Utc>) -> Self {
        PersistedTask {
            id: task.id,
            session_id: task.session_id,
            operation_type: task.operation_type,
            resource_group: task.resource_group,
            priority: task.priority,
            max_retries: task.max_retries,
            status: TaskStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            estimated_duration_ms: task
                .estimated_duration
                .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX)),
            actual_duration_ms: None,
            retry_count: 0,
            last_error: None,
            error_stack: None,
            file_path: None,
            file_size: None,
            file_hash: None,
            operation_data: task.operation_data.clone(),
            result_data: None,
            memory_usage_kb: None,
            cpu_time_ms: None,
        }
    }

    /// The age of this task, in fractional minutes, relative to `now`. Used
    /// by the dispatch-ordering score in [`Task::dispatch_score`].
    #[must_use]
    pub fn age_minutes(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = now.signed_duration_since(self.created_at);
        (elapsed.num_milliseconds().max(0) as f64) / 60_000.0
    }
}

/// Lifecycle status of a session (distinct from [`TaskStatus`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    Completed,
    Cancelled,
    Crashed,
}

impl SessionStatus {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Crashed => "crashed",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "cancelled" => Some(SessionStatus::Cancelled),
            "crashed" => Some(SessionStatus::Crashed),
            _ => None,
        }
    }
}

/// A single run of the owning process; the unit of crash recovery. Exactly
/// one session is `Active` per process at a time (invariant I5).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub command_line: Option<String>,
    pub working_directory: Option<String>,
    pub process_id: Option<u32>,
    pub status: SessionStatus,
    pub completed_count: u64,
    pub failed_count: u64,
    pub cancelled_count: u64,
}

impl Session {
    /// Start a new session for the current process, capturing its argv and
    /// working directory the way the teacher's `RuntimeConfig` captures
    /// environment context at construction time.
    #[must_use]
    pub fn new_for_current_process(session_id: Uuid, now: DateTime<Utc>) -> Self {
        let command_line = std::env::args().collect::<Vec<_>>().join(" ");
        let working_directory = std::env::current_dir()
            .ok()
            .map(|p| p.display().to_string());

        Session {
            session_id,
            created_at: now,
            started_at: Some(now),
            last_activity: Some(now),
            ended_at: None,
            command_line: Some(command_line),
            working_directory,
            process_id: Some(std::process::id()),
            status: SessionStatus::Active,
            completed_count: 0,
            failed_count: 0,
            cancelled_count: 0,
        }
    }
}
