//! Error taxonomy for the task queue.
//!
//! Every error enum here implements [`thiserror::Error`] and
//! [`miette::Diagnostic`], carrying a stable `code(...)` per variant so
//! callers can match on diagnostic codes instead of string content. Errors
//! that can occur for more than one underlying reason in a façade operation
//! are aggregated into [`CoreError`] via `#[from]`, mirroring how deep a
//! call stack a single typed error can surface from.

use miette::Diagnostic;
use thiserror::Error;

use crate::types::ResourceGroup;

/// Schema open/validate/migrate failure. Fatal at startup — the façade
/// refuses to initialize if this occurs.
#[derive(Debug, Error, Diagnostic)]
pub enum SchemaError {
    #[error("failed to open store at {path}: {source}")]
    #[diagnostic(code(taskcore::schema::open_failed))]
    OpenFailed {
        path: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("migration to schema version {version} failed: {source}")]
    #[diagnostic(
        code(taskcore::schema::migration_failed),
        help("the store was left at its prior schema version; no partial migration was committed")
    )]
    MigrationFailed {
        version: String,
        #[source]
        source: sqlx::migrate::MigrateError,
    },

    #[error("schema validation failed: {reason}")]
    #[diagnostic(code(taskcore::schema::invalid))]
    Invalid { reason: String },
}

/// CRUD or query failure against the store.
#[derive(Debug, Error, Diagnostic)]
pub enum PersistenceError {
    #[error("database query failed: {0}")]
    #[diagnostic(code(taskcore::persistence::query_failed))]
    QueryFailed(#[from] sqlx::Error),

    #[error("cannot persist task for session {session_id}: no session row exists")]
    #[diagnostic(
        code(taskcore::persistence::missing_session),
        help("call initialize() before submitting tasks")
    )]
    MissingSession { session_id: String },

    #[error("task {id} not found")]
    #[diagnostic(code(taskcore::persistence::task_not_found))]
    TaskNotFound { id: String },

    #[error("failed to serialize payload: {0}")]
    #[diagnostic(code(taskcore::persistence::serde))]
    Serde(#[from] serde_json::Error),
}

/// Submission or dispatch failure at the queue layer.
#[derive(Debug, Error, Diagnostic)]
pub enum QueueError {
    #[error("unknown resource group: {0}")]
    #[diagnostic(code(taskcore::queue::unknown_group))]
    UnknownGroup(String),

    #[error("cannot submit to the {group} queue: shutting down")]
    #[diagnostic(code(taskcore::queue::shutting_down))]
    ShuttingDown { group: ResourceGroup },

    #[error("task {id} not found in group {group}")]
    #[diagnostic(code(taskcore::queue::task_not_found))]
    TaskNotFound { id: String, group: ResourceGroup },
}

/// Dispatch refused because the circuit breaker for a group is open.
#[derive(Debug, Error, Diagnostic)]
#[error("circuit breaker for {group} is open (failure_count={failure_count})")]
#[diagnostic(
    code(taskcore::breaker::open),
    help("the breaker will move to half-open after its recovery timeout elapses")
)]
pub struct CircuitBreakerError {
    pub group: ResourceGroup,
    pub failure_count: u32,
}

/// Permit acquisition from the adaptive throttler timed out.
#[derive(Debug, Error, Diagnostic)]
#[error("throttle permit for {group} unavailable (current_limit={current_limit})")]
#[diagnostic(code(taskcore::throttle::timeout))]
pub struct ThrottleError {
    pub group: ResourceGroup,
    pub current_limit: u32,
}

/// A task's operation exceeded its execution deadline.
#[derive(Debug, Error, Diagnostic)]
#[error("task {task_id} exceeded its {deadline_secs}s execution deadline")]
#[diagnostic(code(taskcore::task::timeout))]
pub struct TaskTimeoutError {
    pub task_id: String,
    pub deadline_secs: u64,
}

/// Crate-level aggregate error for façade operations that can fail for more
/// than one underlying reason.
#[derive(Debug, Error, Diagnostic)]
pub enum CoreError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    CircuitBreaker(#[from] CircuitBreakerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Throttle(#[from] ThrottleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Timeout(#[from] TaskTimeoutError),

    #[error("operation failed: {0}")]
    #[diagnostic(code(taskcore::operation_failed))]
    Operation(String),

    #[error("no factory registered for operation type {type_name}")]
    #[diagnostic(
        code(taskcore::no_factory),
        help("register a factory for this type before recovering tasks of it")
    )]
    NoFactory { type_name: String },
}
