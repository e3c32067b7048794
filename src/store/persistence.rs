//! Task and session CRUD, pending-load, and crash recovery.
//!
//! Every operation here goes through a prepared statement via `sqlx::query`/
//! `query_as` (the dynamic forms, not the `query!` macro — this crate stays
//! independent of a live `DATABASE_URL` at write time, exactly as the
//! teacher's `checkpointer_sqlite.rs` does).

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

use crate::errors::PersistenceError;
use crate::store::models::{session_from_row, task_from_row};
use crate::task::{PersistedTask, Session, SessionStatus};
use crate::types::{ResourceGroup, TaskStatus};

/// A reason recorded on tasks left `running` when a prior session never
/// reached a clean shutdown.
pub const CRASH_ERROR: &str = "Process crashed during execution";

/// A reason recorded on tasks belonging to a session superseded by a new one
/// before it could clean up after itself.
pub const SUPERSEDED_ERROR: &str = "Session terminated unexpectedly";

/// A reason recorded on tasks that have been `running` longer than the
/// stuck-task threshold and are swept by [`Persistence::fail_stuck_tasks`].
pub const STUCK_ERROR: &str = "stuck: exceeded maximum running duration";

#[derive(Clone, Debug)]
pub struct Persistence {
    pool: SqlitePool,
}

impl Persistence {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Persistence { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert the session row for a new session. Fails the insert into
    /// `queue_sessions` is a prerequisite for any task persisted under it
    /// (foreign key `queue_tasks.session_id`).
    #[instrument(skip(self), err)]
    pub async fn create_session(&self, session: &Session) -> Result<(), PersistenceError> {
        sqlx::query(
            r"
            INSERT INTO queue_sessions (
                session_id, created_at, started_at, last_activity, ended_at,
                command_line, working_directory, process_id, status,
                completed_count, failed_count, cancelled_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ",
        )
        .bind(session.session_id.to_string())
        .bind(session.created_at.to_rfc3339())
        .bind(session.started_at.map(|t| t.to_rfc3339()))
        .bind(session.last_activity.map(|t| t.to_rfc3339()))
        .bind(session.ended_at.map(|t| t.to_rfc3339()))
        .bind(&session.command_line)
        .bind(&session.working_directory)
        .bind(session.process_id.map(i64::from))
        .bind(session.status.encode())
        .bind(session.completed_count as i64)
        .bind(session.failed_count as i64)
        .bind(session.cancelled_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or replace a task row by primary key. Fails if the owning
    /// session row is absent — the foreign key constraint surfaces as a
    /// `QueryFailed`, which callers should treat as `MissingSession`.
    #[instrument(skip(self, task), err)]
    pub async fn persist_task(&self, task: &PersistedTask) -> Result<(), PersistenceError> {
        let session_exists: Option<(String,)> = sqlx::query_as(
            "SELECT session_id FROM queue_sessions WHERE session_id = ?1",
        )
        .bind(task.session_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        if session_exists.is_none() {
            return Err(PersistenceError::MissingSession {
                session_id: task.session_id.to_string(),
            });
        }

        let operation_data = task
            .operation_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result_data = task
            .result_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r"
            INSERT OR REPLACE INTO queue_tasks (
                id, session_id, type, resource_group, priority, status,
                created_at, started_at, completed_at, estimated_duration_ms,
                actual_duration_ms, retry_count, max_retries, last_error,
                error_stack, file_path, file_size, file_hash, operation_data,
                result_data, memory_usage_kb, cpu_time_ms
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22
            )
            ",
        )
        .bind(task.id.to_string())
        .bind(task.session_id.to_string())
        .bind(task.operation_type.encode())
        .bind(task.resource_group.encode())
        .bind(i64::from(task.priority))
        .bind(task.status.encode())
        .bind(task.created_at.to_rfc3339())
        .bind(task.started_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.estimated_duration_ms)
        .bind(task.actual_duration_ms)
        .bind(i64::from(task.retry_count))
        .bind(i64::from(task.max_retries))
        .bind(&task.last_error)
        .bind(&task.error_stack)
        .bind(&task.file_path)
        .bind(task.file_size)
        .bind(&task.file_hash)
        .bind(operation_data)
        .bind(result_data)
        .bind(task.memory_usage_kb)
        .bind(task.cpu_time_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Transition a task's status, applying the side effects spec'd per
    /// transition: `started_at` on `running`, `completed_at` and
    /// `actual_duration_ms` on any terminal status, `last_error` on failure,
    /// `retry_count += 1` on retry. Terminal transitions also increment the
    /// matching counter (`completed_count`/`failed_count`/`cancelled_count`)
    /// on the owning `queue_sessions` row.
    #[instrument(skip(self, error), err)]
    pub async fn update_task_status(
        &self,
        id: Uuid,
        session_id: Uuid,
        status: TaskStatus,
        error: Option<&str>,
        actual_duration_ms: Option<i64>,
    ) -> Result<(), PersistenceError> {
        let now = Utc::now().to_rfc3339();

        match status {
            TaskStatus::Running => {
                sqlx::query(
                    "UPDATE queue_tasks SET status = ?1, started_at = ?2 WHERE id = ?3",
                )
                .bind(status.encode())
                .bind(&now)
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
            }
            TaskStatus::Completed => {
                sqlx::query(
                    r"
                    UPDATE queue_tasks
                    SET status = ?1, completed_at = ?2, actual_duration_ms = ?3
                    WHERE id = ?4
                    ",
                )
                .bind(status.encode())
                .bind(&now)
                .bind(actual_duration_ms)
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
                self.increment_session_counter(session_id, "completed_count")
                    .await?;
            }
            TaskStatus::Cancelled => {
                sqlx::query(
                    r"
                    UPDATE queue_tasks
                    SET status = ?1, completed_at = ?2, actual_duration_ms = ?3
                    WHERE id = ?4
                    ",
                )
                .bind(status.encode())
                .bind(&now)
                .bind(actual_duration_ms)
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
                self.increment_session_counter(session_id, "cancelled_count")
                    .await?;
            }
            TaskStatus::Failed => {
                sqlx::query(
                    r"
                    UPDATE queue_tasks
                    SET status = ?1, completed_at = ?2, last_error = ?3, actual_duration_ms = ?4
                    WHERE id = ?5
                    ",
                )
                .bind(status.encode())
                .bind(&now)
                .bind(error)
                .bind(actual_duration_ms)
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
                self.increment_session_counter(session_id, "failed_count")
                    .await?;
            }
            TaskStatus::Pending => {
                sqlx::query(
                    r"
                    UPDATE queue_tasks
                    SET status = ?1, retry_count = retry_count + 1, last_error = ?2
                    WHERE id = ?3
                    ",
                )
                .bind(status.encode())
                .bind(error)
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    /// Increment one of `queue_sessions`'s outcome counters by one. `column`
    /// is always a fixed literal from this module, never caller input.
    async fn increment_session_counter(
        &self,
        session_id: Uuid,
        column: &'static str,
    ) -> Result<(), PersistenceError> {
        let sql = format!(
            "UPDATE queue_sessions SET {column} = {column} + 1, last_activity = ?1 WHERE session_id = ?2"
        );
        sqlx::query(&sql)
            .bind(Utc::now().to_rfc3339())
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Attach a result summary to a task that has already been marked
    /// `completed`. Kept separate from `update_task_status` since not every
    /// completion produces a result worth persisting.
    #[instrument(skip(self, result), err)]
    pub async fn record_result(
        &self,
        id: Uuid,
        result: &serde_json::Value,
    ) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE queue_tasks SET result_data = ?1 WHERE id = ?2")
            .bind(serde_json::to_string(result)?)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All tasks with status `pending`, ordered by (priority ascending,
    /// created_at ascending) — the canonical dispatch order.
    #[instrument(skip(self), err)]
    pub async fn load_pending_tasks(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<PersistedTask>, PersistenceError> {
        let rows = sqlx::query(
            r"
            SELECT * FROM queue_tasks
            WHERE session_id = ?1 AND status = 'pending'
            ORDER BY priority ASC, created_at ASC
            ",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    /// Count of tasks currently `running` in this session.
    #[instrument(skip(self), err)]
    pub async fn count_running_tasks(&self, session_id: Uuid) -> Result<u64, PersistenceError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM queue_tasks WHERE session_id = ?1 AND status = 'running'",
        )
        .bind(session_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as u64)
    }

    /// Count of tasks `running` in this session whose `started_at` is older
    /// than `stuck_after` — an individual-task property, unlike group-level
    /// idleness.
    #[instrument(skip(self), err)]
    pub async fn count_stuck_tasks(
        &self,
        session_id: Uuid,
        stuck_after: std::time::Duration,
    ) -> Result<u64, PersistenceError> {
        let cutoff = (Utc::now() - chrono::Duration::from_std(stuck_after).unwrap_or_default())
            .to_rfc3339();
        let row: (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*) FROM queue_tasks
            WHERE session_id = ?1 AND status = 'running' AND started_at < ?2
            ",
        )
        .bind(session_id.to_string())
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as u64)
    }

    /// Fail only the `running` tasks that have exceeded `stuck_after`,
    /// tagging them with [`STUCK_ERROR`] rather than [`CRASH_ERROR`] — a
    /// targeted sweep, not a session-wide crash recovery. Returns the number
    /// of rows affected.
    #[instrument(skip(self), err)]
    pub async fn fail_stuck_tasks(
        &self,
        session_id: Uuid,
        stuck_after: std::time::Duration,
    ) -> Result<u64, PersistenceError> {
        let cutoff = (Utc::now() - chrono::Duration::from_std(stuck_after).unwrap_or_default())
            .to_rfc3339();
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r"
            UPDATE queue_tasks
            SET status = 'failed', completed_at = ?1, last_error = ?2
            WHERE session_id = ?3 AND status = 'running' AND started_at < ?4
            ",
        )
        .bind(&now)
        .bind(STUCK_ERROR)
        .bind(session_id.to_string())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let affected = result.rows_affected();
        if affected > 0 {
            self.increment_session_counter_by(session_id, "failed_count", affected)
                .await?;
        }
        Ok(affected)
    }

    async fn increment_session_counter_by(
        &self,
        session_id: Uuid,
        column: &'static str,
        amount: u64,
    ) -> Result<(), PersistenceError> {
        let sql = format!(
            "UPDATE queue_sessions SET {column} = {column} + ?1, last_activity = ?2 WHERE session_id = ?3"
        );
        sqlx::query(&sql)
            .bind(amount as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mean `actual_duration_ms` across this session's `completed` tasks.
    /// `None` when no completed task has recorded a duration yet.
    #[instrument(skip(self), err)]
    pub async fn average_completed_duration_ms(
        &self,
        session_id: Uuid,
    ) -> Result<Option<f64>, PersistenceError> {
        let row: (Option<f64>,) = sqlx::query_as(
            r"
            SELECT AVG(actual_duration_ms) FROM queue_tasks
            WHERE session_id = ?1 AND status = 'completed' AND actual_duration_ms IS NOT NULL
            ",
        )
        .bind(session_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Insert the new session row and mark any `running` rows belonging to
    /// other sessions as `failed` — recovering from a session that was
    /// superseded without a clean shutdown.
    #[instrument(skip(self), err)]
    pub async fn clear_queue_for_new_session(
        &self,
        new_session: &Session,
    ) -> Result<u64, PersistenceError> {
        self.create_session(new_session).await?;

        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r"
            UPDATE queue_tasks
            SET status = 'failed', completed_at = ?1, last_error = ?2
            WHERE status = 'running' AND session_id != ?3
            ",
        )
        .bind(&now)
        .bind(SUPERSEDED_ERROR)
        .bind(new_session.session_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Reset any `running` rows in `session_id` to `failed` with a crash
    /// error, then return the session's current pending sequence. The
    /// caller re-enqueues the returned tasks.
    #[instrument(skip(self), err)]
    pub async fn recover_from_crash(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<PersistedTask>, PersistenceError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r"
            UPDATE queue_tasks
            SET status = 'failed', completed_at = ?1, last_error = ?2
            WHERE status = 'running' AND session_id = ?3
            ",
        )
        .bind(&now)
        .bind(CRASH_ERROR)
        .bind(session_id.to_string())
        .execute(&self.pool)
        .await?;

        self.load_pending_tasks(session_id).await
    }

    #[instrument(skip(self), err)]
    pub async fn get_current_session(&self) -> Result<Option<Session>, PersistenceError> {
        let row = sqlx::query(
            "SELECT * FROM queue_sessions WHERE status = 'active' ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(session_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn get_task_by_id(&self, id: Uuid) -> Result<Option<PersistedTask>, PersistenceError> {
        let row = sqlx::query("SELECT * FROM queue_tasks WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn delete_task(&self, id: Uuid) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM queue_tasks WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a session closed, recording its final status and counters.
    #[instrument(skip(self), err)]
    pub async fn close_session(
        &self,
        session_id: Uuid,
        status: SessionStatus,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "UPDATE queue_sessions SET status = ?1, ended_at = ?2 WHERE session_id = ?3",
        )
        .bind(status.encode())
        .bind(Utc::now().to_rfc3339())
        .bind(session_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a metrics snapshot row for offline analysis.
    #[instrument(skip(self, resource_group_stats), err)]
    pub async fn record_metrics_snapshot(
        &self,
        session_id: Uuid,
        totals: (u64, u64, u64, u64),
        resource_group_stats: &serde_json::Value,
    ) -> Result<(), PersistenceError> {
        let (submitted, completed, failed, cancelled) = totals;
        sqlx::query(
            r"
            INSERT INTO queue_metrics (
                session_id, snapshot_time, total_submitted, total_completed,
                total_failed, total_cancelled, resource_group_stats
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
        )
        .bind(session_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(submitted as i64)
        .bind(completed as i64)
        .bind(failed as i64)
        .bind(cancelled as i64)
        .bind(serde_json::to_string(resource_group_stats)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert the heartbeat row for the current process/session pair.
    #[instrument(skip(self), err)]
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_heartbeat(
        &self,
        process_id: u32,
        session_id: Uuid,
        rss_kb: Option<i64>,
        uptime_secs: i64,
        memory_leak_detected: bool,
        gc_triggered: bool,
        circuit_breaker_open: bool,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r"
            INSERT INTO process_heartbeat (
                process_id, session_id, timestamp, rss_kb, uptime_secs,
                memory_leak_detected, gc_triggered, circuit_breaker_open
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
        )
        .bind(i64::from(process_id))
        .bind(session_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(rss_kb)
        .bind(uptime_secs)
        .bind(memory_leak_detected)
        .bind(gc_triggered)
        .bind(circuit_breaker_open)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert one breaker's state under `(session_id, resource_group)`.
    /// Called once per group per heartbeat tick, so a crashed process
    /// leaves behind the breaker state it last observed rather than nothing.
    #[instrument(skip(self), err)]
    pub async fn upsert_breaker_state(
        &self,
        session_id: Uuid,
        group: ResourceGroup,
        state: &str,
        failure_count: u32,
        success_count: u32,
        last_failure_time: Option<chrono::DateTime<Utc>>,
        last_success_time: Option<chrono::DateTime<Utc>>,
        state_changed_at: chrono::DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r"
            INSERT INTO circuit_breaker_state (
                session_id, resource_group, state, failure_count, success_count,
                last_failure_time, last_success_time, state_changed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (session_id, resource_group) DO UPDATE SET
                state = excluded.state,
                failure_count = excluded.failure_count,
                success_count = excluded.success_count,
                last_failure_time = excluded.last_failure_time,
                last_success_time = excluded.last_success_time,
                state_changed_at = excluded.state_changed_at
            ",
        )
        .bind(session_id.to_string())
        .bind(group.encode())
        .bind(state)
        .bind(i64::from(failure_count))
        .bind(i64::from(success_count))
        .bind(last_failure_time.map(|t| t.to_rfc3339()))
        .bind(last_success_time.map(|t| t.to_rfc3339()))
        .bind(state_changed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bounded-batch, idempotent purge of rows older than the configured
    /// retention windows. Returns the total number of rows removed across
    /// all tables in this call.
    #[instrument(skip(self), err)]
    pub async fn purge_retention(
        &self,
        completed_tasks_days: u32,
        heartbeat_days: u32,
        metrics_days: u32,
        batch_size: u32,
    ) -> Result<u64, PersistenceError> {
        let mut total = 0u64;

        total += self
            .purge_batched(
                r"
                DELETE FROM queue_tasks WHERE id IN (
                    SELECT id FROM queue_tasks
                    WHERE status IN ('completed', 'failed', 'cancelled')
                      AND completed_at < datetime('now', ?1)
                    LIMIT ?2
                )
                ",
                format!("-{completed_tasks_days} days"),
                batch_size,
            )
            .await?;

        total += self
            .purge_batched(
                r"
                DELETE FROM process_heartbeat WHERE rowid IN (
                    SELECT rowid FROM process_heartbeat
                    WHERE timestamp < datetime('now', ?1)
                    LIMIT ?2
                )
                ",
                format!("-{heartbeat_days} days"),
                batch_size,
            )
            .await?;

        total += self
            .purge_batched(
                r"
                DELETE FROM queue_metrics WHERE rowid IN (
                    SELECT rowid FROM queue_metrics
                    WHERE snapshot_time < datetime('now', ?1)
                    LIMIT ?2
                )
                ",
                format!("-{metrics_days} days"),
                batch_size,
            )
            .await?;

        Ok(total)
    }

    async fn purge_batched(
        &self,
        sql: &str,
        age_modifier: String,
        batch_size: u32,
    ) -> Result<u64, PersistenceError> {
        let mut total = 0u64;
        loop {
            let result = sqlx::query(sql)
                .bind(&age_modifier)
                .bind(i64::from(batch_size))
                .execute(&self.pool)
                .await?;
            let affected = result.rows_affected();
            total += affected;
            if affected == 0 {
                break;
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::SchemaManager;
    use crate::task::Task;
    use crate::task::SubmitOptions;
    use crate::types::OperationType;

    async fn test_persistence() -> (SchemaManager, Persistence) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let schema = SchemaManager::from_pool(pool.clone());
        schema.initialize_schema().await.unwrap();
        (schema, Persistence::new(pool))
    }

    #[tokio::test]
    async fn persist_task_requires_session_row() {
        let (_schema, store) = test_persistence().await;
        let session_id = Uuid::new_v4();
        let task = Task::new(
            session_id,
            OperationType::Computation,
            ResourceGroup::Computation,
            SubmitOptions::default(),
        );
        let persisted = PersistedTask::from_new(&task, Utc::now());
        let err = store.persist_task(&persisted).await.unwrap_err();
        assert!(matches!(err, PersistenceError::MissingSession { .. }));
    }

    #[tokio::test]
    async fn persist_and_load_pending_round_trips_in_order() {
        let (_schema, store) = test_persistence().await;
        let session_id = Uuid::new_v4();
        let session = Session::new_for_current_process(session_id, Utc::now());
        store.create_session(&session).await.unwrap();

        for priority in [3u8, 1, 5] {
            let task = Task::new(
                session_id,
                OperationType::Computation,
                ResourceGroup::Computation,
                SubmitOptions {
                    priority: Some(priority),
                    ..Default::default()
                },
            );
            let persisted = PersistedTask::from_new(&task, Utc::now());
            store.persist_task(&persisted).await.unwrap();
        }

        let pending = store.load_pending_tasks(session_id).await.unwrap();
        let priorities: Vec<u8> = pending.iter().map(|t| t.priority).collect();
        assert_eq!(priorities, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn recover_from_crash_fails_running_tasks() {
        let (_schema, store) = test_persistence().await;
        let session_id = Uuid::new_v4();
        let session = Session::new_for_current_process(session_id, Utc::now());
        store.create_session(&session).await.unwrap();

        let task = Task::new(
            session_id,
            OperationType::Computation,
            ResourceGroup::Computation,
            SubmitOptions::default(),
        );
        let persisted = PersistedTask::from_new(&task, Utc::now());
        store.persist_task(&persisted).await.unwrap();
        store
            .update_task_status(task.id, session_id, TaskStatus::Running, None, None)
            .await
            .unwrap();

        let pending = store.recover_from_crash(session_id).await.unwrap();
        assert!(pending.is_empty());

        let reloaded = store.get_task_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Failed);
        assert_eq!(reloaded.last_error.as_deref(), Some(CRASH_ERROR));
    }

    #[tokio::test]
    async fn completion_increments_session_counter_and_records_duration() {
        let (_schema, store) = test_persistence().await;
        let session_id = Uuid::new_v4();
        let session = Session::new_for_current_process(session_id, Utc::now());
        store.create_session(&session).await.unwrap();

        let task = Task::new(
            session_id,
            OperationType::Computation,
            ResourceGroup::Computation,
            SubmitOptions::default(),
        );
        let persisted = PersistedTask::from_new(&task, Utc::now());
        store.persist_task(&persisted).await.unwrap();
        store
            .update_task_status(task.id, session_id, TaskStatus::Running, None, None)
            .await
            .unwrap();
        store
            .update_task_status(
                task.id,
                session_id,
                TaskStatus::Completed,
                None,
                Some(250),
            )
            .await
            .unwrap();

        let session = store.get_current_session().await.unwrap().unwrap();
        assert_eq!(session.completed_count, 1);
        assert_eq!(session.failed_count, 0);

        let reloaded = store.get_task_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(reloaded.actual_duration_ms, Some(250));

        let avg = store
            .average_completed_duration_ms(session_id)
            .await
            .unwrap();
        assert_eq!(avg, Some(250.0));
    }

    #[tokio::test]
    async fn failure_increments_failed_counter() {
        let (_schema, store) = test_persistence().await;
        let session_id = Uuid::new_v4();
        let session = Session::new_for_current_process(session_id, Utc::now());
        store.create_session(&session).await.unwrap();

        let task = Task::new(
            session_id,
            OperationType::Computation,
            ResourceGroup::Computation,
            SubmitOptions::default(),
        );
        let persisted = PersistedTask::from_new(&task, Utc::now());
        store.persist_task(&persisted).await.unwrap();
        store
            .update_task_status(
                task.id,
                session_id,
                TaskStatus::Failed,
                Some("boom"),
                Some(10),
            )
            .await
            .unwrap();

        let session = store.get_current_session().await.unwrap().unwrap();
        assert_eq!(session.failed_count, 1);
    }

    #[tokio::test]
    async fn fail_stuck_tasks_only_affects_tasks_past_the_threshold() {
        let (_schema, store) = test_persistence().await;
        let session_id = Uuid::new_v4();
        let session = Session::new_for_current_process(session_id, Utc::now());
        store.create_session(&session).await.unwrap();

        let stuck = Task::new(
            session_id,
            OperationType::Computation,
            ResourceGroup::Computation,
            SubmitOptions::default(),
        );
        let fresh = Task::new(
            session_id,
            OperationType::Computation,
            ResourceGroup::Computation,
            SubmitOptions::default(),
        );
        store
            .persist_task(&PersistedTask::from_new(&stuck, Utc::now()))
            .await
            .unwrap();
        store
            .persist_task(&PersistedTask::from_new(&fresh, Utc::now()))
            .await
            .unwrap();

        // Simulate the stuck task having started 10 minutes ago by writing
        // `started_at` directly, since `update_task_status` always stamps
        // `now`.
        sqlx::query("UPDATE queue_tasks SET status = 'running', started_at = ?1 WHERE id = ?2")
            .bind((Utc::now() - chrono::Duration::minutes(10)).to_rfc3339())
            .bind(stuck.id.to_string())
            .execute(store.pool())
            .await
            .unwrap();
        store
            .update_task_status(fresh.id, session_id, TaskStatus::Running, None, None)
            .await
            .unwrap();

        assert_eq!(store.count_running_tasks(session_id).await.unwrap(), 2);
        assert_eq!(
            store
                .count_stuck_tasks(session_id, std::time::Duration::from_secs(5 * 60))
                .await
                .unwrap(),
            1
        );

        let affected = store
            .fail_stuck_tasks(session_id, std::time::Duration::from_secs(5 * 60))
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let stuck_reloaded = store.get_task_by_id(stuck.id).await.unwrap().unwrap();
        assert_eq!(stuck_reloaded.status, TaskStatus::Failed);
        assert_eq!(stuck_reloaded.last_error.as_deref(), Some(STUCK_ERROR));

        let fresh_reloaded = store.get_task_by_id(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh_reloaded.status, TaskStatus::Running);
    }
}
