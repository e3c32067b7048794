//! The staging buffer, worker registry, and dispatch loop for one resource
//! group.
//!
//! Submit persists first, then stages — so the in-memory buffer's order
//! only ever needs to reflect `load_pending_tasks`' order on recovery, never
//! reconstruct it independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::errors::QueueError;
use crate::queue::ordering::{StagedEntry, pick_next};
use crate::store::Persistence;
use crate::task::Task;
use crate::throttle::AdaptiveThrottler;
use crate::types::{OperationType, ResourceGroup, TaskStatus};

/// What a submitted operation produces: an opaque JSON summary on success,
/// or a message recorded verbatim into `last_error` on failure.
pub type OperationOutcome = Result<Option<Value>, String>;

/// Reconstructs and runs an operation from its persisted descriptor.
/// Submitters register one factory per [`OperationType`] with the façade;
/// on crash recovery the factory indexed by a task's `operation_type`
/// rebuilds the executable operation from `operation_data`.
#[async_trait]
pub trait OperationFactory: Send + Sync {
    async fn execute(&self, operation_data: Option<&Value>) -> OperationOutcome;
}

/// A task waiting to be dispatched, plus the buffer permit that reserves its
/// place until it is popped.
struct Staged {
    task: Task,
    retry_count: u32,
    _permit: OwnedSemaphorePermit,
}

/// Outcome of attempting to cancel a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed from the staging buffer before it ever ran.
    WasStaged,
    /// Was executing; its operation has been signaled to stop.
    InterruptedRunning,
    /// Not known to this queue (already terminal, or never existed here).
    NotFound,
}

/// One resource group's staging buffer, pause flag, and running-task
/// cancellation registry.
pub struct InternalQueue {
    group: ResourceGroup,
    admission: Arc<Semaphore>,
    staging: Mutex<Vec<StagedEntry<Staged>>>,
    running_cancel: Mutex<HashMap<Uuid, Arc<Notify>>>,
    wake: Notify,
    paused: AtomicBool,
    shutting_down: Arc<AtomicBool>,
    last_processed: Mutex<Option<chrono::DateTime<Utc>>>,
    sequence: std::sync::atomic::AtomicU64,
}

impl InternalQueue {
    #[must_use]
    pub fn new(group: ResourceGroup, capacity: usize) -> Self {
        InternalQueue {
            group,
            admission: Arc::new(Semaphore::new(capacity)),
            staging: Mutex::new(Vec::new()),
            running_cancel: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            paused: AtomicBool::new(false),
            shutting_down: Arc::new(AtomicBool::new(false)),
            last_processed: Mutex::new(None),
            sequence: std::sync::atomic::AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn group(&self) -> ResourceGroup {
        self.group
    }

    /// Stage a task for dispatch. Suspends while the buffer is full — this
    /// is deliberate backpressure, not an error.
    pub async fn enqueue(&self, task: Task, retry_count: u32) -> Result<(), QueueError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(QueueError::ShuttingDown { group: self.group });
        }

        let permit = self
            .admission
            .clone()
            .acquire_owned()
            .await
            .expect("admission semaphore is never closed while the queue is alive");

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let entry = StagedEntry {
            priority: task.priority,
            retry_count,
            enqueued_at: Utc::now(),
            sequence,
            payload: Staged {
                task,
                retry_count,
                _permit: permit,
            },
        };

        self.staging.lock().push(entry);
        self.wake.notify_one();
        Ok(())
    }

    /// Pop the next task in dispatch order, if any is staged.
    fn try_pop(&self) -> Option<(Task, u32)> {
        let mut staging = self.staging.lock();
        let now = Utc::now();
        let idx = pick_next(&staging, now)?;
        let entry = staging.remove(idx);
        Some((entry.payload.task, entry.payload.retry_count))
    }

    /// Remove a staged (not yet running) task by id. Returns `true` if found.
    fn remove_staged(&self, id: Uuid) -> bool {
        let mut staging = self.staging.lock();
        let before = staging.len();
        staging.retain(|e| e.payload.task.id != id);
        staging.len() != before
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.wake.notify_one();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.wake.notify_waiters();
        for notify in self.running_cancel.lock().values() {
            notify.notify_waiters();
        }
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn staged_count(&self) -> usize {
        self.staging.lock().len()
    }

    #[must_use]
    pub fn last_processed(&self) -> Option<chrono::DateTime<Utc>> {
        *self.last_processed.lock()
    }

    /// Attempt to cancel a task by id, whether staged or currently running.
    pub fn cancel(&self, id: Uuid) -> CancelOutcome {
        if self.remove_staged(id) {
            return CancelOutcome::WasStaged;
        }
        let running = self.running_cancel.lock();
        if let Some(notify) = running.get(&id) {
            notify.notify_waiters();
            return CancelOutcome::InterruptedRunning;
        }
        CancelOutcome::NotFound
    }

    fn register_running(&self, id: Uuid) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.running_cancel.lock().insert(id, notify.clone());
        notify
    }

    fn unregister_running(&self, id: Uuid) {
        self.running_cancel.lock().remove(&id);
    }
}

/// Registry of operation factories keyed by the closed `OperationType` set.
pub type FactoryRegistry = HashMap<OperationType, Arc<dyn OperationFactory>>;

/// Run the dispatch loop for one group until shutdown. Spawned as a
/// supervised `tokio::task` by the façade, one per resource group.
#[instrument(skip(queue, persistence, breaker, throttler, factories))]
pub async fn run_dispatch_loop(
    queue: Arc<InternalQueue>,
    persistence: Arc<Persistence>,
    breaker: Arc<CircuitBreaker>,
    throttler: Arc<AdaptiveThrottler>,
    factories: Arc<FactoryRegistry>,
    task_timeout: std::time::Duration,
) {
    loop {
        if queue.is_shutting_down() {
            return;
        }

        if queue.is_paused() {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            continue;
        }

        let Some((task, retry_count)) = queue.try_pop() else {
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            continue;
        };

        let permit = match throttler.acquire(task_timeout).await {
            Ok(permit) => permit,
            Err(_) => {
                if let Err(e) = persistence
                    .update_task_status(
                        task.id,
                        task.session_id,
                        TaskStatus::Failed,
                        Some("throttle timeout"),
                        None,
                    )
                    .await
                {
                    warn!(error = %e, task_id = %task.id, "failed to record throttle timeout");
                }
                continue;
            }
        };

        if breaker.try_acquire().is_err() {
            drop(permit);
            breaker.record_failure();
            if let Err(e) = persistence
                .update_task_status(
                    task.id,
                    task.session_id,
                    TaskStatus::Failed,
                    Some("circuit breaker open"),
                    None,
                )
                .await
            {
                warn!(error = %e, task_id = %task.id, "failed to record breaker rejection");
            }
            continue;
        }

        let dispatched_at = Utc::now();
        if let Err(e) = persistence
            .update_task_status(task.id, task.session_id, TaskStatus::Running, None, None)
            .await
        {
            warn!(error = %e, task_id = %task.id, "failed to mark task running");
        }

        let cancel_notify = queue.register_running(task.id);
        let factory = factories.get(&task.operation_type).cloned();

        let outcome = match factory {
            None => Err(format!("no factory registered for {}", task.operation_type)),
            Some(factory) => {
                let operation_data = task.operation_data.clone();
                tokio::select! {
                    result = tokio::time::timeout(task_timeout, factory.execute(operation_data.as_ref())) => {
                        match result {
                            Ok(outcome) => outcome,
                            Err(_) => Err(format!("task {} exceeded its execution deadline", task.id)),
                        }
                    }
                    () = cancel_notify.notified() => Err("cancelled".to_string()),
                }
            }
        };

        queue.unregister_running(task.id);
        drop(permit);
        let finished_at = Utc::now();
        *queue.last_processed.lock() = Some(finished_at);
        let actual_duration_ms = finished_at
            .signed_duration_since(dispatched_at)
            .num_milliseconds()
            .max(0);

        match outcome {
            Ok(result) => {
                breaker.record_success();
                if let Err(e) = persistence
                    .update_task_status(
                        task.id,
                        task.session_id,
                        TaskStatus::Completed,
                        None,
                        Some(actual_duration_ms),
                    )
                    .await
                {
                    warn!(error = %e, task_id = %task.id, "failed to record completion");
                }
                if let Some(value) = result {
                    if let Err(e) = persistence.record_result(task.id, &value).await {
                        warn!(error = %e, task_id = %task.id, "failed to record result");
                    }
                }
                info!(task_id = %task.id, group = %queue.group(), "task completed");
            }
            Err(reason) if reason == "cancelled" => {
                if let Err(e) = persistence
                    .update_task_status(
                        task.id,
                        task.session_id,
                        TaskStatus::Cancelled,
                        None,
                        Some(actual_duration_ms),
                    )
                    .await
                {
                    warn!(error = %e, task_id = %task.id, "failed to record cancellation");
                }
            }
            Err(reason) => {
                breaker.record_failure();
                if retry_count < task.max_retries {
                    if let Err(e) = persistence
                        .update_task_status(
                            task.id,
                            task.session_id,
                            TaskStatus::Pending,
                            Some(&reason),
                            None,
                        )
                        .await
                    {
                        warn!(error = %e, task_id = %task.id, "failed to record retry");
                    }
                    if let Err(e) = queue.enqueue(task.clone(), retry_count + 1).await {
                        warn!(error = %e, task_id = %task.id, "failed to re-stage retried task");
                    }
                } else if let Err(e) = persistence
                    .update_task_status(
                        task.id,
                        task.session_id,
                        TaskStatus::Failed,
                        Some(&reason),
                        Some(actual_duration_ms),
                    )
                    .await
                {
                    warn!(error = %e, task_id = %task.id, "failed to record terminal failure");
                }
            }
        }
    }
}
