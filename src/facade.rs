//! The public entry point: lifecycle, submission, waiting, and introspection.
//!
//! `TaskCore` owns every process-wide singleton — the store handle, one
//! breaker/throttler/queue per resource group, and the stability monitor —
//! the way the teacher's runtime owns its checkpointer and channel registry.
//! Construction is always explicit via [`TaskCore::initialize`]; nothing is
//! built implicitly, so a test can stand up a second, fully isolated core
//! against a scratch database.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::config::RuntimeConfig;
use crate::errors::{CoreError, QueueError};
use crate::monitor::{HealthMetrics, Monitor, QueueMetrics, StabilityMonitor};
use crate::queue::{FactoryRegistry, InternalQueue, OperationFactory, run_dispatch_loop};
use crate::retention::spawn_retention_loop;
use crate::store::{Persistence, SchemaManager};
use crate::task::{PersistedTask, Session, SessionStatus, SubmitOptions, Task};
use crate::types::{OperationType, ResourceGroup, TaskStatus};

/// How often `wait_for_task` polls the store for a terminal status.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Hook for an optional advanced collaborator (a multi-tier cache, a
/// performance profiler, a memory optimizer) to observe health checks and
/// request remediation. The core functions identically with zero observers
/// registered — this is a notification seam, not a dependency.
pub trait StabilityObserver: Send + Sync {
    fn on_health_check(&self, metrics: &HealthMetrics);
}

/// Snapshot returned by [`TaskCore::get_status`].
#[derive(Clone, Debug)]
pub struct QueueStatus {
    pub session_id: Uuid,
    pub paused: HashMap<ResourceGroup, bool>,
    pub staged_counts: HashMap<ResourceGroup, usize>,
}

/// Combined status and metrics, as returned by [`TaskCore::get_status`].
#[derive(Clone, Debug)]
pub struct StatusReport {
    pub queue_status: QueueStatus,
    pub metrics: QueueMetrics,
}

struct Handles {
    dispatch: Vec<JoinHandle<()>>,
    retention: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

/// The persistent, in-process task queue and execution scheduler.
pub struct TaskCore {
    config: RuntimeConfig,
    session_id: Uuid,
    schema: Arc<SchemaManager>,
    persistence: Arc<Persistence>,
    queues: HashMap<ResourceGroup, Arc<InternalQueue>>,
    breakers: HashMap<ResourceGroup, Arc<CircuitBreaker>>,
    throttlers: HashMap<ResourceGroup, Arc<crate::throttle::AdaptiveThrottler>>,
    monitor: Monitor,
    stability: Arc<StabilityMonitor>,
    handles: SyncMutex<Handles>,
    observers: SyncMutex<Vec<Arc<dyn StabilityObserver>>>,
}

impl TaskCore {
    /// Open the store, run migrations, supersede any prior active session,
    /// and assemble the per-group runtime state. Does not yet spawn dispatch
    /// loops — call [`TaskCore::start`] once operation factories are
    /// registered.
    #[instrument(skip(config), err)]
    pub async fn initialize(config: RuntimeConfig) -> Result<Self, CoreError> {
        let schema = SchemaManager::open(&config.database_path).await?;
        let schema = Arc::new(schema);
        let persistence = Arc::new(Persistence::new(schema.pool().clone()));

        let session_id = Uuid::new_v4();
        let now = Utc::now();
        let session = Session::new_for_current_process(session_id, now);
        persistence.clear_queue_for_new_session(&session).await?;

        let mut queues = HashMap::new();
        let mut breakers = HashMap::new();
        let mut throttlers = HashMap::new();
        for group in ResourceGroup::ALL {
            queues.insert(
                group,
                Arc::new(InternalQueue::new(group, config.max_queue_size as usize)),
            );
            breakers.insert(
                group,
                Arc::new(CircuitBreaker::new(group, config.circuit_breaker.clone())),
            );
            throttlers.insert(
                group,
                Arc::new(crate::throttle::AdaptiveThrottler::new(
                    group,
                    config.throttle_for(group),
                )),
            );
        }

        let monitor = Monitor::new(
            persistence.clone(),
            queues.clone(),
            breakers.clone(),
            throttlers.clone(),
            now,
        );
        let stability = Arc::new(StabilityMonitor::new(
            persistence.clone(),
            schema.clone(),
            breakers.clone(),
            throttlers.clone(),
        ));

        info!(%session_id, "task core initialized");

        Ok(TaskCore {
            config,
            session_id,
            schema,
            persistence,
            queues,
            breakers,
            throttlers,
            monitor,
            stability,
            handles: SyncMutex::new(Handles {
                dispatch: Vec::new(),
                retention: None,
                heartbeat: None,
            }),
            observers: SyncMutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Register an advanced collaborator (a multi-tier cache, a performance
    /// profiler, a memory optimizer) to be notified after every health check.
    /// The core's behavior is identical with zero observers registered.
    pub fn register_observer(&self, observer: Arc<dyn StabilityObserver>) {
        self.observers.lock().push(observer);
    }

    /// Spawn one dispatch loop per resource group plus the retention sweep,
    /// using `factories` to reconstruct operations for every submitted or
    /// recovered task. Recovers any task left `running` by a prior crash of
    /// this same session before the first dispatch tick.
    #[instrument(skip(self, factories), err)]
    pub async fn start(
        &self,
        factories: FactoryRegistry,
    ) -> Result<(), CoreError> {
        self.persistence.recover_from_crash(self.session_id).await?;

        let factories = Arc::new(factories);
        let mut handles = self.handles.lock();

        for group in ResourceGroup::ALL {
            let queue = self.queues[&group].clone();
            let persistence = self.persistence.clone();
            let breaker = self.breakers[&group].clone();
            let throttler = self.throttlers[&group].clone();
            let factories = factories.clone();
            let task_timeout = self.config.task_timeout;
            handles.dispatch.push(tokio::spawn(async move {
                run_dispatch_loop(queue, persistence, breaker, throttler, factories, task_timeout)
                    .await;
            }));
        }

        handles.retention = Some(spawn_retention_loop(
            self.persistence.clone(),
            self.config.retention,
            self.config.performance.checkpoint_interval_ms,
            self.config.performance.batch_insert_size,
        ));

        handles.heartbeat = Some(crate::monitor::spawn_heartbeat_loop(
            self.stability.clone(),
            self.session_id,
            self.config.heartbeat_interval_ms,
        ));

        Ok(())
    }

    fn resolve_group(&self, operation_type: OperationType, is_memory_intensive: bool) -> ResourceGroup {
        if is_memory_intensive && operation_type.default_group() == ResourceGroup::Computation {
            ResourceGroup::MemoryIntensive
        } else {
            operation_type.default_group()
        }
    }

    /// Persist and stage a task. `operation_type` determines the default
    /// resource group; `options.is_memory_intensive` reroutes a computation
    /// submission to the `memory-intensive` group.
    #[instrument(skip(self, options), err)]
    async fn submit(
        &self,
        operation_type: OperationType,
        options: SubmitOptions,
    ) -> Result<Uuid, CoreError> {
        let group = self.resolve_group(operation_type, options.is_memory_intensive);
        let task = Task::new(self.session_id, operation_type, group, options);
        let persisted = PersistedTask::from_new(&task, Utc::now());
        self.persistence.persist_task(&persisted).await?;

        let queue = self
            .queues
            .get(&group)
            .ok_or_else(|| QueueError::UnknownGroup(format!("{group}")))?;
        queue.enqueue(task.clone(), 0).await?;

        Ok(task.id)
    }

    #[instrument(skip(self, options), err)]
    pub async fn submit_filesystem(
        &self,
        operation_type: OperationType,
        options: SubmitOptions,
    ) -> Result<Uuid, CoreError> {
        self.submit(operation_type, options).await
    }

    #[instrument(skip(self, options), err)]
    pub async fn submit_network(
        &self,
        operation_type: OperationType,
        options: SubmitOptions,
    ) -> Result<Uuid, CoreError> {
        self.submit(operation_type, options).await
    }

    #[instrument(skip(self, options), err)]
    pub async fn submit_computation(
        &self,
        options: SubmitOptions,
    ) -> Result<Uuid, CoreError> {
        self.submit(OperationType::Computation, options).await
    }

    /// Poll the store at [`POLL_INTERVAL`] until the task reaches a terminal
    /// status or `timeout` elapses.
    #[instrument(skip(self), err)]
    pub async fn wait_for_task(
        &self,
        id: Uuid,
        timeout: Option<Duration>,
    ) -> Result<Option<PersistedTask>, CoreError> {
        let deadline = timeout.map(|d| tokio::time::Instant::now() + d);
        loop {
            let task = self.persistence.get_task_by_id(id).await?;
            if let Some(ref t) = task {
                if t.status.is_terminal() {
                    return Ok(task);
                }
            } else {
                return Ok(None);
            }

            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return Ok(task);
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Look up a task's current persisted row without waiting for a
    /// terminal status.
    #[instrument(skip(self), err)]
    pub async fn get_task(&self, id: Uuid) -> Result<Option<PersistedTask>, CoreError> {
        Ok(self.persistence.get_task_by_id(id).await?)
    }

    pub fn pause_all(&self) {
        for queue in self.queues.values() {
            queue.pause();
        }
    }

    pub fn resume_all(&self) {
        for queue in self.queues.values() {
            queue.resume();
        }
    }

    /// Cancel a task by id, trying every group's queue (the caller does not
    /// need to know which group it was routed to).
    pub fn cancel(&self, id: Uuid) -> crate::queue::CancelOutcome {
        for queue in self.queues.values() {
            let outcome = queue.cancel(id);
            if outcome != crate::queue::CancelOutcome::NotFound {
                return outcome;
            }
        }
        crate::queue::CancelOutcome::NotFound
    }

    #[instrument(skip(self), err)]
    pub async fn get_status(&self) -> Result<StatusReport, CoreError> {
        let mut paused = HashMap::new();
        let mut staged_counts = HashMap::new();
        for group in ResourceGroup::ALL {
            let queue = &self.queues[&group];
            paused.insert(group, queue.is_paused());
            staged_counts.insert(group, queue.staged_count());
        }
        let metrics = self.monitor.snapshot(self.session_id).await?;
        Ok(StatusReport {
            queue_status: QueueStatus {
                session_id: self.session_id,
                paused,
                staged_counts,
            },
            metrics,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_health(&self) -> HealthMetrics {
        let (metrics, _healthy) = self.stability.perform_health_check(self.session_id).await;
        for observer in self.observers.lock().iter() {
            observer.on_health_check(&metrics);
        }
        metrics
    }

    #[instrument(skip(self), err)]
    pub async fn export_metrics(
        &self,
        format: crate::monitor::ExportFormat,
    ) -> Result<String, CoreError> {
        let metrics = self.monitor.snapshot(self.session_id).await?;
        self.monitor.record_snapshot(&metrics).await?;
        Ok(Monitor::export_metrics(&metrics, format))
    }

    /// Signal every queue to stop accepting work, give in-flight dispatch
    /// loops a grace period to notice and exit cleanly, then abort whatever
    /// is still running and close the session row. In-flight tasks that
    /// don't finish within the grace period are left `running` in the
    /// store; the next `initialize()` repairs them via `recover_from_crash`.
    #[instrument(skip(self), err)]
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        for queue in self.queues.values() {
            queue.begin_shutdown();
        }

        tokio::time::sleep(self.config.shutdown_grace_period).await;

        let mut handles = self.handles.lock();
        if let Some(retention) = handles.retention.take() {
            retention.abort();
        }
        if let Some(heartbeat) = handles.heartbeat.take() {
            heartbeat.abort();
        }
        for handle in handles.dispatch.drain(..) {
            handle.abort();
        }
        drop(handles);

        self.stability.cleanup();

        self.persistence
            .close_session(self.session_id, SessionStatus::Completed)
            .await?;

        if self.schema.validate().await.is_err() {
            warn!("schema validation failed during shutdown");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct EchoFactory;

    #[async_trait]
    impl OperationFactory for EchoFactory {
        async fn execute(&self, operation_data: Option<&Value>) -> crate::queue::OperationOutcome {
            Ok(operation_data.cloned())
        }
    }

    struct FailingFactory;

    #[async_trait]
    impl OperationFactory for FailingFactory {
        async fn execute(&self, _operation_data: Option<&Value>) -> crate::queue::OperationOutcome {
            Err("operation always fails".to_string())
        }
    }

    async fn core_at(dir: &std::path::Path) -> TaskCore {
        let config = RuntimeConfig::builder()
            .database_path(dir.join("taskcore.db"))
            .shutdown_grace_period(Duration::from_millis(10))
            .build();
        TaskCore::initialize(config).await.unwrap()
    }

    #[tokio::test]
    async fn submit_and_complete_round_trips_result() {
        let dir = tempdir().unwrap();
        let core = core_at(dir.path()).await;

        let mut factories: FactoryRegistry = HashMap::new();
        factories.insert(OperationType::Computation, Arc::new(EchoFactory));
        core.start(factories).await.unwrap();

        let id = core
            .submit_computation(SubmitOptions {
                operation_data: Some(serde_json::json!({"n": 1})),
                ..Default::default()
            })
            .await
            .unwrap();

        let result = core
            .wait_for_task(id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let task = result.expect("task row exists");
        assert_eq!(task.status, TaskStatus::Completed);

        core.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn retries_are_capped_at_max_retries() {
        let dir = tempdir().unwrap();
        let core = core_at(dir.path()).await;

        let mut factories: FactoryRegistry = HashMap::new();
        factories.insert(OperationType::Computation, Arc::new(FailingFactory));
        core.start(factories).await.unwrap();

        let id = core
            .submit_computation(SubmitOptions {
                max_retries: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();

        let result = core
            .wait_for_task(id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let task = result.expect("task row exists");
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.retry_count <= 1);

        core.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn registered_observer_is_notified_on_health_check() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingObserver(Arc<AtomicUsize>);

        impl StabilityObserver for CountingObserver {
            fn on_health_check(&self, _metrics: &HealthMetrics) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dir = tempdir().unwrap();
        let core = core_at(dir.path()).await;

        let calls = Arc::new(AtomicUsize::new(0));
        core.register_observer(Arc::new(CountingObserver(calls.clone())));

        let _ = core.get_health().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        core.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn memory_intensive_flag_routes_computation_to_its_own_group() {
        let dir = tempdir().unwrap();
        let core = core_at(dir.path()).await;
        assert_eq!(
            core.resolve_group(OperationType::Computation, true),
            ResourceGroup::MemoryIntensive
        );
        assert_eq!(
            core.resolve_group(OperationType::Computation, false),
            ResourceGroup::Computation
        );
        core.shutdown().await.unwrap();
    }
}
