//! # taskcore: persistent, in-process task queue and execution scheduler
//!
//! `taskcore` gives a long-running application a durable place to submit
//! filesystem, network, computation, and memory-intensive work, dispatch it
//! under per-resource-group concurrency limits, survive a crash without
//! losing track of what was running, and report on its own health.
//!
//! ## Core Concepts
//!
//! - **Task**: a unit of submitted work, tagged with a [`types::ResourceGroup`]
//!   and an informational [`types::OperationType`], carrying a priority and a
//!   retry budget.
//! - **Session**: the process-lifetime container tasks are submitted under;
//!   tracks aggregate completion/failure/cancellation counts.
//! - **Store**: the `sqlx`-backed persistence layer — schema migrations and
//!   CRUD for tasks, sessions, heartbeats, and metrics snapshots.
//! - **Queue**: one priority-and-aging ordered queue per resource group, each
//!   with its own bounded dispatch loop.
//! - **CircuitBreaker** / **AdaptiveThrottler**: per-group stability
//!   controls that open under sustained failure and shed load under
//!   resource pressure.
//! - **Monitor**: aggregates health and throughput metrics and exports them
//!   as JSON or CSV.
//! - **Facade**: the single entry point applications use to initialize the
//!   runtime, submit work, wait on results, and shut down cleanly.
//!
//! ## Quick Start
//!
//! ### Configuring and starting the runtime
//!
//! ```no_run
//! use taskcore::config::RuntimeConfig;
//! use taskcore::facade::TaskCore;
//!
//! # async fn run() -> Result<(), taskcore::errors::CoreError> {
//! let config = RuntimeConfig::builder()
//!     .database_path("./taskcore.db")
//!     .build();
//!
//! let core = TaskCore::initialize(config).await?;
//! core.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Submitting work
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use serde_json::Value;
//!
//! use taskcore::config::RuntimeConfig;
//! use taskcore::facade::TaskCore;
//! use taskcore::queue::{FactoryRegistry, OperationFactory, OperationOutcome};
//! use taskcore::task::SubmitOptions;
//! use taskcore::types::OperationType;
//!
//! struct ReadConfigFile;
//!
//! #[async_trait]
//! impl OperationFactory for ReadConfigFile {
//!     async fn execute(&self, _operation_data: Option<&Value>) -> OperationOutcome {
//!         Ok(None)
//!     }
//! }
//!
//! # async fn run() -> Result<(), taskcore::errors::CoreError> {
//! let core = TaskCore::initialize(RuntimeConfig::builder().build()).await?;
//!
//! let mut factories: FactoryRegistry = HashMap::new();
//! factories.insert(OperationType::FileRead, Arc::new(ReadConfigFile));
//! core.start(factories).await?;
//!
//! let task_id = core
//!     .submit_filesystem(OperationType::FileRead, SubmitOptions::default())
//!     .await?;
//!
//! let outcome = core.wait_for_task(task_id, Some(Duration::from_secs(30))).await?;
//! println!("task finished: {outcome:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ### Error Handling
//!
//! Every fallible façade operation returns a [`errors::CoreError`], a
//! `thiserror` + `miette::Diagnostic` enum aggregating the lower-layer error
//! taxonomy (schema, persistence, queue, circuit breaker, throttle, timeout)
//! so callers get one type to match on and a human-readable diagnostic for
//! free.
//!
//! ```rust
//! use taskcore::errors::CoreError;
//!
//! fn explain(err: &CoreError) -> String {
//!     format!("operation failed: {err}")
//! }
//! ```
//!
//! ## Module Guide
//!
//! - [`types`] - closed domain enumerations (`ResourceGroup`, `OperationType`, `TaskStatus`)
//! - [`task`] - `Task`, `PersistedTask`, `SubmitOptions`, `Session`
//! - [`errors`] - the crate's error taxonomy
//! - [`config`] - `RuntimeConfig` and its sub-configuration builders
//! - [`store`] - schema migrations and durable persistence
//! - [`breaker`] - per-group circuit breaker state machine
//! - [`throttle`] - per-group adaptive concurrency throttling
//! - [`queue`] - priority-and-aging ordered dispatch queues
//! - [`monitor`] - health checks and metrics aggregation/export
//! - [`retention`] - periodic retention sweep over terminal tasks
//! - [`facade`] - the public entry point applications use

pub mod breaker;
pub mod config;
pub mod errors;
pub mod facade;
pub mod monitor;
pub mod queue;
pub mod retention;
pub mod store;
pub mod task;
pub mod throttle;
pub mod types;
