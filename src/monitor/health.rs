//! Periodic health checks, heartbeat tracking, and automatic remediation.
//!
//! `StabilityMonitor` runs a pluggable set of checks each tick the way the
//! resilience pack's `HealthChecker` trait models a single check against a
//! resource — here each check reports against this crate's own store, queue,
//! breaker, and system-load state rather than an external dependency.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::breaker::{BreakerStateKind, CircuitBreaker};
use crate::store::Persistence;
use crate::store::SchemaManager;
use crate::throttle::AdaptiveThrottler;
use crate::types::ResourceGroup;

/// A task in `running` for longer than this is considered stuck.
pub const STUCK_TASK_AGE: Duration = Duration::from_secs(5 * 60);

pub const HIGH_RSS_KB: u64 = 500 * 1024;
pub const HIGH_HEAP_KB: u64 = 400 * 1024;
pub const HIGH_EXTERNAL_KB: u64 = 100 * 1024;

#[derive(Clone, Copy, Debug)]
pub struct DatabaseHealth {
    pub connected: bool,
    pub schema_valid: bool,
    pub response_time_ms: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct QueueHealth {
    pub pending_count: u64,
    pub running_count: u64,
    pub stuck_tasks_count: u64,
    pub average_processing_time_ms: f64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryHealth {
    pub rss_kb: u64,
    pub heap_used_kb: Option<u64>,
    pub heap_total_kb: Option<u64>,
    pub external_kb: Option<u64>,
}

impl MemoryHealth {
    #[must_use]
    pub fn high_rss(&self) -> bool {
        self.rss_kb > HIGH_RSS_KB
    }

    #[must_use]
    pub fn high_heap(&self) -> bool {
        self.heap_used_kb.is_some_and(|kb| kb > HIGH_HEAP_KB)
    }

    #[must_use]
    pub fn high_external(&self) -> bool {
        self.external_kb.is_some_and(|kb| kb > HIGH_EXTERNAL_KB)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemLoadSnapshot {
    pub cpu_fraction: f64,
    pub memory_fraction: f64,
}

#[derive(Clone, Debug)]
pub struct HealthMetrics {
    pub database: DatabaseHealth,
    pub queue: QueueHealth,
    pub breaker_open_groups: Vec<ResourceGroup>,
    pub system_load: SystemLoadSnapshot,
    pub memory: MemoryHealth,
    pub timestamp: DateTime<Utc>,
}

impl HealthMetrics {
    /// `is_healthy`: at least 70% of the six checks hold.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        let checks = [
            self.database.connected,
            self.queue.stuck_tasks_count == 0,
            self.breaker_open_groups.is_empty(),
            self.system_load.cpu_fraction < 0.9,
            self.system_load.memory_fraction < 0.9,
            !self.memory.high_heap(),
        ];
        let passing = checks.iter().filter(|c| **c).count();
        (passing as f64) / (checks.len() as f64) >= 0.7
    }
}

#[derive(Clone, Debug)]
pub struct HeartbeatState {
    pub last_heartbeat: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub is_healthy: bool,
    pub uptime_start: DateTime<Utc>,
}

impl HeartbeatState {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        HeartbeatState {
            last_heartbeat: now,
            consecutive_failures: 0,
            is_healthy: true,
            uptime_start: now,
        }
    }
}

/// What remediation decided to do on an unhealthy tick; surfaced for logging
/// and tests rather than swallowed silently.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemediationReport {
    pub reconnect_requested: bool,
    pub stuck_tasks_swept: u64,
    pub breakers_force_closed: Vec<ResourceGroup>,
    pub gc_hint_requested: bool,
}

pub struct StabilityMonitor {
    persistence: Arc<Persistence>,
    schema: Arc<SchemaManager>,
    breakers: HashMap<ResourceGroup, Arc<CircuitBreaker>>,
    throttlers: HashMap<ResourceGroup, Arc<AdaptiveThrottler>>,
    heartbeat: Mutex<HeartbeatState>,
}

impl StabilityMonitor {
    #[must_use]
    pub fn new(
        persistence: Arc<Persistence>,
        schema: Arc<SchemaManager>,
        breakers: HashMap<ResourceGroup, Arc<CircuitBreaker>>,
        throttlers: HashMap<ResourceGroup, Arc<AdaptiveThrottler>>,
    ) -> Self {
        let now = Utc::now();
        StabilityMonitor {
            persistence,
            schema,
            breakers,
            throttlers,
            heartbeat: Mutex::new(HeartbeatState::new(now)),
        }
    }

    #[must_use]
    pub fn get_heartbeat(&self) -> HeartbeatState {
        self.heartbeat.lock().clone()
    }

    /// Collect `HealthMetrics` without mutating heartbeat state.
    #[instrument(skip(self))]
    pub async fn get_health_metrics(&self, session_id: uuid::Uuid) -> HealthMetrics {
        let db_start = std::time::Instant::now();
        let schema_valid = self.schema.validate().await.unwrap_or(false);
        let connected = schema_valid;
        let database = DatabaseHealth {
            connected,
            schema_valid,
            response_time_ms: db_start.elapsed().as_millis() as u64,
        };

        let mut pending_count = 0u64;
        if let Ok(pending) = self.persistence.load_pending_tasks(session_id).await {
            pending_count = pending.len() as u64;
        }
        let now = Utc::now();
        let running_count = self
            .persistence
            .count_running_tasks(session_id)
            .await
            .unwrap_or(0);
        let stuck_tasks_count = self
            .persistence
            .count_stuck_tasks(session_id, STUCK_TASK_AGE)
            .await
            .unwrap_or(0);
        let average_processing_time_ms = self
            .persistence
            .average_completed_duration_ms(session_id)
            .await
            .ok()
            .flatten()
            .unwrap_or(0.0);

        let queue_health = QueueHealth {
            pending_count,
            running_count,
            stuck_tasks_count,
            average_processing_time_ms,
        };

        let breaker_open_groups: Vec<ResourceGroup> = self
            .breakers
            .iter()
            .filter(|(_, breaker)| breaker.check_state() == BreakerStateKind::Open)
            .map(|(group, _)| *group)
            .collect();

        let system_load = SystemLoadSnapshot::default();

        HealthMetrics {
            database,
            queue: queue_health,
            breaker_open_groups,
            system_load,
            memory: MemoryHealth::default(),
            timestamp: now,
        }
    }

    /// One full health-loop tick: collect metrics, update heartbeat state,
    /// remediate if unhealthy.
    #[instrument(skip(self))]
    pub async fn perform_health_check(
        &self,
        session_id: uuid::Uuid,
    ) -> (HealthMetrics, bool) {
        let metrics = self.get_health_metrics(session_id).await;
        let healthy = metrics.is_healthy();

        {
            let mut heartbeat = self.heartbeat.lock();
            heartbeat.last_heartbeat = metrics.timestamp;
            heartbeat.is_healthy = healthy;
            if healthy {
                heartbeat.consecutive_failures = 0;
            } else {
                heartbeat.consecutive_failures += 1;
            }
        }

        if !healthy {
            let report = self.remediate(&metrics, session_id).await;
            warn!(?report, "remediation applied after unhealthy check");
        }

        (metrics, healthy)
    }

    async fn remediate(
        &self,
        metrics: &HealthMetrics,
        session_id: uuid::Uuid,
    ) -> RemediationReport {
        let mut report = RemediationReport::default();

        if !metrics.database.connected {
            report.reconnect_requested = true;
        }

        if metrics.queue.stuck_tasks_count > 0 {
            match self
                .persistence
                .fail_stuck_tasks(session_id, STUCK_TASK_AGE)
                .await
            {
                Ok(swept) => report.stuck_tasks_swept = swept,
                Err(e) => warn!(error = %e, "failed to sweep stuck tasks"),
            }
        }

        let normal_load = metrics.system_load.cpu_fraction < 0.5
            && metrics.system_load.memory_fraction < 0.7
            && metrics.database.connected;
        if normal_load {
            for group in &metrics.breaker_open_groups {
                if let Some(breaker) = self.breakers.get(group) {
                    breaker.force_close();
                    report.breakers_force_closed.push(*group);
                }
            }
        }

        if metrics.memory.high_heap() {
            report.gc_hint_requested = true;
        }

        // High CPU/memory is left to the throttler's own adjuster tick; this
        // monitor does not reach into `self.throttlers` to force a change.
        let _ = &self.throttlers;

        report
    }

    /// One heartbeat-loop tick: run a full health check, then persist a
    /// `process_heartbeat` row summarizing it.
    #[instrument(skip(self))]
    pub async fn heartbeat_tick(&self, session_id: uuid::Uuid) -> HealthMetrics {
        let (metrics, healthy) = self.perform_health_check(session_id).await;

        let uptime_secs = metrics
            .timestamp
            .signed_duration_since(self.get_heartbeat().uptime_start)
            .num_seconds()
            .max(0);
        let memory_leak_detected = metrics.memory.high_rss() || metrics.memory.high_heap();
        // `remediate` only requests a GC hint while unhealthy, and only when
        // heap usage is high — mirrored here without re-running remediation.
        let gc_triggered = !healthy && metrics.memory.high_heap();
        let circuit_breaker_open = !metrics.breaker_open_groups.is_empty();

        if let Err(e) = self
            .persistence
            .upsert_heartbeat(
                std::process::id(),
                session_id,
                read_process_rss_kb(),
                uptime_secs,
                memory_leak_detected,
                gc_triggered,
                circuit_breaker_open,
            )
            .await
        {
            warn!(error = %e, "failed to persist heartbeat row");
        }

        for (group, breaker) in &self.breakers {
            let info = breaker.get_info();
            if let Err(e) = self
                .persistence
                .upsert_breaker_state(
                    session_id,
                    *group,
                    info.state.as_str(),
                    info.failure_count,
                    info.success_count,
                    info.last_failure_time,
                    info.last_success_time,
                    info.state_changed_at,
                )
                .await
            {
                warn!(error = %e, group = %group, "failed to persist breaker state row");
            }
        }

        metrics
    }

    /// Release whatever the monitor is holding and log its final state.
    /// Called by the façade during `shutdown`, after the last heartbeat tick.
    pub fn cleanup(&self) {
        let heartbeat = self.get_heartbeat();
        info!(
            consecutive_failures = heartbeat.consecutive_failures,
            is_healthy = heartbeat.is_healthy,
            "stability monitor cleanup"
        );
    }
}

/// Spawn the heartbeat loop: ticks every `interval_ms`, running a full
/// health check and persisting a `process_heartbeat` row each time.
pub fn spawn_heartbeat_loop(
    monitor: Arc<StabilityMonitor>,
    session_id: uuid::Uuid,
    interval_ms: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        loop {
            ticker.tick().await;
            monitor.heartbeat_tick(session_id).await;
        }
    })
}

#[cfg(target_os = "linux")]
pub(crate) fn read_process_rss_kb() -> Option<i64> {
    let contents = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            return rest.trim().split_whitespace().next()?.parse::<i64>().ok();
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn read_process_rss_kb() -> Option<i64> {
    None
}
