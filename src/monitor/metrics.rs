//! Metrics aggregation and export.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::errors::PersistenceError;
use crate::monitor::health::read_process_rss_kb;
use crate::queue::InternalQueue;
use crate::store::Persistence;
use crate::throttle::AdaptiveThrottler;
use crate::types::ResourceGroup;

/// Per-group statistics folded into a [`QueueMetrics`] snapshot.
#[derive(Clone, Debug, Default, Serialize)]
pub struct GroupStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub current_throttle_limit: u32,
    pub breaker_failure_count: u32,
}

/// A point-in-time aggregate over the whole session, folding per-session
/// store counters with in-memory queue state.
#[derive(Clone, Debug, Serialize)]
pub struct QueueMetrics {
    pub session_id: Uuid,
    pub snapshot_time: chrono::DateTime<Utc>,
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub success_rate: f64,
    pub average_processing_time_ms: f64,
    pub throughput_per_minute: f64,
    pub memory_usage_mb: f64,
    pub queue_depth: u64,
    pub per_group: HashMap<ResourceGroup, GroupStats>,
}

/// Output format for [`Monitor::export_metrics`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

/// Aggregates per-session counters from the store with in-memory counters
/// from the queues, breakers, and throttlers.
pub struct Monitor {
    persistence: Arc<Persistence>,
    queues: HashMap<ResourceGroup, Arc<InternalQueue>>,
    breakers: HashMap<ResourceGroup, Arc<CircuitBreaker>>,
    throttlers: HashMap<ResourceGroup, Arc<AdaptiveThrottler>>,
    session_start: chrono::DateTime<Utc>,
}

impl Monitor {
    #[must_use]
    pub fn new(
        persistence: Arc<Persistence>,
        queues: HashMap<ResourceGroup, Arc<InternalQueue>>,
        breakers: HashMap<ResourceGroup, Arc<CircuitBreaker>>,
        throttlers: HashMap<ResourceGroup, Arc<AdaptiveThrottler>>,
        session_start: chrono::DateTime<Utc>,
    ) -> Self {
        Monitor {
            persistence,
            queues,
            breakers,
            throttlers,
            session_start,
        }
    }

    /// Build a fresh [`QueueMetrics`] snapshot from current store and
    /// in-memory state.
    #[instrument(skip(self))]
    pub async fn snapshot(&self, session_id: Uuid) -> Result<QueueMetrics, PersistenceError> {
        let session = self.persistence.get_current_session().await?;
        let (completed, failed, cancelled) = session
            .map(|s| (s.completed_count, s.failed_count, s.cancelled_count))
            .unwrap_or((0, 0, 0));

        let pending = self.persistence.load_pending_tasks(session_id).await?;
        let queue_depth = pending.len() as u64;

        let mut per_group: HashMap<ResourceGroup, GroupStats> = HashMap::new();
        for group in ResourceGroup::ALL {
            let mut stats = GroupStats::default();
            stats.pending = pending.iter().filter(|t| t.resource_group == group).count() as u64;
            if let Some(queue) = self.queues.get(&group) {
                stats.pending = queue.staged_count() as u64;
            }
            if let Some(throttler) = self.throttlers.get(&group) {
                stats.current_throttle_limit = throttler.current();
            }
            if let Some(breaker) = self.breakers.get(&group) {
                stats.breaker_failure_count = breaker.get_info().failure_count;
            }
            per_group.insert(group, stats);
        }

        let total_submitted = completed + failed + cancelled + queue_depth;
        let success_rate = if total_submitted == 0 {
            1.0
        } else {
            completed as f64 / total_submitted as f64
        };

        let uptime_minutes =
            (Utc::now().signed_duration_since(self.session_start).num_seconds().max(1) as f64)
                / 60.0;
        let throughput_per_minute = completed as f64 / uptime_minutes;

        let average_processing_time_ms = self
            .persistence
            .average_completed_duration_ms(session_id)
            .await?
            .unwrap_or(0.0);
        let memory_usage_mb = read_process_rss_kb().map_or(0.0, |kb| kb as f64 / 1024.0);

        Ok(QueueMetrics {
            session_id,
            snapshot_time: Utc::now(),
            total_submitted,
            total_completed: completed,
            total_failed: failed,
            total_cancelled: cancelled,
            success_rate,
            average_processing_time_ms,
            throughput_per_minute,
            memory_usage_mb,
            queue_depth,
            per_group,
        })
    }

    /// Persist the snapshot as a `queue_metrics` row for offline analysis.
    #[instrument(skip(self, metrics), err)]
    pub async fn record_snapshot(&self, metrics: &QueueMetrics) -> Result<(), PersistenceError> {
        let stats_json = serde_json::to_value(&metrics.per_group)?;
        self.persistence
            .record_metrics_snapshot(
                metrics.session_id,
                (
                    metrics.total_submitted,
                    metrics.total_completed,
                    metrics.total_failed,
                    metrics.total_cancelled,
                ),
                &stats_json,
            )
            .await
    }

    /// Serialize a snapshot as JSON or a minimal flat CSV. CSV is hand-rolled
    /// rather than pulled from a dedicated csv crate, matching the pack's
    /// stack (no csv dependency is carried anywhere in it).
    #[must_use]
    pub fn export_metrics(metrics: &QueueMetrics, format: ExportFormat) -> String {
        match format {
            ExportFormat::Json => {
                serde_json::to_string_pretty(metrics).unwrap_or_else(|_| "{}".to_string())
            }
            ExportFormat::Csv => {
                let mut out = String::from(
                    "session_id,snapshot_time,total_submitted,total_completed,total_failed,total_cancelled,success_rate,throughput_per_minute,queue_depth\n",
                );
                let _ = writeln!(
                    out,
                    "{},{},{},{},{},{},{:.4},{:.4},{}",
                    metrics.session_id,
                    metrics.snapshot_time.to_rfc3339(),
                    metrics.total_submitted,
                    metrics.total_completed,
                    metrics.total_failed,
                    metrics.total_cancelled,
                    metrics.success_rate,
                    metrics.throughput_per_minute,
                    metrics.queue_depth,
                );
                out
            }
        }
    }
}
