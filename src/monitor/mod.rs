//! L3: observability — health, heartbeat, remediation, and metrics export.

pub mod health;
pub mod metrics;

pub use health::{
    DatabaseHealth, HealthMetrics, HeartbeatState, MemoryHealth, QueueHealth, RemediationReport,
    StabilityMonitor, SystemLoadSnapshot, spawn_heartbeat_loop,
};
pub use metrics::{ExportFormat, GroupStats, Monitor, QueueMetrics};
