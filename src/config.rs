//! Runtime configuration.
//!
//! `RuntimeConfig` is constructed once at [`crate::facade::TaskCore::initialize`]
//! time via [`RuntimeConfig::builder`], in the fluent-builder idiom used
//! throughout this crate's stability layer. `database_path` resolution
//! follows the same env-override-then-default chain the teacher uses for
//! `SQLITE_DB_NAME`, renamed to this crate's own environment variable.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::ResourceGroup;

/// Per-group circuit breaker parameters (spec defaults in §4.4).
#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
    pub volume_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            volume_threshold: 10,
        }
    }
}

/// Per-group adaptive throttle parameters.
#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    pub initial: u32,
    pub min: u32,
    pub max: u32,
}

impl ThrottleConfig {
    #[must_use]
    pub fn for_group(group: ResourceGroup) -> Self {
        match group {
            ResourceGroup::Filesystem => ThrottleConfig {
                initial: 5,
                min: 2,
                max: 10,
            },
            ResourceGroup::Network => ThrottleConfig {
                initial: 10,
                min: 5,
                max: 20,
            },
            ResourceGroup::Computation => ThrottleConfig {
                initial: 3,
                min: 1,
                max: 6,
            },
            ResourceGroup::MemoryIntensive => ThrottleConfig {
                initial: 2,
                min: 1,
                max: 4,
            },
        }
    }
}

/// How long rows of each kind survive before the retention sweep purges them.
#[derive(Clone, Copy, Debug)]
pub struct RetentionConfig {
    pub completed_tasks_days: u32,
    pub heartbeat_days: u32,
    pub metrics_days: u32,
    pub error_log_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            completed_tasks_days: 7,
            heartbeat_days: 1,
            metrics_days: 30,
            error_log_days: 30,
        }
    }
}

/// Batch sizing and checkpoint cadence for background maintenance work.
#[derive(Clone, Copy, Debug)]
pub struct PerformanceConfig {
    pub batch_insert_size: u32,
    pub checkpoint_interval_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        PerformanceConfig {
            batch_insert_size: 50,
            checkpoint_interval_ms: 60_000,
        }
    }
}

/// Log verbosity, independent of the process-wide `tracing` subscriber; used
/// to scope this crate's own spans when the host application installs a
/// shared subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Top-level runtime configuration, assembled by [`RuntimeConfigBuilder`].
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub database_path: PathBuf,
    pub max_queue_size: u32,
    pub heartbeat_interval_ms: u64,
    pub circuit_breaker: CircuitBreakerConfig,
    pub adjustment_factor: f64,
    pub stability_window_ms: u64,
    pub retention: RetentionConfig,
    pub performance: PerformanceConfig,
    pub log_level: LogLevel,
    pub sanitize_logs: bool,
    pub enable_encryption: bool,
    pub task_timeout: Duration,
    pub shutdown_grace_period: Duration,
}

impl RuntimeConfig {
    /// Start building a config with the documented defaults.
    #[must_use]
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Resolve `current`/`min`/`max` throttle limits for a single group.
    #[must_use]
    pub fn throttle_for(&self, group: ResourceGroup) -> ThrottleConfig {
        ThrottleConfig::for_group(group)
    }

    /// Resolve the default store location.
    ///
    /// Loads a `.env` file from the current directory first (silently
    /// ignored if absent), then checks `TASKCORE_DATABASE_PATH`, then falls
    /// back to `$XDG_DATA_HOME/taskcore/taskcore.db`, then
    /// `$HOME/.local/share/taskcore/taskcore.db`. No `dirs` crate is used,
    /// matching the dependency set of the crate this one is adapted from.
    #[must_use]
    pub fn resolve_default_database_path() -> PathBuf {
        let _ = dotenvy::dotenv();
        if let Ok(explicit) = std::env::var("TASKCORE_DATABASE_PATH") {
            return PathBuf::from(explicit);
        }
        let base = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".local/share")))
            .unwrap_or_else(|_| PathBuf::from("."));
        base.join("taskcore").join("taskcore.db")
    }
}

/// Fluent builder for [`RuntimeConfig`], in the idiom of this crate's
/// stability-layer config builders.
#[derive(Clone, Debug)]
pub struct RuntimeConfigBuilder {
    database_path: Option<PathBuf>,
    max_queue_size: u32,
    heartbeat_interval_ms: u64,
    circuit_breaker: CircuitBreakerConfig,
    adjustment_factor: f64,
    stability_window_ms: u64,
    retention: RetentionConfig,
    performance: PerformanceConfig,
    log_level: LogLevel,
    sanitize_logs: bool,
    enable_encryption: bool,
    task_timeout: Duration,
    shutdown_grace_period: Duration,
}

impl Default for RuntimeConfigBuilder {
    fn default() -> Self {
        RuntimeConfigBuilder {
            database_path: None,
            max_queue_size: 100,
            heartbeat_interval_ms: 15_000,
            circuit_breaker: CircuitBreakerConfig::default(),
            adjustment_factor: 1.0,
            stability_window_ms: 30_000,
            retention: RetentionConfig::default(),
            performance: PerformanceConfig::default(),
            log_level: LogLevel::Info,
            sanitize_logs: false,
            enable_encryption: false,
            task_timeout: Duration::from_secs(300),
            shutdown_grace_period: Duration::from_secs(5),
        }
    }
}

impl RuntimeConfigBuilder {
    #[must_use]
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn max_queue_size(mut self, size: u32) -> Self {
        self.max_queue_size = size;
        self
    }

    #[must_use]
    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    #[must_use]
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    #[must_use]
    pub fn retention(mut self, config: RetentionConfig) -> Self {
        self.retention = config;
        self
    }

    #[must_use]
    pub fn performance(mut self, config: PerformanceConfig) -> Self {
        self.performance = config;
        self
    }

    #[must_use]
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    #[must_use]
    pub fn sanitize_logs(mut self, enabled: bool) -> Self {
        self.sanitize_logs = enabled;
        self
    }

    #[must_use]
    pub fn enable_encryption(mut self, enabled: bool) -> Self {
        self.enable_encryption = enabled;
        self
    }

    #[must_use]
    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    #[must_use]
    pub fn shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    #[must_use]
    pub fn build(self) -> RuntimeConfig {
        RuntimeConfig {
            database_path: self
                .database_path
                .unwrap_or_else(RuntimeConfig::resolve_default_database_path),
            max_queue_size: self.max_queue_size,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            circuit_breaker: self.circuit_breaker,
            adjustment_factor: self.adjustment_factor,
            stability_window_ms: self.stability_window_ms,
            retention: self.retention,
            performance: self.performance,
            log_level: self.log_level,
            sanitize_logs: self.sanitize_logs,
            enable_encryption: self.enable_encryption,
            task_timeout: self.task_timeout,
            shutdown_grace_period: self.shutdown_grace_period,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_defaults() {
        let config = RuntimeConfig::builder().build();
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.retention.completed_tasks_days, 7);
    }

    #[test]
    fn builder_overrides_shutdown_grace_period() {
        let config = RuntimeConfig::builder()
            .shutdown_grace_period(Duration::from_millis(50))
            .build();
        assert_eq!(config.shutdown_grace_period, Duration::from_millis(50));
    }

    #[test]
    fn builder_overrides_database_path() {
        let config = RuntimeConfig::builder()
            .database_path("/tmp/scratch.db")
            .build();
        assert_eq!(config.database_path, PathBuf::from("/tmp/scratch.db"));
    }

    #[test]
    fn throttle_defaults_match_group_table() {
        let config = RuntimeConfig::builder().build();
        let fs = config.throttle_for(ResourceGroup::Filesystem);
        assert_eq!((fs.initial, fs.min, fs.max), (5, 2, 10));
        let net = config.throttle_for(ResourceGroup::Network);
        assert_eq!((net.initial, net.min, net.max), (10, 5, 20));
    }
}
