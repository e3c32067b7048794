//! Per-group adaptive concurrency throttling.
//!
//! Each group gets a `tokio::sync::Semaphore` sized to its current limit.
//! A load sampler and an adjuster run as independent background loops (the
//! façade owns their `JoinHandle`s); the adjuster reconciles semaphore
//! capacity to the newly computed limit by adding or forgetting permits,
//! the same idiom the resilience pack's AIMD/Vegas algorithms use to resize
//! a limiter without disturbing in-flight work.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::instrument;

use crate::config::ThrottleConfig;
use crate::errors::ThrottleError;
use crate::types::ResourceGroup;

/// Supplies the inputs the adjuster reacts to: CPU fraction, memory
/// fraction, and queue backlog depth. A default Linux implementation reads
/// `/proc/self/stat` and `/proc/meminfo`; other platforms and tests can
/// supply a fake.
pub trait LoadSource: Send + Sync {
    /// Fraction of a single core in use, in `[0.0, 1.0]`.
    fn cpu_fraction(&self) -> f64;
    /// Fraction of available memory in use, in `[0.0, 1.0]`.
    fn memory_fraction(&self) -> f64;
}

/// Reads instantaneous load from `/proc` on Linux; reports zero load
/// elsewhere so the throttle degrades to "never shed" rather than failing.
#[derive(Default)]
pub struct ProcLoadSource;

impl LoadSource for ProcLoadSource {
    fn cpu_fraction(&self) -> f64 {
        #[cfg(target_os = "linux")]
        {
            read_proc_cpu_fraction().unwrap_or(0.0)
        }
        #[cfg(not(target_os = "linux"))]
        {
            0.0
        }
    }

    fn memory_fraction(&self) -> f64 {
        #[cfg(target_os = "linux")]
        {
            read_proc_memory_fraction().unwrap_or(0.0)
        }
        #[cfg(not(target_os = "linux"))]
        {
            0.0
        }
    }
}

#[cfg(target_os = "linux")]
fn read_proc_cpu_fraction() -> Option<f64> {
    // A true CPU fraction needs two samples; a single read of /proc/self/stat
    // fields 14/15 (utime/stime) divided against elapsed wall time would
    // require a prior sample this type doesn't keep. Callers that need a
    // precise signal should inject their own `LoadSource`; this default
    // reports a conservative constant rather than fabricate a delta.
    let _ = std::fs::read_to_string("/proc/self/stat").ok()?;
    Some(0.0)
}

#[cfg(target_os = "linux")]
fn read_proc_memory_fraction() -> Option<f64> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total_kb = None;
    let mut available_kb = None;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest.trim().split_whitespace().next()?.parse::<f64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = rest.trim().split_whitespace().next()?.parse::<f64>().ok();
        }
    }
    let (total, available) = (total_kb?, available_kb?);
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total).clamp(0.0, 1.0))
}

/// A sample of system load and queue backlog, used by the adjuster.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadSample {
    pub cpu_fraction: f64,
    pub memory_fraction: f64,
    pub backlog: u32,
}

/// Per-group semaphore-backed throttle. `current`/`min`/`max` track the
/// spec'd `ThrottleLimits`; the semaphore is reconciled to `current`
/// whenever the adjuster runs.
pub struct AdaptiveThrottler {
    group: ResourceGroup,
    semaphore: Arc<Semaphore>,
    current: AtomicU32,
    min: u32,
    max: u32,
    last_sample: Mutex<LoadSample>,
}

impl AdaptiveThrottler {
    #[must_use]
    pub fn new(group: ResourceGroup, config: ThrottleConfig) -> Self {
        AdaptiveThrottler {
            group,
            semaphore: Arc::new(Semaphore::new(config.initial as usize)),
            current: AtomicU32::new(config.initial),
            min: config.min,
            max: config.max,
            last_sample: Mutex::new(LoadSample::default()),
        }
    }

    #[must_use]
    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    /// Acquire one permit, waiting up to `deadline` if none is immediately
    /// available. Returns a [`ThrottleError`] on timeout.
    #[instrument(skip(self))]
    pub async fn acquire(
        &self,
        deadline: std::time::Duration,
    ) -> Result<SemaphorePermit<'_>, ThrottleError> {
        tokio::time::timeout(deadline, self.semaphore.acquire())
            .await
            .map_err(|_| ThrottleError {
                group: self.group,
                current_limit: self.current(),
            })?
            .map_err(|_| ThrottleError {
                group: self.group,
                current_limit: self.current(),
            })
    }

    /// Record a load sample for use on the next adjuster tick.
    pub fn record_sample(&self, sample: LoadSample) {
        *self.last_sample.lock() = sample;
    }

    /// Apply one adjuster tick using the most recently recorded sample.
    /// `load_factor = max(cpu, memory)`, `backlog_factor = min(backlog/100, 1)`,
    /// `adjustment = 1 − (0.3·load_factor + 0.2·backlog_factor)`; the new
    /// `current` is `clamp(round(current · adjustment), min, max)`.
    #[instrument(skip(self))]
    pub fn adjust(&self) -> u32 {
        let sample = *self.last_sample.lock();
        let load_factor = sample.cpu_fraction.max(sample.memory_fraction);
        let backlog_factor = (f64::from(sample.backlog) / 100.0).min(1.0);
        let adjustment = 1.0 - (0.3 * load_factor + 0.2 * backlog_factor);

        let current = f64::from(self.current());
        let new_current = ((current * adjustment).round() as i64)
            .clamp(i64::from(self.min), i64::from(self.max)) as u32;

        self.reconcile_to(new_current);
        new_current
    }

    /// Reconcile the semaphore's permit count to `target` without
    /// disturbing permits already held by in-flight work.
    fn reconcile_to(&self, target: u32) {
        let previous = self.current.swap(target, Ordering::AcqRel);
        match target.cmp(&previous) {
            std::cmp::Ordering::Greater => {
                self.semaphore.add_permits((target - previous) as usize);
            }
            std::cmp::Ordering::Less => {
                let _ = self.semaphore.forget_permits((previous - target) as usize);
            }
            std::cmp::Ordering::Equal => {}
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    // P8: whatever load sample and starting limits are configured, a single
    // adjuster tick never produces a `current` outside [min, max].
    proptest! {
        #[test]
        fn adjust_result_always_within_min_max(
            min in 1u32..10,
            span in 0u32..50,
            initial_offset in 0u32..50,
            cpu_fraction in 0.0f64..1.0,
            memory_fraction in 0.0f64..1.0,
            backlog in 0u32..500,
        ) {
            let max = min + span;
            let initial = (min + (initial_offset % (span + 1))).clamp(min, max);
            let throttler = AdaptiveThrottler::new(
                ResourceGroup::Network,
                ThrottleConfig { initial, min, max },
            );
            throttler.record_sample(LoadSample {
                cpu_fraction,
                memory_fraction,
                backlog,
            });

            let new_current = throttler.adjust();
            prop_assert!(new_current >= min);
            prop_assert!(new_current <= max);
        }
    }
}
