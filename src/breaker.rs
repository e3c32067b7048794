//! Per-group circuit breaker.
//!
//! One finite-state machine per `(session, resource_group)`. Unlike a
//! sliding-window rate breaker, this one tracks plain failure/success
//! counters as spec'd — closer in spirit to the simplest configuration of
//! the resilience pack's `Circuit`, with `transition_to`/`force_open`/
//! `force_close` kept as the same explicit, auditable operations.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::instrument;

use crate::config::CircuitBreakerConfig;
use crate::errors::CircuitBreakerError;
use crate::types::ResourceGroup;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BreakerStateKind {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl BreakerStateKind {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => BreakerStateKind::Open,
            2 => BreakerStateKind::HalfOpen,
            _ => BreakerStateKind::Closed,
        }
    }

    /// Stable string form, matching `circuit_breaker_state.state`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerStateKind::Closed => "closed",
            BreakerStateKind::Open => "open",
            BreakerStateKind::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time snapshot of a breaker, returned by `get_info`. Mirrors the
/// `circuit_breaker_state` table's columns so it can be persisted verbatim.
#[derive(Clone, Copy, Debug)]
pub struct BreakerInfo {
    pub state: BreakerStateKind,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_rate: f64,
    pub total_calls: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub state_changed_at: DateTime<Utc>,
}

struct Inner {
    failure_count: u32,
    success_count: u32,
    total_failures: u64,
    total_calls: u64,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    state_changed_at: DateTime<Utc>,
}

/// The breaker for a single `(session, resource_group)` pair.
pub struct CircuitBreaker {
    group: ResourceGroup,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(group: ResourceGroup, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            group,
            config,
            state: AtomicU8::new(BreakerStateKind::Closed as u8),
            inner: Mutex::new(Inner {
                failure_count: 0,
                success_count: 0,
                total_failures: 0,
                total_calls: 0,
                last_failure_time: None,
                last_success_time: None,
                state_changed_at: Utc::now(),
            }),
        }
    }

    fn state_raw(&self) -> BreakerStateKind {
        BreakerStateKind::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Evaluate the `open → half-open` timeout transition, then report the
    /// current state. Non-blocking.
    #[must_use]
    pub fn check_state(&self) -> BreakerStateKind {
        if self.state_raw() == BreakerStateKind::Open {
            let elapsed_ms = {
                let inner = self.inner.lock();
                Utc::now()
                    .signed_duration_since(inner.state_changed_at)
                    .num_milliseconds()
                    .max(0) as u128
            };
            if elapsed_ms >= self.config.recovery_timeout.as_millis() {
                self.transition_to(BreakerStateKind::HalfOpen);
            }
        }
        self.state_raw()
    }

    /// Returns `Ok(())` if dispatch is permitted for this group, or a
    /// [`CircuitBreakerError`] if the breaker is open.
    #[instrument(skip(self))]
    pub fn try_acquire(&self) -> Result<(), CircuitBreakerError> {
        match self.check_state() {
            BreakerStateKind::Open => {
                let failure_count = self.inner.lock().failure_count;
                Err(CircuitBreakerError {
                    group: self.group,
                    failure_count,
                })
            }
            BreakerStateKind::Closed | BreakerStateKind::HalfOpen => Ok(()),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.last_success_time = Some(Utc::now());

        match self.state_raw() {
            BreakerStateKind::Closed => {
                inner.failure_count = 0;
            }
            BreakerStateKind::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    drop(inner);
                    self.transition_to(BreakerStateKind::Closed);
                }
            }
            BreakerStateKind::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.total_failures += 1;
        inner.failure_count += 1;
        inner.last_failure_time = Some(Utc::now());

        match self.state_raw() {
            BreakerStateKind::Closed => {
                if inner.failure_count >= self.config.failure_threshold
                    && inner.total_calls >= u64::from(self.config.volume_threshold)
                {
                    drop(inner);
                    self.transition_to(BreakerStateKind::Open);
                }
            }
            BreakerStateKind::HalfOpen => {
                drop(inner);
                self.transition_to(BreakerStateKind::Open);
            }
            BreakerStateKind::Open => {}
        }
    }

    pub fn force_open(&self) {
        self.transition_to(BreakerStateKind::Open);
    }

    pub fn force_close(&self) {
        self.transition_to(BreakerStateKind::Closed);
    }

    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.total_failures = 0;
        inner.total_calls = 0;
        inner.last_failure_time = None;
        inner.last_success_time = None;
    }

    #[must_use]
    pub fn get_info(&self) -> BreakerInfo {
        let inner = self.inner.lock();
        let failure_rate = if inner.total_calls == 0 {
            0.0
        } else {
            inner.total_failures as f64 / inner.total_calls as f64
        };
        BreakerInfo {
            state: self.state_raw(),
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_rate,
            total_calls: inner.total_calls,
            last_failure_time: inner.last_failure_time,
            last_success_time: inner.last_success_time,
            state_changed_at: inner.state_changed_at,
        }
    }

    fn transition_to(&self, next: BreakerStateKind) {
        let previous = self.state_raw();
        if previous == next {
            return;
        }
        self.state.store(next as u8, Ordering::Release);
        let mut inner = self.inner.lock();
        inner.state_changed_at = Utc::now();
        if next == BreakerStateKind::Closed {
            inner.failure_count = 0;
            inner.success_count = 0;
        } else if next == BreakerStateKind::HalfOpen {
            inner.success_count = 0;
        }
    }
}

/// Test-only helper to avoid sleeping real time across a recovery timeout.
#[cfg(test)]
impl CircuitBreaker {
    fn force_recovery_timeout_elapsed(&self) {
        let mut inner = self.inner.lock();
        inner.state_changed_at = Utc::now() - chrono::Duration::hours(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            volume_threshold: 1,
        }
    }

    #[test]
    fn opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new(ResourceGroup::Network, config());
        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.check_state(), BreakerStateKind::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.check_state(), BreakerStateKind::Open);
    }

    #[test]
    fn open_rejects_until_recovery_timeout() {
        let breaker = CircuitBreaker::new(ResourceGroup::Network, config());
        breaker.force_open();
        assert!(breaker.try_acquire().is_err());

        breaker.force_recovery_timeout_elapsed();
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.check_state(), BreakerStateKind::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new(ResourceGroup::Network, config());
        breaker.force_open();
        breaker.force_recovery_timeout_elapsed();
        breaker.check_state();
        assert_eq!(breaker.check_state(), BreakerStateKind::HalfOpen);

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.check_state(), BreakerStateKind::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.check_state(), BreakerStateKind::Closed);
    }

    #[test]
    fn half_open_reopens_on_any_failure() {
        let breaker = CircuitBreaker::new(ResourceGroup::Network, config());
        breaker.force_open();
        breaker.force_recovery_timeout_elapsed();
        breaker.check_state();

        breaker.record_failure();
        assert_eq!(breaker.check_state(), BreakerStateKind::Open);
    }

    #[test]
    fn success_while_closed_resets_failure_count() {
        let breaker = CircuitBreaker::new(ResourceGroup::Network, config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.get_info().failure_count, 0);
    }
}
