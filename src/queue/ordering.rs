//! Priority-and-aging dispatch ordering.
//!
//! The staging buffer keeps waiting tasks in a flat `Vec` rather than a
//! `BinaryHeap`: the aging term in the score is continuous, so a heap built
//! from scores computed at push time would go stale the moment time passes.
//! With the spec's default buffer capacity (100) a linear rescan on every
//! pop is cheap and always exact, so that is what [`pick_next`] does.

use chrono::{DateTime, Utc};

/// One task waiting in a group's staging buffer.
#[derive(Clone, Debug)]
pub struct StagedEntry<T> {
    pub payload: T,
    pub priority: u8,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Monotonic counter assigned at enqueue time; the final tie-break so
    /// ordering is total even when two entries share priority and were
    /// enqueued within the same clock tick (invariant I6).
    pub sequence: u64,
}

impl<T> StagedEntry<T> {
    fn score(&self, now: DateTime<Utc>) -> f64 {
        let age_minutes =
            (now.signed_duration_since(self.enqueued_at).num_milliseconds().max(0) as f64) / 60_000.0;
        f64::from(self.priority) + 0.01 * age_minutes + 0.5 * f64::from(self.retry_count)
    }
}

/// Select the index of the entry with the lowest dispatch score (ties broken
/// by sequence, i.e. submission order). Returns `None` for an empty buffer.
#[must_use]
pub fn pick_next<T>(entries: &[StagedEntry<T>], now: DateTime<Utc>) -> Option<usize> {
    entries
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            a.score(now)
                .partial_cmp(&b.score(now))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.sequence.cmp(&b.sequence))
        })
        .map(|(idx, _)| idx)
}
