pub mod pods;
pub mod processes;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A `[start, end)` sub-interval dispatched to a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiniInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Splits `[start, end)` into `n` equal-width, integer-second
/// sub-intervals whose union exactly covers the window; the last
/// sub-interval absorbs any remainder.
pub fn split_into_mini_batches(start: DateTime<Utc>, end: DateTime<Utc>, n: u32) -> Vec<MiniInterval> {
    assert!(n > 0, "MINI_BATCH_NUMBER must be positive");
    let total_seconds = (end - start).num_seconds().max(0);
    let chunk = total_seconds / n as i64;

    let mut intervals = Vec::with_capacity(n as usize);
    let mut cursor = start;
    for i in 0..n {
        let is_last = i == n - 1;
        let next = if is_last { end } else { cursor + chrono::Duration::seconds(chunk) };
        intervals.push(MiniInterval { start: cursor, end: next });
        cursor = next;
    }
    intervals
}

/// Pluggable capability interface for fanning mini-batches out to verifier
/// workers and blocking until all have finished.
#[async_trait]
pub trait WorkerDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        intervals: &[MiniInterval],
        image: &str,
        tag: &str,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(s: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(s, 0).unwrap()
    }

    #[test]
    fn split_covers_window_exactly() {
        let intervals = split_into_mini_batches(t(0), t(1200), 4);
        assert_eq!(intervals.len(), 4);
        assert_eq!(intervals[0].start, t(0));
        assert_eq!(intervals.last().unwrap().end, t(1200));
        for w in intervals.windows(2) {
            assert_eq!(w[0].end, w[1].start);
        }
    }

    #[test]
    fn last_interval_absorbs_remainder() {
        // 1000 seconds / 3 = 333 with remainder 1; last interval should be
        // 334 seconds wide so the union still covers [0, 1000) exactly.
        let intervals = split_into_mini_batches(t(0), t(1000), 3);
        assert_eq!(intervals[0].end - intervals[0].start, chrono::Duration::seconds(333));
        assert_eq!(intervals[1].end - intervals[1].start, chrono::Duration::seconds(333));
        assert_eq!(intervals[2].end, t(1000));
    }

    #[test]
    fn single_mini_batch_is_the_whole_window() {
        let intervals = split_into_mini_batches(t(0), t(1200), 1);
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0], MiniInterval { start: t(0), end: t(1200) });
    }
}
