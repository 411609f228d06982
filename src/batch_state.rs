use crate::clock::{sleep_for, Clock};
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};

/// `[start, end)` window a batch covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub bot_log_id: i64,
}

/// The four states the batch loop moves through. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Init,
    Waiting,
    Working,
    Stopped,
}

/// Owns the current batch window and the retry/loop bookkeeping around it.
/// A small explicit state machine rather than implicit flags.
pub struct BatchState {
    pub phase: BatchPhase,
    pub batch: Batch,
    pub current_timestamp: DateTime<Utc>,
    pub retrials_left: u32,
    pub loop_count: u64,
    retry_count: u32,
    interval: Duration,
}

impl BatchState {
    /// Builds the next batch window from the last-processed
    /// `batch_end_epoch`.
    pub fn initialize(
        prev_end: DateTime<Utc>,
        last_bot_log_id: i64,
        interval: Duration,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Self {
        BatchState {
            phase: BatchPhase::Init,
            batch: Batch {
                start_time: prev_end,
                end_time: prev_end + interval,
                bot_log_id: last_bot_log_id,
            },
            current_timestamp: now,
            retrials_left: retry_count,
            loop_count: 0,
            retry_count,
            interval,
        }
    }

    /// Blocks until `batch.end_time` has passed, plus the 2-minute safety
    /// margin that lets the upstream submission pipeline settle. Never
    /// sleeps a negative duration.
    pub async fn wait_until_batch_ends(&mut self, clock: &dyn Clock) {
        self.phase = BatchPhase::Waiting;
        let now = clock.now();
        if self.batch.end_time > now {
            let wait = (self.batch.end_time - now) + Duration::minutes(2);
            sleep_for(wait).await;
        }
        self.current_timestamp = clock.now();
        self.phase = BatchPhase::Working;
    }

    /// Whether the batch's end time is still in the future relative to
    /// `current_timestamp`. Mirrors `coordinator.py`'s
    /// `cur_batch_end > cur_timestamp` early-return check.
    pub fn batch_end_is_future(&self) -> bool {
        self.batch.end_time > self.current_timestamp
    }

    /// Commit succeeded, move the window forward.
    pub fn advance_to_next_batch(&mut self, new_bot_log_id: i64, clock: &dyn Clock) {
        self.retrials_left = self.retry_count;
        let overran = self.batch.start_time >= self.current_timestamp;
        self.batch = Batch {
            start_time: self.batch.end_time,
            end_time: self.batch.end_time + self.interval,
            bot_log_id: new_bot_log_id,
        };
        self.loop_count += 1;
        self.current_timestamp = clock.now();
        self.phase = BatchPhase::Waiting;
        if overran {
            warn!(
                "batch processing overran: start_time {} was already past when the batch committed",
                self.batch.start_time
            );
        }
        info!(
            "advanced to batch [{}, {}), bot_log_id={}",
            self.batch.start_time, self.batch.end_time, self.batch.bot_log_id
        );
    }

    /// Commit failed, re-run the same window unless retries are
    /// exhausted. A retry does not advance the window.
    pub fn retry_batch(&mut self, clock: &dyn Clock) {
        if self.retrials_left > 0 {
            self.retrials_left -= 1;
        } else {
            self.phase = BatchPhase::Stopped;
        }
        self.loop_count += 1;
        self.current_timestamp = clock.now();
    }

    pub fn is_stopped(&self) -> bool {
        self.phase == BatchPhase::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use std::sync::Mutex;

    struct FixedClock(Mutex<DateTime<Utc>>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn epoch(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn advance_is_contiguous_with_previous_window() {
        let clock = FixedClock(Mutex::new(epoch(0)));
        let mut state = BatchState::initialize(epoch(0), 1, Duration::minutes(20), 3, epoch(0));
        let end_before = state.batch.end_time;
        state.advance_to_next_batch(2, &clock);
        assert_eq!(state.batch.start_time, end_before);
        assert_eq!(state.batch.bot_log_id, 2);
        assert_eq!(state.retrials_left, 3);
    }

    #[test]
    fn retry_decrements_until_exhausted_then_stops() {
        let clock = FixedClock(Mutex::new(epoch(0)));
        let mut state = BatchState::initialize(epoch(0), 1, Duration::minutes(20), 2, epoch(0));
        let window_before = state.batch;

        state.retry_batch(&clock);
        assert_eq!(state.retrials_left, 1);
        assert_eq!(state.batch, window_before, "retry must not advance the window");

        state.retry_batch(&clock);
        assert_eq!(state.retrials_left, 0);
        assert!(!state.is_stopped());

        state.retry_batch(&clock);
        assert!(state.is_stopped());
    }

    #[tokio::test]
    async fn wait_until_batch_ends_never_sleeps_negative() {
        let clock = FixedClock(Mutex::new(epoch(1_000_000)));
        let mut state = BatchState::initialize(
            epoch(1_000_000 - 1200),
            1,
            Duration::minutes(20),
            3,
            epoch(1_000_000 - 1200),
        );
        // end_time is already in the past relative to `now`.
        let start = std::time::Instant::now();
        state.wait_until_batch_ends(&clock).await;
        assert!(start.elapsed() < std::time::Duration::from_millis(100));
    }

    #[test]
    fn advance_warns_on_overrun_without_panicking() {
        let clock = FixedClock(Mutex::new(epoch(10_000)));
        let mut state = BatchState::initialize(epoch(0), 1, Duration::minutes(20), 3, epoch(10_000));
        state.advance_to_next_batch(2, &clock);
        assert_eq!(state.loop_count, 1);
    }
}
