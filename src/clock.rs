use chrono::{DateTime, Duration, Utc};
use std::time::Duration as StdDuration;

/// Monotonic wall-clock source, trait-ified so tests can control "now"
/// without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Scoped duration measurement: `start()` a timer, `elapsed()` when done.
/// Used by `WorkerDispatcher::dispatch` to drive the alarm webhook.
pub struct Timer {
    start: std::time::Instant,
}

impl Timer {
    pub fn start() -> Self {
        Timer { start: std::time::Instant::now() }
    }

    pub fn elapsed(&self) -> StdDuration {
        self.start.elapsed()
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }
}

/// Sleeps `duration` if positive; never sleeps negative.
pub async fn sleep_for(duration: Duration) {
    if let Ok(std_duration) = duration.to_std() {
        tokio::time::sleep(std_duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[tokio::test]
    async fn sleep_for_negative_duration_returns_immediately() {
        let start = std::time::Instant::now();
        sleep_for(Duration::seconds(-5)).await;
        assert!(start.elapsed() < StdDuration::from_millis(100));
    }
}
