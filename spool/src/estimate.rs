use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::JobPriority;

/// Historical processing-time source for wait estimates.
#[async_trait]
pub trait WaitTimeEstimator: Send + Sync {
    /// Mean run time of the final attempt (`completed_at` minus the queue
    /// entry's `processing_started_at`) of jobs of `priority` that completed
    /// after `since`, or `None` without samples.
    async fn average_processing_time(
        &self,
        priority: JobPriority,
        since: DateTime<Utc>,
    ) -> Result<Option<Duration>>;
}

/// `wait = (position - 1) * average`.
///
/// Non-decreasing in `position` for a fixed average; positions below 1 wait
/// nothing.
pub fn estimate_wait(position: i32, average: Duration) -> Duration {
    let ahead = i64::from(position.max(1) - 1);
    let average_ms = average.num_milliseconds().max(0);
    Duration::milliseconds(ahead.saturating_mul(average_ms))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitEstimate {
    pub position: i32,
    pub average_processing_seconds: i64,
    pub wait_seconds: i64,
    pub estimated_start: DateTime<Utc>,
    pub estimated_completion: DateTime<Utc>,
    /// False when the fallback average was used.
    pub from_history: bool,
}

impl WaitEstimate {
    pub fn new(
        position: i32,
        average: Option<Duration>,
        fallback: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let from_history = average.is_some();
        let average = average.unwrap_or(fallback);
        let wait = estimate_wait(position, average);
        let estimated_start = later(now, wait);
        Self {
            position,
            average_processing_seconds: average.num_seconds(),
            wait_seconds: wait.num_seconds(),
            estimated_start,
            estimated_completion: later(estimated_start, average),
            from_history,
        }
    }
}

fn later(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_in_line_waits_nothing() {
        assert_eq!(estimate_wait(1, Duration::minutes(7)), Duration::zero());
        assert_eq!(estimate_wait(0, Duration::minutes(7)), Duration::zero());
    }

    #[test]
    fn test_estimate_is_monotonic_in_position() {
        let average = Duration::seconds(95);
        let mut previous = Duration::zero();
        for position in 1..500 {
            let wait = estimate_wait(position, average);
            assert!(wait >= previous, "position {position}");
            previous = wait;
        }
        assert_eq!(estimate_wait(4, average), Duration::seconds(285));
    }

    #[test]
    fn test_fallback_average() {
        let now = Utc::now();
        let estimate = WaitEstimate::new(3, None, Duration::minutes(5), now);
        assert!(!estimate.from_history);
        assert_eq!(estimate.wait_seconds, 600);
        assert_eq!(estimate.estimated_completion, now + Duration::minutes(15));

        let estimate = WaitEstimate::new(3, Some(Duration::minutes(1)), Duration::minutes(5), now);
        assert!(estimate.from_history);
        assert_eq!(estimate.wait_seconds, 120);
    }

    #[test]
    fn test_far_future_estimates_saturate() {
        let now = Utc::now();
        let estimate = WaitEstimate::new(i32::MAX, Some(Duration::MAX), Duration::minutes(5), now);
        assert_eq!(estimate.estimated_start, DateTime::<Utc>::MAX_UTC);
        assert_eq!(estimate.estimated_completion, DateTime::<Utc>::MAX_UTC);
    }
}
