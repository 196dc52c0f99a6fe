use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::{Job, JobId, OwnerId, QueueEntry};

/// Moves failed jobs back into the queue within their retry budget.
///
/// The only gate between automatic retries is the retry count and an
/// optional `next_retry_at` set by whoever reported the failure; no backoff
/// is computed here.
#[async_trait]
pub trait RetryCoordinator: Send + Sync {
    /// Requeue up to `limit` failed jobs with
    /// `retry_count < min(max_retries, entry.max_retries)` whose
    /// `next_retry_at` is unset or due at `now`. Each requeued job goes back
    /// to `Queued` with `retry_count + 1`. The caller must recalculate
    /// positions afterwards.
    async fn requeue_failed(
        &self,
        max_retries: u32,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<RetrySweep>;

    /// Submit a fresh job with the configuration of a failed or cancelled
    /// one, linked through `parent_job_id`. The original is left untouched.
    async fn retry_as_new(&self, id: JobId, owner: Option<OwnerId>) -> Result<Job>;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetrySweep {
    pub requeued: Vec<RequeuedJob>,
}

impl RetrySweep {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requeued.len()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequeuedJob {
    pub job_id: JobId,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// What happens next to a job that just failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryOutlook {
    /// The next sweep (at or after `not_before`) will requeue it.
    Pending {
        attempt: u32,
        max_retries: u32,
        not_before: Option<DateTime<Utc>>,
    },
    /// The budget is spent; the failure is final.
    Exhausted { retry_count: u32, max_retries: u32 },
}

impl RetryOutlook {
    pub fn for_entry(entry: &QueueEntry, max_retries: u32) -> Self {
        let budget = entry.max_retries.min(max_retries);
        if entry.retries_exhausted(max_retries) {
            RetryOutlook::Exhausted {
                retry_count: entry.retry_count,
                max_retries: budget,
            }
        } else {
            RetryOutlook::Pending {
                attempt: entry.retry_count + 1,
                max_retries: budget,
                not_before: entry.next_retry_at,
            }
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryOutlook::Exhausted { .. })
    }
}

/// Eligibility rule shared by every backend.
pub fn is_retry_eligible(
    entry: &QueueEntry,
    max_retries: u32,
    now: DateTime<Utc>,
) -> bool {
    !entry.retries_exhausted(max_retries)
        && entry.next_retry_at.is_none_or(|at| at <= now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobPriority, QueueStatus};
    use chrono::Duration;

    fn entry(retry_count: u32, max_retries: u32) -> QueueEntry {
        QueueEntry {
            job_id: JobId::new(),
            priority: JobPriority::Normal,
            queue_status: QueueStatus::Completed,
            worker_id: None,
            processing_node: None,
            queued_at: Utc::now(),
            processing_started_at: None,
            completed_at: Some(Utc::now()),
            escalated_at: None,
            retry_count,
            max_retries,
            next_retry_at: None,
            queue_position: None,
            is_deleted: false,
        }
    }

    #[test]
    fn test_eligibility_uses_tighter_budget() {
        let now = Utc::now();
        assert!(is_retry_eligible(&entry(0, 3), 3, now));
        assert!(is_retry_eligible(&entry(2, 3), 3, now));
        assert!(!is_retry_eligible(&entry(3, 3), 3, now));
        assert!(!is_retry_eligible(&entry(1, 5), 1, now));
        assert!(!is_retry_eligible(&entry(1, 1), 5, now));
    }

    #[test]
    fn test_next_retry_at_gates_eligibility() {
        let now = Utc::now();
        let mut pending = entry(0, 3);
        pending.next_retry_at = Some(now + Duration::minutes(1));
        assert!(!is_retry_eligible(&pending, 3, now));
        pending.next_retry_at = Some(now);
        assert!(is_retry_eligible(&pending, 3, now));
    }

    #[test]
    fn test_outlook() {
        assert_eq!(
            RetryOutlook::for_entry(&entry(1, 3), 3),
            RetryOutlook::Pending {
                attempt: 2,
                max_retries: 3,
                not_before: None
            }
        );
        assert!(RetryOutlook::for_entry(&entry(3, 3), 3).is_exhausted());
    }
}
