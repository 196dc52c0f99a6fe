//! Soft deletion of aged terminal jobs and batch metadata.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::job::{BatchId, Job, JobId, JobStatus, OwnerId};

/// Longest retention window accepted by [`RetentionPolicy::validate`].
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// Independent day windows per terminal status and for batch metadata.
///
/// The reference timestamp is `completed_at` for jobs and `created_at` for
/// batch metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub completed_days: i64,
    pub failed_days: i64,
    pub cancelled_days: i64,
    pub batch_metadata_days: i64,
    /// Maximum rows selected per category in one run.
    pub limit: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_days: 30,
            failed_days: 90,
            cancelled_days: 7,
            batch_metadata_days: 30,
            limit: 1000,
        }
    }
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<()> {
        let windows = [
            self.completed_days,
            self.failed_days,
            self.cancelled_days,
            self.batch_metadata_days,
        ];
        if windows.iter().any(|days| *days < 0) {
            return Err(QueueError::validation("retention windows must not be negative"));
        }
        if windows.iter().any(|days| *days > MAX_RETENTION_DAYS) {
            return Err(QueueError::validation(format!(
                "retention windows must not exceed {MAX_RETENTION_DAYS} days"
            )));
        }
        if self.limit <= 0 {
            return Err(QueueError::validation("retention limit must be positive"));
        }
        Ok(())
    }

    /// Window for a job status; `None` for statuses that are never retained
    /// away.
    pub fn window(&self, status: JobStatus) -> Option<Duration> {
        match status {
            JobStatus::Completed => Some(days(self.completed_days)),
            JobStatus::Failed => Some(days(self.failed_days)),
            JobStatus::Cancelled => Some(days(self.cancelled_days)),
            JobStatus::Queued | JobStatus::Processing => None,
        }
    }

    pub fn cutoff(&self, status: JobStatus, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.window(status).map(|window| earliest(now, window))
    }

    pub fn batch_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        earliest(now, days(self.batch_metadata_days))
    }

    /// Selection rule for jobs, shared by preview and apply.
    pub fn is_expired(&self, job: &Job, now: DateTime<Utc>) -> bool {
        if job.is_deleted {
            return false;
        }
        match (self.cutoff(job.status, now), job.completed_at) {
            (Some(cutoff), Some(completed_at)) => completed_at < cutoff,
            _ => false,
        }
    }
}

fn days(days: i64) -> Duration {
    Duration::try_days(days).unwrap_or(Duration::MAX)
}

/// `now - window`, clamped to the earliest representable instant.
fn earliest(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Statuses covered by a retention run, in the order they are processed.
pub const RETAINED_STATUSES: [JobStatus; 3] = [
    JobStatus::Completed,
    JobStatus::Failed,
    JobStatus::Cancelled,
];

/// A job picked by the retention selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionCandidate {
    pub job_id: JobId,
    pub owner_id: OwnerId,
    pub status: JobStatus,
}

/// A batch picked by the retention selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRetentionCandidate {
    pub batch_id: BatchId,
    pub owner_id: OwnerId,
}

/// Counts produced by both preview and apply.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub cancelled_jobs: usize,
    pub batches: usize,
    /// Distinct owners of any selected job or batch.
    pub affected_owners: usize,
    pub dry_run: bool,
}

impl RetentionReport {
    pub fn from_selection(
        jobs: &[RetentionCandidate],
        batches: &[BatchRetentionCandidate],
        dry_run: bool,
    ) -> Self {
        let count = |status: JobStatus| jobs.iter().filter(|c| c.status == status).count();
        let owners: HashSet<OwnerId> = jobs
            .iter()
            .map(|c| c.owner_id)
            .chain(batches.iter().map(|b| b.owner_id))
            .collect();
        Self {
            completed_jobs: count(JobStatus::Completed),
            failed_jobs: count(JobStatus::Failed),
            cancelled_jobs: count(JobStatus::Cancelled),
            batches: batches.len(),
            affected_owners: owners.len(),
            dry_run,
        }
    }

    pub fn total_jobs(&self) -> usize {
        self.completed_jobs + self.failed_jobs + self.cancelled_jobs
    }

    /// Same selection, ignoring whether it was a dry run.
    pub fn same_selection(&self, other: &RetentionReport) -> bool {
        self.completed_jobs == other.completed_jobs
            && self.failed_jobs == other.failed_jobs
            && self.cancelled_jobs == other.cancelled_jobs
            && self.batches == other.batches
            && self.affected_owners == other.affected_owners
    }
}

/// Retention runs. Preview and apply go through the same selection, so for
/// identical inputs they select the same rows.
#[async_trait]
pub trait RetentionManager: Send + Sync {
    async fn preview_retention(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport>;

    /// Soft-delete the selected jobs together with their queue entries, and
    /// the selected batch metadata, in one pass.
    async fn apply_retention(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cutoffs() {
        let policy = RetentionPolicy::default();
        let now = Utc::now();
        assert_eq!(
            policy.cutoff(JobStatus::Completed, now),
            Some(now - Duration::days(30))
        );
        assert_eq!(policy.cutoff(JobStatus::Processing, now), None);
        assert_eq!(policy.batch_cutoff(now), now - Duration::days(30));
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetentionPolicy::default().validate().is_ok());
        let negative = RetentionPolicy {
            failed_days: -1,
            ..RetentionPolicy::default()
        };
        assert!(negative.validate().is_err());
        let no_limit = RetentionPolicy {
            limit: 0,
            ..RetentionPolicy::default()
        };
        assert!(no_limit.validate().is_err());
        let at_bound = RetentionPolicy {
            completed_days: MAX_RETENTION_DAYS,
            ..RetentionPolicy::default()
        };
        assert!(at_bound.validate().is_ok());
    }

    #[test]
    fn test_oversized_windows_are_rejected_without_panicking() {
        let policy = RetentionPolicy {
            batch_metadata_days: 200_000_000,
            ..RetentionPolicy::default()
        };
        assert!(matches!(policy.validate(), Err(QueueError::Validation(_))));

        // cut-offs of an unvalidated policy clamp instead of overflowing
        let now = Utc::now();
        assert_eq!(policy.batch_cutoff(now), DateTime::<Utc>::MIN_UTC);
        let huge = RetentionPolicy {
            completed_days: i64::MAX,
            ..RetentionPolicy::default()
        };
        assert_eq!(huge.cutoff(JobStatus::Completed, now), Some(DateTime::<Utc>::MIN_UTC));
    }

    #[test]
    fn test_report_counts_distinct_owners() {
        let owner = OwnerId::new();
        let other = OwnerId::new();
        let jobs = vec![
            RetentionCandidate {
                job_id: JobId::new(),
                owner_id: owner,
                status: JobStatus::Completed,
            },
            RetentionCandidate {
                job_id: JobId::new(),
                owner_id: owner,
                status: JobStatus::Failed,
            },
        ];
        let batches = vec![BatchRetentionCandidate {
            batch_id: BatchId::new(),
            owner_id: other,
        }];
        let report = RetentionReport::from_selection(&jobs, &batches, true);
        assert_eq!(report.completed_jobs, 1);
        assert_eq!(report.failed_jobs, 1);
        assert_eq!(report.total_jobs(), 2);
        assert_eq!(report.batches, 1);
        assert_eq!(report.affected_owners, 2);

        let applied = RetentionReport::from_selection(&jobs, &batches, false);
        assert!(report.same_selection(&applied));
        assert_ne!(report, applied);
    }
}
