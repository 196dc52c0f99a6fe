use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::{
    BatchId, Job, JobId, JobPriority, JobStatus, JobType, NewJob, OwnerId,
    QueueEntry, StatusUpdate,
};

/// Persistence for jobs and their queue membership.
///
/// Every mutation stamps `updated_at`. Writes are last-writer-wins: there is
/// no version column, so two concurrent progress reports may overwrite each
/// other.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job in `Queued` together with its queue entry, atomically.
    async fn create(&self, job: NewJob) -> Result<Job>;

    /// Fetch a live job. With `owner` set, jobs of other owners are reported
    /// as not found.
    async fn get(&self, id: JobId, owner: Option<OwnerId>) -> Result<Job>;

    /// Apply a state-machine transition (or a progress report while
    /// processing) and the matching queue-entry bookkeeping.
    async fn update_status(&self, id: JobId, update: StatusUpdate) -> Result<Job>;

    /// Mark the job and its queue entry deleted. Rows are never removed.
    async fn soft_delete(&self, id: JobId) -> Result<()>;

    async fn queue_entry(&self, id: JobId) -> Result<QueueEntry>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;
}

/// Dynamic job query. Unset fields do not constrain the result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobFilter {
    pub owner_id: Option<OwnerId>,
    pub statuses: Vec<JobStatus>,
    pub job_type: Option<JobType>,
    pub priority: Option<JobPriority>,
    pub batch_id: Option<BatchId>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub include_deleted: bool,
    pub limit: i64,
    pub offset: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            owner_id: None,
            statuses: Vec::new(),
            job_type: None,
            priority: None,
            batch_id: None,
            created_after: None,
            created_before: None,
            include_deleted: false,
            limit: 50,
            offset: 0,
        }
    }
}

impl JobFilter {
    pub const MAX_LIMIT: i64 = 500;

    pub fn for_owner(owner_id: OwnerId) -> Self {
        Self {
            owner_id: Some(owner_id),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn in_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn page(mut self, limit: i64, offset: i64) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Page size clamped to `1..=MAX_LIMIT`.
    pub fn effective_limit(&self) -> i64 {
        self.limit.clamp(1, Self::MAX_LIMIT)
    }

    pub fn effective_offset(&self) -> i64 {
        self.offset.max(0)
    }

    /// In-process evaluation, matching the SQL built for the relational
    /// backend.
    pub fn matches(&self, job: &Job) -> bool {
        (self.include_deleted || !job.is_deleted)
            && self.owner_id.is_none_or(|owner| job.owner_id == owner)
            && (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.job_type.is_none_or(|t| job.job_type == t)
            && self.priority.is_none_or(|p| job.priority == p)
            && self.batch_id.is_none_or(|b| job.batch_id == Some(b))
            && self.created_after.is_none_or(|t| job.created_at >= t)
            && self.created_before.is_none_or(|t| job.created_at < t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_is_clamped() {
        assert_eq!(JobFilter::default().page(0, -3).effective_limit(), 1);
        assert_eq!(JobFilter::default().page(0, -3).effective_offset(), 0);
        assert_eq!(
            JobFilter::default().page(10_000, 0).effective_limit(),
            JobFilter::MAX_LIMIT
        );
    }
}
