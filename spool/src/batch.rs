//! Batch submission and derived batch status.
//!
//! A batch persists only its metadata and the ordered list of member ids.
//! Its status is never stored; it is recomputed from the live members on
//! every read.

use std::collections::HashSet;
use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::{BatchId, ErrorInfo, JobId, JobPriority, JobStatus, OwnerId};
use crate::request::{BatchJobRequest, BatchJobResponse};

#[async_trait]
pub trait BatchCoordinator: Send + Sync {
    /// Create every member that validates and inserts cleanly under one
    /// shared batch id, in a single transaction. Members that fail are
    /// reported in `failed_jobs` instead of aborting the batch. The caller
    /// must recalculate positions afterwards.
    async fn create_batch(
        &self,
        owner_id: OwnerId,
        request: BatchJobRequest,
    ) -> Result<BatchJobResponse>;

    async fn get_batch(
        &self,
        batch_id: BatchId,
        owner: Option<OwnerId>,
    ) -> Result<BatchMetadata>;

    /// Aggregate status recomputed from the members' current statuses.
    async fn batch_status(
        &self,
        batch_id: BatchId,
        owner: Option<OwnerId>,
    ) -> Result<BatchStatus>;

    /// Try to cancel every member independently. Not atomic: a partially
    /// cancelled batch is a valid outcome. The caller must recalculate
    /// positions afterwards.
    async fn cancel_batch(
        &self,
        batch_id: BatchId,
        owner: Option<OwnerId>,
    ) -> Result<BatchCancellation>;
}

/// Persisted batch row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub batch_id: BatchId,
    pub owner_id: OwnerId,
    pub total_count: i32,
    pub created_count: i32,
    pub failed_count: i32,
    pub priority: JobPriority,
    pub created_at: DateTime<Utc>,
    pub job_ids: Vec<JobId>,
    pub is_deleted: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Mixed,
}

impl AggregateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateStatus::Queued => "queued",
            AggregateStatus::Processing => "processing",
            AggregateStatus::Completed => "completed",
            AggregateStatus::Failed => "failed",
            AggregateStatus::Cancelled => "cancelled",
            AggregateStatus::Mixed => "mixed",
        }
    }
}

impl Display for AggregateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive a batch's status from its members.
///
/// Uniform terminal outcomes win; two or more distinct terminal outcomes are
/// `Mixed`; otherwise any processing member makes the batch `Processing`,
/// then any queued member makes it `Queued`. An empty member set is `Mixed`.
pub fn aggregate_status(statuses: &[JobStatus]) -> AggregateStatus {
    if statuses.is_empty() {
        return AggregateStatus::Mixed;
    }
    let all = |target: JobStatus| statuses.iter().all(|s| *s == target);
    if all(JobStatus::Completed) {
        return AggregateStatus::Completed;
    }
    if all(JobStatus::Failed) {
        return AggregateStatus::Failed;
    }
    if all(JobStatus::Cancelled) {
        return AggregateStatus::Cancelled;
    }

    let terminal: HashSet<JobStatus> = statuses
        .iter()
        .copied()
        .filter(JobStatus::is_terminal)
        .collect();
    if terminal.len() > 1 {
        return AggregateStatus::Mixed;
    }
    if statuses.contains(&JobStatus::Processing) {
        return AggregateStatus::Processing;
    }
    if statuses.contains(&JobStatus::Queued) {
        return AggregateStatus::Queued;
    }
    AggregateStatus::Mixed
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchJobDetail {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub error: Option<ErrorInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn tally(statuses: &[JobStatus]) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            match status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchStatus {
    pub batch_id: BatchId,
    pub aggregate_status: AggregateStatus,
    pub total_jobs: i32,
    pub counts: StatusCounts,
    /// In the batch's submission order. Members that were soft-deleted are
    /// omitted.
    pub jobs: Vec<BatchJobDetail>,
}

impl BatchStatus {
    pub fn from_members(metadata: &BatchMetadata, jobs: Vec<BatchJobDetail>) -> Self {
        let statuses: Vec<JobStatus> = jobs.iter().map(|job| job.status).collect();
        Self {
            batch_id: metadata.batch_id,
            aggregate_status: aggregate_status(&statuses),
            total_jobs: metadata.total_count,
            counts: StatusCounts::tally(&statuses),
            jobs,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelFailure {
    pub job_id: JobId,
    pub error: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BatchCancellation {
    pub cancelled: Vec<JobId>,
    pub failed: Vec<CancelFailure>,
}

impl BatchCancellation {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}
