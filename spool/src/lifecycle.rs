//! Job lifecycle state machine, timeout deadlines and priority escalation.
//!
//! ```text
//! QUEUED ──> PROCESSING ──> COMPLETED
//!   │            │
//!   │            ├────────> FAILED ──(retry coordinator)──> QUEUED
//!   │            │
//!   └────────────┴────────> CANCELLED
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::job::{Job, JobId, JobPriority, JobStatus, JobType};

impl JobStatus {
    /// Whether the state machine has an edge `self -> to`.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Failed, Queued)
        )
    }

    /// `Completed` and `Cancelled` have no outgoing edges.
    pub fn is_final(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }
}

pub fn validate_transition(
    job_id: JobId,
    from: JobStatus,
    to: JobStatus,
) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(QueueError::InvalidTransition { job_id, from, to })
    }
}

/// Gate for `JobStore::update_status`.
///
/// A same-status update is a progress report and is only meaningful while
/// processing. The `Failed -> Queued` edge belongs to the retry coordinator,
/// which also maintains the retry budget, so it is refused here.
pub fn check_status_update(
    job_id: JobId,
    from: JobStatus,
    to: JobStatus,
) -> Result<()> {
    if from == JobStatus::Processing && to == JobStatus::Processing {
        return Ok(());
    }
    if to == JobStatus::Queued && from.can_transition_to(to) {
        return Err(QueueError::validation(format!(
            "job {job_id} can only be requeued by the retry coordinator"
        )));
    }
    validate_transition(job_id, from, to)
}

/// Longest processing window accepted by [`TimeoutPolicy::validate`].
pub const MAX_TIMEOUT_MINUTES: i64 = 30 * 24 * 60;

/// Longest escalation threshold accepted by [`EscalationPolicy::validate`].
pub const MAX_ESCALATION_THRESHOLD_SECONDS: i64 = 30 * 24 * 60 * 60;

/// Per-priority processing windows, in minutes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityTimeouts {
    pub low_minutes: i64,
    pub normal_minutes: i64,
    pub high_minutes: i64,
    pub urgent_minutes: i64,
}

impl PriorityTimeouts {
    pub fn for_priority(&self, priority: JobPriority) -> Duration {
        let minutes = match priority {
            JobPriority::Low => self.low_minutes,
            JobPriority::Normal => self.normal_minutes,
            JobPriority::High => self.high_minutes,
            JobPriority::Urgent => self.urgent_minutes,
        };
        Duration::try_minutes(minutes).unwrap_or(Duration::MAX)
    }

    fn shortest(&self) -> Duration {
        let minutes = self
            .low_minutes
            .min(self.normal_minutes)
            .min(self.high_minutes)
            .min(self.urgent_minutes);
        Duration::try_minutes(minutes).unwrap_or(Duration::MAX)
    }

    fn validate(&self, job_type: JobType) -> Result<()> {
        let windows = [
            self.low_minutes,
            self.normal_minutes,
            self.high_minutes,
            self.urgent_minutes,
        ];
        if windows
            .iter()
            .any(|minutes| !(1..=MAX_TIMEOUT_MINUTES).contains(minutes))
        {
            return Err(QueueError::validation(format!(
                "{job_type} timeouts must be between 1 and {MAX_TIMEOUT_MINUTES} minutes"
            )));
        }
        Ok(())
    }
}

/// Deadline table: `deadline = created_at + timeout(job_type, priority)`.
///
/// The deadline is computed and reported; nothing in this crate moves an
/// overrunning job to `Failed`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub video_generation: PriorityTimeouts,
    pub batch_video_generation: PriorityTimeouts,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            video_generation: PriorityTimeouts {
                low_minutes: 6 * 60,
                normal_minutes: 4 * 60,
                high_minutes: 2 * 60,
                urgent_minutes: 60,
            },
            batch_video_generation: PriorityTimeouts {
                low_minutes: 12 * 60,
                normal_minutes: 8 * 60,
                high_minutes: 4 * 60,
                urgent_minutes: 2 * 60,
            },
        }
    }
}

impl TimeoutPolicy {
    pub fn timeout(&self, job_type: JobType, priority: JobPriority) -> Duration {
        match job_type {
            JobType::VideoGeneration => self.video_generation.for_priority(priority),
            JobType::BatchVideoGeneration => {
                self.batch_video_generation.for_priority(priority)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.video_generation.validate(JobType::VideoGeneration)?;
        self.batch_video_generation
            .validate(JobType::BatchVideoGeneration)
    }

    pub fn deadline(&self, job: &Job) -> DateTime<Utc> {
        job.created_at
            .checked_add_signed(self.timeout(job.job_type, job.priority))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_overdue(&self, job: &Job, now: DateTime<Utc>) -> bool {
        job.status == JobStatus::Processing && self.deadline(job) < now
    }

    pub fn shortest_timeout(&self) -> Duration {
        self.video_generation
            .shortest()
            .min(self.batch_video_generation.shortest())
    }

    /// Jobs created at or after this instant cannot be overdue at `now`;
    /// overdue scans skip them.
    pub fn scan_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.shortest_timeout())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Starvation guard: a queued entry waiting longer than the threshold moves
/// up one priority level.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub threshold_seconds: i64,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            threshold_seconds: 2 * 60 * 60,
        }
    }
}

impl EscalationPolicy {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_ESCALATION_THRESHOLD_SECONDS).contains(&self.threshold_seconds) {
            return Err(QueueError::validation(format!(
                "escalation threshold must be between 1 and {MAX_ESCALATION_THRESHOLD_SECONDS} seconds"
            )));
        }
        Ok(())
    }

    pub fn threshold(&self) -> Duration {
        Duration::try_seconds(self.threshold_seconds).unwrap_or(Duration::MAX)
    }

    /// Entries whose last escalation (or enqueue, or requeue) is before this
    /// instant are due for another level.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.threshold())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn is_due(
        &self,
        priority: JobPriority,
        queued_at: DateTime<Utc>,
        escalated_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        priority != JobPriority::Urgent
            && escalated_at.unwrap_or(queued_at) < self.cutoff(now)
    }
}

/// One priority bump applied by an escalation sweep.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub job_id: JobId,
    pub from: JobPriority,
    pub to: JobPriority,
}

/// A processing job past its deadline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OverdueJob {
    pub job_id: JobId,
    pub job_type: JobType,
    pub priority: JobPriority,
    pub deadline: DateTime<Utc>,
    pub overdue_by_seconds: i64,
}

impl OverdueJob {
    pub fn from_job(job: &Job, policy: &TimeoutPolicy, now: DateTime<Utc>) -> Self {
        let deadline = policy.deadline(job);
        Self {
            job_id: job.id,
            job_type: job.job_type,
            priority: job.priority,
            deadline,
            overdue_by_seconds: (now - deadline).num_seconds().max(0),
        }
    }
}

/// Store-backed lifecycle sweeps.
#[async_trait]
pub trait LifecycleManager: Send + Sync {
    /// Raise the priority of up to `limit` queued entries that are due under
    /// `policy`. The caller must recalculate positions afterwards.
    async fn escalate_stale(
        &self,
        policy: &EscalationPolicy,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Escalation>>;

    /// Report up to `limit` processing jobs whose deadline has passed,
    /// oldest first. Read-only.
    async fn overdue(
        &self,
        policy: &TimeoutPolicy,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OverdueJob>>;
}
