use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;
use crate::payload::JobConfiguration;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a single generation job.
    JobId
);
uuid_id!(
    /// Identifier shared by every job submitted in one batch.
    BatchId
);
uuid_id!(
    /// Identifier of the account that owns a job.
    OwnerId
);

/// Scheduling priority of a job.
///
/// Ordering follows urgency, so `Urgent > High > Normal > Low`.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl JobPriority {
    pub const ALL: [JobPriority; 4] = [
        JobPriority::Urgent,
        JobPriority::High,
        JobPriority::Normal,
        JobPriority::Low,
    ];

    /// Ranking weight persisted on queue entries; larger dequeues first.
    pub fn weight(self) -> i32 {
        match self {
            JobPriority::Low => 1,
            JobPriority::Normal => 10,
            JobPriority::High => 100,
            JobPriority::Urgent => 1000,
        }
    }

    pub fn from_weight(weight: i32) -> Result<Self, QueueError> {
        match weight {
            1 => Ok(JobPriority::Low),
            10 => Ok(JobPriority::Normal),
            100 => Ok(JobPriority::High),
            1000 => Ok(JobPriority::Urgent),
            other => Err(QueueError::persistence(format!(
                "invalid priority weight: {other}"
            ))),
        }
    }

    /// One level up, saturating at `Urgent`.
    pub fn escalated(self) -> Self {
        match self {
            JobPriority::Low => JobPriority::Normal,
            JobPriority::Normal => JobPriority::High,
            JobPriority::High | JobPriority::Urgent => JobPriority::Urgent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Urgent => "urgent",
        }
    }
}

impl Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(JobPriority::Low),
            "normal" => Ok(JobPriority::Normal),
            "high" => Ok(JobPriority::High),
            "urgent" => Ok(JobPriority::Urgent),
            other => Err(QueueError::validation(format!(
                "unknown priority: {other}"
            ))),
        }
    }
}

/// Lifecycle status of a job. See [`crate::lifecycle`] for the legal edges.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses that take the job out of the dequeue-ready set.
    ///
    /// `Failed` counts as terminal for queue membership even though the retry
    /// coordinator may later move it back to `Queued`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(QueueError::validation(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

/// Kind of work a job represents.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    VideoGeneration,
    BatchVideoGeneration,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::VideoGeneration => "video_generation",
            JobType::BatchVideoGeneration => "batch_video_generation",
        }
    }
}

impl Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video_generation" => Ok(JobType::VideoGeneration),
            "batch_video_generation" => Ok(JobType::BatchVideoGeneration),
            other => Err(QueueError::validation(format!(
                "unknown job type: {other}"
            ))),
        }
    }
}

/// Membership state of a queue entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Processing,
    Completed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
        }
    }
}

impl Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(QueueStatus::Queued),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            other => Err(QueueError::persistence(format!(
                "unknown queue status: {other}"
            ))),
        }
    }
}

/// Failure details attached to a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Execution metrics reported by the worker that ran the job.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames_rendered: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_bytes: Option<u64>,
}

/// A generation job as persisted in the `jobs` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_id: OwnerId,
    pub job_type: JobType,
    pub priority: JobPriority,
    pub configuration: JobConfiguration,
    pub status: JobStatus,
    /// Percentage in `0..=100`.
    pub progress: u8,
    pub current_stage: Option<String>,
    pub completed_stages: Vec<String>,
    pub error: Option<ErrorInfo>,
    pub metrics: Option<JobMetrics>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub batch_id: Option<BatchId>,
    pub parent_job_id: Option<JobId>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A job's row in `queue_entries`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    /// Copied from the job at enqueue time; raised by escalation.
    pub priority: JobPriority,
    pub queue_status: QueueStatus,
    pub worker_id: Option<String>,
    pub processing_node: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub queue_position: Option<i32>,
    pub is_deleted: bool,
}

impl QueueEntry {
    /// Whether the retry budget is spent.
    pub fn retries_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= self.max_retries.min(max_retries)
    }
}

/// A job handed to a worker by `dequeue_next`.
#[derive(Clone, Debug)]
pub struct ClaimedJob {
    pub job: Job,
    pub entry: QueueEntry,
}

/// Input to [`crate::store::JobStore::create`].
#[derive(Clone, Debug)]
pub struct NewJob {
    pub id: JobId,
    pub owner_id: OwnerId,
    pub job_type: JobType,
    pub priority: JobPriority,
    pub configuration: JobConfiguration,
    pub max_retries: u32,
    pub batch_id: Option<BatchId>,
    pub parent_job_id: Option<JobId>,
}

impl NewJob {
    pub fn new(
        owner_id: OwnerId,
        priority: JobPriority,
        configuration: JobConfiguration,
        max_retries: u32,
    ) -> Self {
        Self {
            id: JobId::new(),
            owner_id,
            job_type: configuration.job_type(),
            priority,
            configuration,
            max_retries,
            batch_id: None,
            parent_job_id: None,
        }
    }

    pub fn in_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn retry_of(mut self, parent: JobId) -> Self {
        self.parent_job_id = Some(parent);
        self
    }
}

/// Requested change for [`crate::store::JobStore::update_status`].
#[derive(Clone, Debug)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub progress: Option<u8>,
    pub stage: Option<String>,
    pub error: Option<ErrorInfo>,
    pub metrics: Option<JobMetrics>,
    /// Only honoured on a transition into `Failed`.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            progress: None,
            stage: None,
            error: None,
            metrics: None,
            next_retry_at: None,
        }
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    pub fn metrics(mut self, metrics: JobMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if let Some(progress) = self.progress {
            if progress > 100 {
                return Err(QueueError::validation(format!(
                    "progress must be within 0..=100, got {progress}"
                )));
            }
        }
        if let Some(stage) = &self.stage {
            if stage.trim().is_empty() {
                return Err(QueueError::validation("stage must not be blank"));
            }
        }
        Ok(())
    }
}

/// Applies the in-row effects of a status update to a job: timestamps,
/// progress and stage bookkeeping. Shared by every backend so that
/// `started_at`/`completed_at` are stamped once and never overwritten.
pub fn apply_status_update(
    job: &mut Job,
    update: &StatusUpdate,
    now: DateTime<Utc>,
) {
    job.status = update.status;
    job.updated_at = now;

    if update.status == JobStatus::Processing && job.started_at.is_none() {
        job.started_at = Some(now);
    }
    if update.status.is_terminal() && job.completed_at.is_none() {
        job.completed_at = Some(now);
    }

    if let Some(progress) = update.progress {
        job.progress = progress;
    }
    if update.status == JobStatus::Completed {
        job.progress = 100;
    }

    if let Some(stage) = &update.stage {
        if job.current_stage.as_deref() != Some(stage.as_str()) {
            if let Some(previous) = job.current_stage.take() {
                job.completed_stages.push(previous);
            }
            job.current_stage = Some(stage.clone());
        }
    }

    if let Some(error) = &update.error {
        job.error = Some(error.clone());
    }
    if let Some(metrics) = &update.metrics {
        job.metrics = Some(metrics.clone());
    }
}
