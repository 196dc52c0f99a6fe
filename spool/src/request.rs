//! Inbound requests and outbound responses exchanged with the host API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::job::{BatchId, JobId, JobPriority, JobStatus, JobType, NewJob, OwnerId};
use crate::payload::JobConfiguration;

/// Upper bound on a caller-supplied retry budget.
pub const MAX_RETRIES_CAP: u32 = 10;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_type: JobType,
    #[serde(default)]
    pub priority: JobPriority,
    pub configuration: JobConfiguration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl JobRequest {
    pub fn new(priority: JobPriority, configuration: JobConfiguration) -> Self {
        Self {
            job_type: configuration.job_type(),
            priority,
            configuration,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.configuration.job_type() != self.job_type {
            return Err(QueueError::validation(format!(
                "configuration schema {} does not match job type {}",
                self.configuration.schema(),
                self.job_type
            )));
        }
        if let Some(max_retries) = self.max_retries {
            if max_retries > MAX_RETRIES_CAP {
                return Err(QueueError::validation(format!(
                    "max_retries must be at most {MAX_RETRIES_CAP}, got {max_retries}"
                )));
            }
        }
        self.configuration.validate()
    }

    /// Validates and turns the request into a store insert for `owner_id`.
    pub fn into_new_job(
        self,
        owner_id: OwnerId,
        config: &QueueConfig,
    ) -> Result<NewJob, QueueError> {
        self.validate()?;
        let max_retries = self.max_retries.unwrap_or(config.max_retries);
        Ok(NewJob::new(
            owner_id,
            self.priority,
            self.configuration,
            max_retries,
        ))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchJobRequest {
    pub jobs: Vec<JobRequest>,
    /// Applied to every member, overriding the member's own priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_priority: Option<JobPriority>,
}

impl BatchJobRequest {
    pub fn new(jobs: Vec<JobRequest>) -> Self {
        Self {
            jobs,
            batch_priority: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.batch_priority = Some(priority);
        self
    }

    /// Checks the envelope only; members are validated one by one so that a
    /// bad member is reported without rejecting the others.
    pub fn validate(&self, config: &QueueConfig) -> Result<(), QueueError> {
        if self.jobs.is_empty() {
            return Err(QueueError::validation("batch must contain at least one job"));
        }
        if self.jobs.len() > config.max_batch_size {
            return Err(QueueError::validation(format!(
                "batch of {} jobs exceeds the limit of {}",
                self.jobs.len(),
                config.max_batch_size
            )));
        }
        Ok(())
    }

    /// Effective priority of the batch for its metadata row.
    pub fn effective_priority(&self) -> JobPriority {
        self.batch_priority
            .or_else(|| self.jobs.iter().map(|job| job.priority).max())
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub queue_position: Option<i32>,
    pub estimated_wait_seconds: Option<i64>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// One member of a batch that could not be created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailedBatchItem {
    /// Position of the member in the submitted list.
    pub index: usize,
    pub error: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchJobResponse {
    pub batch_id: BatchId,
    pub job_ids: Vec<JobId>,
    pub total_jobs: usize,
    pub failed_jobs: Vec<FailedBatchItem>,
}

impl BatchJobResponse {
    pub fn created_count(&self) -> usize {
        self.job_ids.len()
    }

    pub fn is_partial(&self) -> bool {
        !self.failed_jobs.is_empty()
    }
}
