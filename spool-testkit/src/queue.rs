use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use spool::*;

/// In-memory backend with the same semantics as the PostgreSQL one.
///
/// A single mutex plays the role of the row locks: every operation runs
/// under it, so `dequeue_next` can never hand the same entry out twice.
/// Insert timestamps are strictly increasing, like `clock_timestamp()`.
#[derive(Clone)]
pub struct InMemoryQueue {
    state: Arc<Mutex<State>>,
    config: QueueConfig,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    entries: HashMap<JobId, QueueEntry>,
    batches: HashMap<BatchId, BatchMetadata>,
    last_stamp: Option<DateTime<Utc>>,
    fail_rebuilds: bool,
}

impl State {
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    fn live_job(&self, id: JobId, owner: Option<OwnerId>) -> Result<&Job> {
        self.jobs
            .get(&id)
            .filter(|job| !job.is_deleted)
            .filter(|job| owner.is_none_or(|owner| job.owner_id == owner))
            .ok_or_else(|| QueueError::job_not_found(id))
    }

    fn insert(&mut self, new_job: &NewJob) -> Result<Job> {
        new_job.configuration.validate()?;
        if new_job.max_retries > MAX_RETRIES_CAP {
            return Err(QueueError::validation(format!(
                "max_retries must be at most {MAX_RETRIES_CAP}, got {}",
                new_job.max_retries
            )));
        }
        if self.jobs.contains_key(&new_job.id) {
            return Err(QueueError::persistence(format!(
                "duplicate job id {}",
                new_job.id
            )));
        }

        let now = self.stamp();
        let job = Job {
            id: new_job.id,
            owner_id: new_job.owner_id,
            job_type: new_job.job_type,
            priority: new_job.priority,
            configuration: new_job.configuration.clone(),
            status: JobStatus::Queued,
            progress: 0,
            current_stage: None,
            completed_stages: Vec::new(),
            error: None,
            metrics: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            batch_id: new_job.batch_id,
            parent_job_id: new_job.parent_job_id,
            is_deleted: false,
            deleted_at: None,
        };
        let entry = QueueEntry {
            job_id: new_job.id,
            priority: new_job.priority,
            queue_status: QueueStatus::Queued,
            worker_id: None,
            processing_node: None,
            queued_at: now,
            processing_started_at: None,
            completed_at: None,
            escalated_at: None,
            retry_count: 0,
            max_retries: new_job.max_retries,
            next_retry_at: None,
            queue_position: None,
            is_deleted: false,
        };
        self.jobs.insert(job.id, job.clone());
        self.entries.insert(entry.job_id, entry);
        Ok(job)
    }

    fn update_status(&mut self, id: JobId, update: &StatusUpdate) -> Result<Job> {
        update.validate()?;
        let now = self.stamp();
        let job = self
            .jobs
            .get_mut(&id)
            .filter(|job| !job.is_deleted)
            .ok_or_else(|| QueueError::job_not_found(id))?;
        check_status_update(id, job.status, update.status)?;
        let previous = job.status;
        apply_status_update(job, update, now);
        let job = job.clone();

        if previous != update.status {
            if let Some(entry) = self.entries.get_mut(&id) {
                match update.status {
                    JobStatus::Processing => {
                        entry.queue_status = QueueStatus::Processing;
                        if entry.processing_started_at.is_none() {
                            entry.processing_started_at = Some(now);
                        }
                        entry.queue_position = None;
                    }
                    JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                        entry.queue_status = QueueStatus::Completed;
                        if entry.completed_at.is_none() {
                            entry.completed_at = Some(now);
                        }
                        entry.queue_position = None;
                        entry.next_retry_at = match update.status {
                            JobStatus::Failed => update.next_retry_at,
                            _ => None,
                        };
                    }
                    JobStatus::Queued => {}
                }
            }
        }
        Ok(job)
    }

    fn live_batch(&self, batch_id: BatchId, owner: Option<OwnerId>) -> Result<&BatchMetadata> {
        self.batches
            .get(&batch_id)
            .filter(|batch| !batch.is_deleted)
            .filter(|batch| owner.is_none_or(|owner| batch.owner_id == owner))
            .ok_or_else(|| QueueError::batch_not_found(batch_id))
    }

    fn select_expired(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> (Vec<RetentionCandidate>, Vec<BatchRetentionCandidate>) {
        let limit = usize::try_from(policy.limit).unwrap_or(0);
        let mut jobs = Vec::new();
        for status in RETAINED_STATUSES {
            let mut expired: Vec<&Job> = self
                .jobs
                .values()
                .filter(|job| job.status == status && policy.is_expired(job, now))
                .collect();
            expired.sort_by_key(|job| (job.completed_at, job.id));
            jobs.extend(expired.into_iter().take(limit).map(|job| RetentionCandidate {
                job_id: job.id,
                owner_id: job.owner_id,
                status,
            }));
        }

        let cutoff = policy.batch_cutoff(now);
        let mut batches: Vec<&BatchMetadata> = self
            .batches
            .values()
            .filter(|batch| !batch.is_deleted && batch.created_at < cutoff)
            .collect();
        batches.sort_by_key(|batch| (batch.created_at, batch.batch_id));
        let batches = batches
            .into_iter()
            .take(limit)
            .map(|batch| BatchRetentionCandidate {
                batch_id: batch.batch_id,
                owner_id: batch.owner_id,
            })
            .collect();

        (jobs, batches)
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Raw job row, including soft-deleted ones.
    pub fn job_row(&self, id: JobId) -> Option<Job> {
        self.state.lock().jobs.get(&id).cloned()
    }

    /// Raw queue entry, including soft-deleted ones.
    pub fn entry_row(&self, id: JobId) -> Option<QueueEntry> {
        self.state.lock().entries.get(&id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// `(job, position)` of every queued entry, in position order.
    pub fn positions(&self) -> Vec<(JobId, Option<i32>)> {
        let state = self.state.lock();
        let mut positions: Vec<(JobId, Option<i32>)> = state
            .entries
            .values()
            .filter(|entry| entry.queue_status == QueueStatus::Queued && !entry.is_deleted)
            .map(|entry| (entry.job_id, entry.queue_position))
            .collect();
        positions.sort_by_key(|(id, position)| (*position, *id));
        positions
    }

    /// Make every position rebuild fail with a persistence error until
    /// switched off again.
    pub fn fail_position_rebuilds(&self, fail: bool) {
        self.state.lock().fail_rebuilds = fail;
    }

    /// Move a job's completion into the past.
    pub fn backdate_completion(&self, id: JobId, completed_at: DateTime<Utc>) {
        let mut state = self.state.lock();
        if let Some(job) = state.jobs.get_mut(&id) {
            job.completed_at = Some(completed_at);
        }
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.completed_at = Some(completed_at);
        }
    }

    /// Move a job's submission (and its entry's enqueue time) into the past.
    pub fn backdate_submission(&self, id: JobId, at: DateTime<Utc>) {
        let mut state = self.state.lock();
        if let Some(job) = state.jobs.get_mut(&id) {
            job.created_at = at;
        }
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.queued_at = at;
        }
    }

    pub fn backdate_batch(&self, batch_id: BatchId, created_at: DateTime<Utc>) {
        if let Some(batch) = self.state.lock().batches.get_mut(&batch_id) {
            batch.created_at = created_at;
        }
    }

    /// Overwrite the run window of a job's last attempt, for processing-time
    /// history.
    pub fn set_run_window(&self, id: JobId, started_at: DateTime<Utc>, completed_at: DateTime<Utc>) {
        let mut state = self.state.lock();
        if let Some(job) = state.jobs.get_mut(&id) {
            job.started_at = Some(started_at);
            job.completed_at = Some(completed_at);
        }
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.processing_started_at = Some(started_at);
            entry.completed_at = Some(completed_at);
        }
    }

    /// Move the first start of a job into the past, as if earlier attempts
    /// had run long before the current one.
    pub fn backdate_first_start(&self, id: JobId, started_at: DateTime<Utc>) {
        if let Some(job) = self.state.lock().jobs.get_mut(&id) {
            job.started_at = Some(started_at);
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryQueue")
            .field("jobs", &state.jobs.len())
            .field("batches", &state.batches.len())
            .finish()
    }
}

#[async_trait]
impl JobStore for InMemoryQueue {
    async fn create(&self, new_job: NewJob) -> Result<Job> {
        self.state.lock().insert(&new_job)
    }

    async fn get(&self, id: JobId, owner: Option<OwnerId>) -> Result<Job> {
        self.state.lock().live_job(id, owner).cloned()
    }

    async fn update_status(&self, id: JobId, update: StatusUpdate) -> Result<Job> {
        self.state.lock().update_status(id, &update)
    }

    async fn soft_delete(&self, id: JobId) -> Result<()> {
        let mut state = self.state.lock();
        let now = state.stamp();
        let job = state
            .jobs
            .get_mut(&id)
            .filter(|job| !job.is_deleted)
            .ok_or_else(|| QueueError::job_not_found(id))?;
        job.is_deleted = true;
        job.deleted_at = Some(now);
        job.updated_at = now;
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.is_deleted = true;
            entry.queue_position = None;
        }
        Ok(())
    }

    async fn queue_entry(&self, id: JobId) -> Result<QueueEntry> {
        self.state
            .lock()
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| QueueError::job_not_found(id))
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let state = self.state.lock();
        let mut jobs: Vec<&Job> = state.jobs.values().filter(|job| filter.matches(job)).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(jobs
            .into_iter()
            .skip(filter.effective_offset() as usize)
            .take(filter.effective_limit() as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PriorityScheduler for InMemoryQueue {
    async fn recalculate_positions(&self) -> Result<u64> {
        let mut state = self.state.lock();
        if state.fail_rebuilds {
            return Err(QueueError::persistence("position rebuild unavailable"));
        }
        let candidates: Vec<RankCandidate> = state
            .entries
            .values()
            .filter(|entry| entry.queue_status == QueueStatus::Queued && !entry.is_deleted)
            .map(|entry| RankCandidate {
                job_id: entry.job_id,
                priority: entry.priority,
                queued_at: entry.queued_at,
            })
            .collect();
        let ranked = rank_queued(candidates);

        for entry in state.entries.values_mut() {
            entry.queue_position = None;
        }
        for (job_id, position) in &ranked {
            if let Some(entry) = state.entries.get_mut(job_id) {
                entry.queue_position = Some(*position);
            }
        }
        Ok(ranked.len() as u64)
    }

    async fn dequeue_next(
        &self,
        worker_id: &str,
        processing_node: Option<&str>,
    ) -> Result<Option<ClaimedJob>> {
        let mut state = self.state.lock();
        let next = state
            .entries
            .values()
            .filter(|entry| entry.queue_status == QueueStatus::Queued && !entry.is_deleted)
            .map(|entry| RankCandidate {
                job_id: entry.job_id,
                priority: entry.priority,
                queued_at: entry.queued_at,
            })
            .min_by(RankCandidate::queue_order);
        let Some(next) = next else {
            return Ok(None);
        };

        let now = state.stamp();
        let job = state
            .jobs
            .get_mut(&next.job_id)
            .filter(|job| job.status == JobStatus::Queued)
            .ok_or_else(|| {
                QueueError::persistence(format!(
                    "queue entry {} is queued but its job is not",
                    next.job_id
                ))
            })?;
        job.status = JobStatus::Processing;
        if job.started_at.is_none() {
            job.started_at = Some(now);
        }
        job.updated_at = now;
        let job = job.clone();

        let entry = state
            .entries
            .get_mut(&next.job_id)
            .ok_or_else(|| QueueError::job_not_found(next.job_id))?;
        entry.queue_status = QueueStatus::Processing;
        entry.worker_id = Some(worker_id.to_string());
        entry.processing_node = processing_node.map(str::to_string);
        entry.processing_started_at = Some(now);
        entry.queue_position = None;
        let entry = entry.clone();

        Ok(Some(ClaimedJob { job, entry }))
    }

    async fn queue_position(&self, id: JobId) -> Result<Option<i32>> {
        self.state
            .lock()
            .entries
            .get(&id)
            .filter(|entry| !entry.is_deleted)
            .map(|entry| entry.queue_position)
            .ok_or_else(|| QueueError::job_not_found(id))
    }

    async fn snapshot(&self) -> Result<QueueSnapshot> {
        let state = self.state.lock();
        let mut snapshot = QueueSnapshot::new(Utc::now());
        for entry in state.entries.values().filter(|entry| !entry.is_deleted) {
            match entry.queue_status {
                QueueStatus::Queued => snapshot.entry_mut(entry.priority).queued_count += 1,
                QueueStatus::Processing => {
                    snapshot.entry_mut(entry.priority).processing_count += 1
                }
                QueueStatus::Completed => {}
            }
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl LifecycleManager for InMemoryQueue {
    async fn escalate_stale(
        &self,
        policy: &EscalationPolicy,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Escalation>> {
        let mut state = self.state.lock();
        let mut due: Vec<(DateTime<Utc>, JobId)> = state
            .entries
            .values()
            .filter(|entry| entry.queue_status == QueueStatus::Queued && !entry.is_deleted)
            .filter(|entry| policy.is_due(entry.priority, entry.queued_at, entry.escalated_at, now))
            .map(|entry| (entry.queued_at, entry.job_id))
            .collect();
        due.sort();
        due.truncate(usize::try_from(limit).unwrap_or(0));

        let stamp = state.stamp();
        let mut escalations = Vec::with_capacity(due.len());
        for (_, job_id) in due {
            let Some(entry) = state.entries.get_mut(&job_id) else {
                continue;
            };
            let from = entry.priority;
            let to = from.escalated();
            entry.priority = to;
            entry.escalated_at = Some(now);
            if let Some(job) = state.jobs.get_mut(&job_id) {
                job.priority = to;
                job.updated_at = stamp;
            }
            escalations.push(Escalation { job_id, from, to });
        }
        Ok(escalations)
    }

    async fn overdue(
        &self,
        policy: &TimeoutPolicy,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OverdueJob>> {
        let state = self.state.lock();
        let scan_cutoff = policy.scan_cutoff(now);
        let mut overdue: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| !job.is_deleted && job.created_at < scan_cutoff)
            .filter(|job| policy.is_overdue(job, now))
            .collect();
        overdue.sort_by_key(|job| (job.created_at, job.id));
        Ok(overdue
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|job| OverdueJob::from_job(job, policy, now))
            .collect())
    }
}

#[async_trait]
impl RetryCoordinator for InMemoryQueue {
    async fn requeue_failed(
        &self,
        max_retries: u32,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<RetrySweep> {
        let mut state = self.state.lock();
        let mut eligible: Vec<(Option<DateTime<Utc>>, JobId)> = state
            .entries
            .values()
            .filter(|entry| !entry.is_deleted && is_retry_eligible(entry, max_retries, now))
            .filter(|entry| {
                state
                    .jobs
                    .get(&entry.job_id)
                    .is_some_and(|job| job.status == JobStatus::Failed && !job.is_deleted)
            })
            .map(|entry| (entry.completed_at, entry.job_id))
            .collect();
        // None sorts first, matching NULLS FIRST
        eligible.sort();
        eligible.truncate(usize::try_from(limit).unwrap_or(0));

        let stamp = state.stamp();
        let mut requeued = Vec::with_capacity(eligible.len());
        for (_, job_id) in eligible {
            let Some(entry) = state.entries.get_mut(&job_id) else {
                continue;
            };
            entry.queue_status = QueueStatus::Queued;
            entry.retry_count += 1;
            entry.worker_id = None;
            entry.processing_node = None;
            entry.processing_started_at = None;
            entry.completed_at = None;
            entry.next_retry_at = None;
            entry.escalated_at = Some(now);
            requeued.push(RequeuedJob {
                job_id,
                retry_count: entry.retry_count,
                max_retries: entry.max_retries,
            });

            if let Some(job) = state.jobs.get_mut(&job_id) {
                job.status = JobStatus::Queued;
                job.progress = 0;
                job.current_stage = None;
                job.error = None;
                job.completed_at = None;
                job.updated_at = stamp;
            }
        }
        Ok(RetrySweep { requeued })
    }

    async fn retry_as_new(&self, id: JobId, owner: Option<OwnerId>) -> Result<Job> {
        let mut state = self.state.lock();
        let original = state.live_job(id, owner)?.clone();
        if !matches!(original.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(QueueError::validation(format!(
                "job {id} is {}; only failed or cancelled jobs can be retried",
                original.status
            )));
        }
        let max_retries = state
            .entries
            .get(&id)
            .map(|entry| entry.max_retries)
            .ok_or_else(|| QueueError::job_not_found(id))?;

        let new_job = NewJob::new(
            original.owner_id,
            original.priority,
            original.configuration,
            max_retries,
        )
        .retry_of(id);
        state.insert(&new_job)
    }
}

#[async_trait]
impl BatchCoordinator for InMemoryQueue {
    async fn create_batch(
        &self,
        owner_id: OwnerId,
        request: BatchJobRequest,
    ) -> Result<BatchJobResponse> {
        request.validate(&self.config)?;
        let batch_id = BatchId::new();
        let priority = request.effective_priority();
        let batch_priority = request.batch_priority;
        let total_jobs = request.jobs.len();

        let mut state = self.state.lock();
        let mut job_ids = Vec::with_capacity(total_jobs);
        let mut failed_jobs = Vec::new();
        for (index, mut member) in request.jobs.into_iter().enumerate() {
            if let Some(priority) = batch_priority {
                member.priority = priority;
            }
            let inserted = member
                .into_new_job(owner_id, &self.config)
                .and_then(|new_job| state.insert(&new_job.in_batch(batch_id)));
            match inserted {
                Ok(job) => job_ids.push(job.id),
                Err(err) => failed_jobs.push(FailedBatchItem {
                    index,
                    error: err.to_string(),
                }),
            }
        }

        let created_at = state.stamp();
        state.batches.insert(
            batch_id,
            BatchMetadata {
                batch_id,
                owner_id,
                total_count: total_jobs as i32,
                created_count: job_ids.len() as i32,
                failed_count: failed_jobs.len() as i32,
                priority,
                created_at,
                job_ids: job_ids.clone(),
                is_deleted: false,
            },
        );

        Ok(BatchJobResponse {
            batch_id,
            job_ids,
            total_jobs,
            failed_jobs,
        })
    }

    async fn get_batch(
        &self,
        batch_id: BatchId,
        owner: Option<OwnerId>,
    ) -> Result<BatchMetadata> {
        self.state.lock().live_batch(batch_id, owner).cloned()
    }

    async fn batch_status(
        &self,
        batch_id: BatchId,
        owner: Option<OwnerId>,
    ) -> Result<BatchStatus> {
        let state = self.state.lock();
        let metadata = state.live_batch(batch_id, owner)?;
        let jobs = metadata
            .job_ids
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|job| !job.is_deleted)
            .map(|job| BatchJobDetail {
                job_id: job.id,
                status: job.status,
                progress: job.progress,
                error: job.error.clone(),
            })
            .collect();
        Ok(BatchStatus::from_members(metadata, jobs))
    }

    async fn cancel_batch(
        &self,
        batch_id: BatchId,
        owner: Option<OwnerId>,
    ) -> Result<BatchCancellation> {
        let mut state = self.state.lock();
        let job_ids = state.live_batch(batch_id, owner)?.job_ids.clone();

        let mut outcome = BatchCancellation::default();
        let cancel = StatusUpdate::new(JobStatus::Cancelled);
        for job_id in job_ids {
            match state.update_status(job_id, &cancel) {
                Ok(_) => outcome.cancelled.push(job_id),
                Err(err) if err.is_recoverable() => outcome.failed.push(CancelFailure {
                    job_id,
                    error: err.to_string(),
                }),
                Err(err) => return Err(err),
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl RetentionManager for InMemoryQueue {
    async fn preview_retention(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport> {
        policy.validate()?;
        let (jobs, batches) = self.state.lock().select_expired(policy, now);
        Ok(RetentionReport::from_selection(&jobs, &batches, true))
    }

    async fn apply_retention(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport> {
        policy.validate()?;
        let mut state = self.state.lock();
        let (jobs, batches) = state.select_expired(policy, now);

        let deleted_at = state.stamp();
        let job_ids: HashSet<JobId> = jobs.iter().map(|c| c.job_id).collect();
        for job_id in &job_ids {
            if let Some(job) = state.jobs.get_mut(job_id) {
                job.is_deleted = true;
                job.deleted_at = Some(deleted_at);
                job.updated_at = deleted_at;
            }
            if let Some(entry) = state.entries.get_mut(job_id) {
                entry.is_deleted = true;
                entry.queue_position = None;
            }
        }
        for candidate in &batches {
            if let Some(batch) = state.batches.get_mut(&candidate.batch_id) {
                batch.is_deleted = true;
            }
        }

        Ok(RetentionReport::from_selection(&jobs, &batches, false))
    }
}

#[async_trait]
impl WaitTimeEstimator for InMemoryQueue {
    async fn average_processing_time(
        &self,
        priority: JobPriority,
        since: DateTime<Utc>,
    ) -> Result<Option<Duration>> {
        let state = self.state.lock();
        let samples: Vec<i64> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Completed && job.priority == priority)
            .filter_map(|job| {
                let started = state.entries.get(&job.id)?.processing_started_at;
                Some((started, job.completed_at))
            })
            .filter_map(|run| match run {
                (Some(started), Some(completed)) if completed >= since => {
                    Some((completed - started).num_milliseconds())
                }
                _ => None,
            })
            .collect();
        if samples.is_empty() {
            return Ok(None);
        }
        let mean = samples.iter().sum::<i64>() / samples.len() as i64;
        Ok(Some(Duration::milliseconds(mean)))
    }
}
