use std::any::type_name;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{warn, Instrument, Span};

use crate::batch::{BatchCancellation, BatchCoordinator, BatchMetadata, BatchStatus};
use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::estimate::{WaitEstimate, WaitTimeEstimator};
use crate::events::{EventPublisher, JobEvent, JobEventPayload};
use crate::job::{
    BatchId, ClaimedJob, ErrorInfo, Job, JobId, JobMetrics, JobPriority, JobStatus, JobType,
    OwnerId, StatusUpdate,
};
use crate::lifecycle::{Escalation, LifecycleManager, OverdueJob};
use crate::request::{BatchJobRequest, BatchJobResponse, JobRequest, JobResponse};
use crate::retention::{RetentionManager, RetentionPolicy, RetentionReport};
use crate::retry::{RetryCoordinator, RetryOutlook, RetrySweep};
use crate::scheduler::{PriorityScheduler, QueueSnapshot};
use crate::store::{JobFilter, JobStore};
use crate::telemetry;

/// Everything a backend must provide to drive a [`QueueContext`].
pub trait QueueBackend:
    JobStore
    + PriorityScheduler
    + LifecycleManager
    + RetryCoordinator
    + BatchCoordinator
    + RetentionManager
    + WaitTimeEstimator
    + 'static
{
}

impl<T> QueueBackend for T where
    T: JobStore
        + PriorityScheduler
        + LifecycleManager
        + RetryCoordinator
        + BatchCoordinator
        + RetentionManager
        + WaitTimeEstimator
        + 'static
{
}

/// A failure as recorded, together with what the retry coordinator will do
/// about it.
#[derive(Clone, Debug)]
pub struct FailureOutcome {
    pub job: Job,
    pub outlook: RetryOutlook,
}

/// Counts from one housekeeping pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub requeued: usize,
    pub escalated: usize,
    pub overdue: usize,
    /// Entries ranked by the closing position rebuild.
    pub ranked: u64,
}

/// Queue operations for the host application, built once at startup and
/// passed by reference (or cloned) wherever jobs are submitted or processed.
///
/// Every operation that changes the set of queued entries rebuilds queue
/// positions before returning. The mutation is already committed at that
/// point, so a failed rebuild does not fail the operation: it is logged,
/// counted, and reported through [`QueueContext::positions_stale`] and
/// [`QueueSnapshot::positions_stale`] until a later rebuild succeeds.
pub struct QueueContext<B: QueueBackend> {
    backend: Arc<B>,
    events: Arc<dyn EventPublisher>,
    config: QueueConfig,
    retention: RetentionPolicy,
    positions_stale: Arc<AtomicBool>,
}

impl<B: QueueBackend> Clone for QueueContext<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            events: Arc::clone(&self.events),
            config: self.config.clone(),
            retention: self.retention.clone(),
            positions_stale: Arc::clone(&self.positions_stale),
        }
    }
}

impl<B: QueueBackend> fmt::Debug for QueueContext<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueContext")
            .field("backend_type", &type_name::<B>())
            .field("config", &self.config)
            .field("retention", &self.retention)
            .finish()
    }
}

impl<B: QueueBackend> QueueContext<B> {
    pub fn new(
        backend: Arc<B>,
        events: Arc<dyn EventPublisher>,
        config: QueueConfig,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            backend,
            events,
            config,
            retention,
            positions_stale: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    pub fn events(&self) -> Arc<dyn EventPublisher> {
        Arc::clone(&self.events)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Whether the most recent position rebuild failed. Positions and wait
    /// estimates may be out of date while this is set.
    pub fn positions_stale(&self) -> bool {
        self.positions_stale.load(Ordering::Acquire)
    }

    /// Policy applied by the housekeeper.
    pub fn retention_policy(&self) -> &RetentionPolicy {
        &self.retention
    }

    pub async fn submit(&self, owner_id: OwnerId, request: JobRequest) -> Result<Job> {
        self.submit_one(owner_id, request)
            .instrument(telemetry::submit_span(owner_id.to_string(), 1))
            .await
    }

    async fn submit_one(&self, owner_id: OwnerId, request: JobRequest) -> Result<Job> {
        let new_job = request.into_new_job(owner_id, &self.config)?;
        let job = self.backend.create(new_job).await?;
        self.refresh_positions().await;

        telemetry::record_job_submitted(job.id.to_string(), job.job_type, job.priority);
        self.publish(JobEvent::new(
            Some(owner_id),
            JobEventPayload::Submitted {
                job_id: job.id,
                job_type: job.job_type,
                priority: job.priority,
                batch_id: None,
            },
        ))
        .await;
        Ok(job)
    }

    /// Submit a batch with partial success: members that fail are listed in
    /// the response and the rest are queued.
    pub async fn submit_batch(
        &self,
        owner_id: OwnerId,
        request: BatchJobRequest,
    ) -> Result<BatchJobResponse> {
        let span = telemetry::submit_span(owner_id.to_string(), request.jobs.len());
        self.submit_many(owner_id, request).instrument(span).await
    }

    async fn submit_many(
        &self,
        owner_id: OwnerId,
        request: BatchJobRequest,
    ) -> Result<BatchJobResponse> {
        let members: Vec<(JobType, JobPriority)> = request
            .jobs
            .iter()
            .map(|job| (job.job_type, request.batch_priority.unwrap_or(job.priority)))
            .collect();

        let response = self.backend.create_batch(owner_id, request).await?;
        if !response.job_ids.is_empty() {
            self.refresh_positions().await;
        }

        let failed: HashSet<usize> = response.failed_jobs.iter().map(|f| f.index).collect();
        let created = members
            .into_iter()
            .enumerate()
            .filter(|(index, _)| !failed.contains(index))
            .map(|(_, member)| member);
        for (job_id, (job_type, priority)) in response.job_ids.iter().zip(created) {
            telemetry::record_job_submitted(job_id.to_string(), job_type, priority);
            self.publish(JobEvent::correlated(
                Some(owner_id),
                response.batch_id.as_uuid(),
                JobEventPayload::Submitted {
                    job_id: *job_id,
                    job_type,
                    priority,
                    batch_id: Some(response.batch_id),
                },
            ))
            .await;
        }
        Ok(response)
    }

    /// Resubmit a failed or cancelled job as a new job linked to it.
    pub async fn retry_as_new(&self, id: JobId, owner: Option<OwnerId>) -> Result<Job> {
        let job = self.backend.retry_as_new(id, owner).await?;
        self.refresh_positions().await;

        telemetry::record_job_submitted(job.id.to_string(), job.job_type, job.priority);
        self.publish(JobEvent::new(
            Some(job.owner_id),
            JobEventPayload::Submitted {
                job_id: job.id,
                job_type: job.job_type,
                priority: job.priority,
                batch_id: None,
            },
        ))
        .await;
        Ok(job)
    }

    pub async fn get_job(&self, id: JobId, owner: Option<OwnerId>) -> Result<Job> {
        self.backend.get(id, owner).await
    }

    /// Status, queue position and wait estimate of one job.
    pub async fn job_status(&self, id: JobId, owner: Option<OwnerId>) -> Result<JobResponse> {
        let job = self.backend.get(id, owner).await?;
        let estimate = self.estimate_for(&job).await?;
        Ok(JobResponse {
            id: job.id,
            status: job.status,
            progress: job.progress,
            queue_position: estimate.as_ref().map(|e| e.position),
            estimated_wait_seconds: estimate.as_ref().map(|e| e.wait_seconds),
            estimated_completion: estimate.map(|e| e.estimated_completion),
        })
    }

    /// Wait estimate for a queued job; `None` once it left the queue.
    pub async fn estimate_wait(
        &self,
        id: JobId,
        owner: Option<OwnerId>,
    ) -> Result<Option<WaitEstimate>> {
        let job = self.backend.get(id, owner).await?;
        self.estimate_for(&job).await
    }

    async fn estimate_for(&self, job: &Job) -> Result<Option<WaitEstimate>> {
        if job.status != JobStatus::Queued {
            return Ok(None);
        }
        let Some(position) = self.backend.queue_position(job.id).await? else {
            return Ok(None);
        };
        let now = Utc::now();
        let since = now
            .checked_sub_signed(self.config.estimate_window())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let average = self
            .backend
            .average_processing_time(job.priority, since)
            .await?;
        Ok(Some(WaitEstimate::new(
            position,
            average,
            self.config.fallback_processing_time(),
            now,
        )))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.backend.list(filter).await
    }

    pub async fn get_batch(
        &self,
        batch_id: BatchId,
        owner: Option<OwnerId>,
    ) -> Result<BatchMetadata> {
        self.backend.get_batch(batch_id, owner).await
    }

    pub async fn batch_status(
        &self,
        batch_id: BatchId,
        owner: Option<OwnerId>,
    ) -> Result<BatchStatus> {
        self.backend.batch_status(batch_id, owner).await
    }

    /// Per-priority depths, also published to the queue-depth gauge.
    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        let mut snapshot = self.backend.snapshot().await?;
        snapshot.positions_stale = self.positions_stale();
        telemetry::record_queue_snapshot(&snapshot);
        Ok(snapshot)
    }

    /// Claim the next job for `worker_id`. At most one caller ever receives
    /// a given entry.
    pub async fn dequeue(
        &self,
        worker_id: &str,
        processing_node: Option<&str>,
    ) -> Result<Option<ClaimedJob>> {
        self.claim_next(worker_id, processing_node)
            .instrument(telemetry::dequeue_span(worker_id))
            .await
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        processing_node: Option<&str>,
    ) -> Result<Option<ClaimedJob>> {
        let Some(claimed) = self.backend.dequeue_next(worker_id, processing_node).await? else {
            return Ok(None);
        };
        Span::current().record("job_id", tracing::field::display(claimed.job.id));
        self.refresh_positions().await;

        self.publish(JobEvent::new(
            Some(claimed.job.owner_id),
            JobEventPayload::Dequeued {
                job_id: claimed.job.id,
                worker_id: worker_id.to_string(),
                priority: claimed.entry.priority,
            },
        ))
        .await;
        Ok(Some(claimed))
    }

    /// Progress report from the worker running `id`. Fails with an invalid
    /// transition once the job has been cancelled, which is how a worker
    /// observes cancellation.
    pub async fn report_progress(
        &self,
        id: JobId,
        progress: u8,
        stage: Option<String>,
    ) -> Result<Job> {
        let current = self.backend.get(id, None).await?;
        if current.status == JobStatus::Queued {
            return Err(QueueError::validation(format!(
                "job {id} has not been dequeued"
            )));
        }

        let mut update = StatusUpdate::new(JobStatus::Processing).progress(progress);
        if let Some(stage) = stage {
            update = update.stage(stage);
        }
        let job = self.backend.update_status(id, update).await?;

        self.publish(JobEvent::new(
            Some(job.owner_id),
            JobEventPayload::Progressed {
                job_id: id,
                progress: job.progress,
                stage: job.current_stage.clone(),
            },
        ))
        .await;
        Ok(job)
    }

    pub async fn complete(&self, id: JobId, metrics: Option<JobMetrics>) -> Result<Job> {
        let mut update = StatusUpdate::new(JobStatus::Completed);
        if let Some(metrics) = metrics {
            update = update.metrics(metrics);
        }
        let job = self
            .backend
            .update_status(id, update)
            .instrument(telemetry::transition_span(id.to_string(), JobStatus::Completed))
            .await?;

        telemetry::record_job_finished(
            job.id.to_string(),
            job.job_type,
            job.status,
            run_seconds(&job),
        );
        self.publish(JobEvent::new(
            Some(job.owner_id),
            JobEventPayload::Completed {
                job_id: job.id,
                job_type: job.job_type,
            },
        ))
        .await;
        Ok(job)
    }

    /// Record a failure. The job stays `Failed` until a retry sweep requeues
    /// it, which happens only while its retry budget lasts and not before
    /// `retry_at`.
    pub async fn fail(
        &self,
        id: JobId,
        error: ErrorInfo,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<FailureOutcome> {
        let mut update = StatusUpdate::new(JobStatus::Failed).error(error);
        if let Some(at) = retry_at {
            update = update.retry_at(at);
        }
        let job = self
            .backend
            .update_status(id, update)
            .instrument(telemetry::transition_span(id.to_string(), JobStatus::Failed))
            .await?;
        let entry = self.backend.queue_entry(id).await?;
        let outlook = RetryOutlook::for_entry(&entry, self.config.max_retries);

        telemetry::record_job_finished(
            job.id.to_string(),
            job.job_type,
            job.status,
            run_seconds(&job),
        );
        self.publish(JobEvent::new(
            Some(job.owner_id),
            JobEventPayload::Failed {
                job_id: job.id,
                error: job.error.clone(),
                retryable: !outlook.is_exhausted(),
            },
        ))
        .await;
        if let RetryOutlook::Exhausted { retry_count, .. } = outlook {
            self.publish(JobEvent::new(
                Some(job.owner_id),
                JobEventPayload::RetriesExhausted {
                    job_id: job.id,
                    retry_count,
                },
            ))
            .await;
        }
        Ok(FailureOutcome { job, outlook })
    }

    /// Cancel a queued or processing job. A running worker is not
    /// interrupted; it sees the cancellation on its next progress report.
    pub async fn cancel(&self, id: JobId, owner: Option<OwnerId>) -> Result<Job> {
        let current = self.backend.get(id, owner).await?;
        let job = self
            .backend
            .update_status(id, StatusUpdate::new(JobStatus::Cancelled))
            .instrument(telemetry::transition_span(id.to_string(), JobStatus::Cancelled))
            .await?;
        if current.status == JobStatus::Queued {
            self.refresh_positions().await;
        }

        telemetry::record_job_finished(job.id.to_string(), job.job_type, job.status, None);
        self.publish(JobEvent::new(
            Some(job.owner_id),
            JobEventPayload::Cancelled { job_id: job.id },
        ))
        .await;
        Ok(job)
    }

    pub async fn cancel_batch(
        &self,
        batch_id: BatchId,
        owner: Option<OwnerId>,
    ) -> Result<BatchCancellation> {
        let outcome = self.backend.cancel_batch(batch_id, owner).await?;
        if !outcome.cancelled.is_empty() {
            self.refresh_positions().await;
        }
        for job_id in &outcome.cancelled {
            self.publish(JobEvent::correlated(
                owner,
                batch_id.as_uuid(),
                JobEventPayload::Cancelled { job_id: *job_id },
            ))
            .await;
        }
        Ok(outcome)
    }

    /// Full rebuild of queue positions.
    pub async fn recalculate_positions(&self) -> Result<u64> {
        let rebuilt = self
            .backend
            .recalculate_positions()
            .instrument(telemetry::sweep_span("positions"))
            .await;
        self.positions_stale
            .store(rebuilt.is_err(), Ordering::Release);
        rebuilt
    }

    async fn refresh_positions(&self) {
        if let Err(err) = self.recalculate_positions().await {
            telemetry::record_position_rebuild_failed(&err);
        }
    }

    /// Requeue failed jobs that still have retry budget.
    pub async fn run_retry_sweep(&self) -> Result<RetrySweep> {
        self.retry_sweep()
            .instrument(telemetry::sweep_span("retry"))
            .await
    }

    async fn retry_sweep(&self) -> Result<RetrySweep> {
        let sweep = self
            .backend
            .requeue_failed(self.config.max_retries, Utc::now(), self.config.scan_limit)
            .await?;
        if sweep.is_empty() {
            return Ok(sweep);
        }
        self.refresh_positions().await;

        telemetry::record_jobs_requeued(sweep.len());
        for requeued in &sweep.requeued {
            self.publish(JobEvent::new(
                None,
                JobEventPayload::Requeued {
                    job_id: requeued.job_id,
                    retry_count: requeued.retry_count,
                },
            ))
            .await;
        }
        Ok(sweep)
    }

    /// Bump long-waiting queued jobs one priority level.
    pub async fn run_escalation(&self) -> Result<Vec<Escalation>> {
        self.escalation()
            .instrument(telemetry::sweep_span("escalation"))
            .await
    }

    async fn escalation(&self) -> Result<Vec<Escalation>> {
        let escalations = self
            .backend
            .escalate_stale(&self.config.escalation, Utc::now(), self.config.scan_limit)
            .await?;
        if escalations.is_empty() {
            return Ok(escalations);
        }
        self.refresh_positions().await;

        for escalation in &escalations {
            telemetry::record_job_escalated(
                escalation.job_id.to_string(),
                escalation.from,
                escalation.to,
            );
            self.publish(JobEvent::new(
                None,
                JobEventPayload::Escalated {
                    job_id: escalation.job_id,
                    from: escalation.from,
                    to: escalation.to,
                },
            ))
            .await;
        }
        Ok(escalations)
    }

    /// Log processing jobs past their deadline. Nothing is changed.
    pub async fn report_overdue(&self) -> Result<Vec<OverdueJob>> {
        let overdue = self
            .backend
            .overdue(&self.config.timeouts, Utc::now(), self.config.scan_limit)
            .instrument(telemetry::sweep_span("overdue"))
            .await?;
        for job in &overdue {
            telemetry::record_job_overdue(job.job_id.to_string(), job.job_type, job.overdue_by_seconds);
        }
        Ok(overdue)
    }

    pub async fn preview_retention(&self, policy: &RetentionPolicy) -> Result<RetentionReport> {
        self.backend
            .preview_retention(policy, Utc::now())
            .instrument(telemetry::sweep_span("retention"))
            .await
    }

    pub async fn apply_retention(&self, policy: &RetentionPolicy) -> Result<RetentionReport> {
        let report = self
            .backend
            .apply_retention(policy, Utc::now())
            .instrument(telemetry::sweep_span("retention"))
            .await?;

        let per_status = [
            (JobStatus::Completed, report.completed_jobs),
            (JobStatus::Failed, report.failed_jobs),
            (JobStatus::Cancelled, report.cancelled_jobs),
        ];
        for (status, count) in per_status {
            if count == 0 {
                continue;
            }
            telemetry::record_jobs_retained(status, count);
            self.publish(JobEvent::new(
                None,
                JobEventPayload::SoftDeleted { status, count },
            ))
            .await;
        }
        Ok(report)
    }

    /// One housekeeping pass: retry sweep, escalation, overdue report, a
    /// closing position rebuild and a depth snapshot. Retention runs on its
    /// own schedule.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let requeued = self.run_retry_sweep().await?.len();
        let escalated = self.run_escalation().await?.len();
        let overdue = self.report_overdue().await?.len();
        let ranked = self.recalculate_positions().await?;
        self.snapshot().await?;

        Ok(MaintenanceReport {
            requeued,
            escalated,
            overdue,
            ranked,
        })
    }

    async fn publish(&self, event: JobEvent) {
        if let Err(err) = self.events.publish(event).await {
            warn!(error = %err, "job event publish failed");
        }
    }
}

fn run_seconds(job: &Job) -> Option<f64> {
    match (job.started_at, job.completed_at) {
        (Some(started), Some(completed)) => {
            Some((completed - started).num_milliseconds().max(0) as f64 / 1000.0)
        }
        _ => None,
    }
}
