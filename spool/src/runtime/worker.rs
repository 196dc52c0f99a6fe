use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{QueueError, Result};
use crate::job::{ClaimedJob, ErrorInfo, JobId, JobMetrics, JobStatus};
use crate::telemetry;

use super::context::{QueueBackend, QueueContext};
use super::supervisor::ShutdownToken;

/// Configuration for individual workers in the runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identifier recorded on claimed queue entries. Pools append `-w{n}`.
    pub worker_id: String,
    /// Host or pod name recorded on claimed queue entries.
    pub processing_node: Option<String>,
    /// Delay between empty polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Empty polls before switching to the backoff delay.
    pub max_poll_attempts: u32,
    /// Delay once the queue has stayed empty, and after a store error, in
    /// milliseconds.
    pub backoff_ms: u64,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }

    pub fn with_processing_node(mut self, node: impl Into<String>) -> Self {
        self.processing_node = Some(node.into());
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_max_poll_attempts(mut self, attempts: u32) -> Self {
        self.max_poll_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, ms: u64) -> Self {
        self.backoff_ms = ms;
        self
    }

    /// Sleep after `empty_polls` consecutive empty dequeues.
    pub fn idle_delay(&self, empty_polls: u32) -> Duration {
        if empty_polls >= self.max_poll_attempts {
            self.backoff()
        } else {
            Duration::from_millis(self.poll_interval_ms)
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("spool-{}", std::process::id()),
            processing_node: None,
            poll_interval_ms: 250,
            max_poll_attempts: 20,
            backoff_ms: 2_000,
        }
    }
}

/// What a handler reports back for a claimed job.
#[derive(Clone, Debug)]
pub enum HandlerOutcome {
    Completed { metrics: Option<JobMetrics> },
    Failed {
        error: ErrorInfo,
        /// Earliest time the retry sweep may requeue the job.
        retry_at: Option<DateTime<Utc>>,
    },
    /// The handler observed a cancellation and stopped. Nothing is recorded.
    Cancelled,
}

impl HandlerOutcome {
    pub fn completed() -> Self {
        HandlerOutcome::Completed { metrics: None }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerOutcome::Failed {
            error: ErrorInfo::new(code, message),
            retry_at: None,
        }
    }
}

/// Progress channel handed to a running handler.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Errs with [`QueueError::InvalidTransition`] once the job has been
    /// cancelled.
    async fn report(&self, progress: u8, stage: Option<&str>) -> Result<()>;

    async fn is_cancelled(&self) -> bool;
}

/// The work itself. Cancellation is cooperative: a handler is never
/// interrupted and should check its reporter between steps.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &ClaimedJob, progress: &dyn ProgressReporter) -> HandlerOutcome;
}

struct JobProgress<B: QueueBackend> {
    context: QueueContext<B>,
    job_id: JobId,
}

#[async_trait]
impl<B: QueueBackend> ProgressReporter for JobProgress<B> {
    async fn report(&self, progress: u8, stage: Option<&str>) -> Result<()> {
        self.context
            .report_progress(self.job_id, progress, stage.map(str::to_string))
            .await
            .map(|_| ())
    }

    async fn is_cancelled(&self) -> bool {
        matches!(
            self.context.get_job(self.job_id, None).await,
            Ok(job) if job.status == JobStatus::Cancelled
        )
    }
}

pub(crate) async fn run_worker<B, H>(
    context: QueueContext<B>,
    handler: Arc<H>,
    config: WorkerConfig,
    shutdown: ShutdownToken,
) where
    B: QueueBackend,
    H: JobHandler + ?Sized,
{
    let mut empty_polls: u32 = 0;
    loop {
        if shutdown.is_cancelled() {
            info!(worker_id = %config.worker_id, "worker shutting down");
            break;
        }

        match context
            .dequeue(&config.worker_id, config.processing_node.as_deref())
            .await
        {
            Ok(Some(claimed)) => {
                empty_polls = 0;
                execute(&context, handler.as_ref(), claimed).await;
            }
            Ok(None) => {
                empty_polls = empty_polls.saturating_add(1);
                idle(&shutdown, config.idle_delay(empty_polls)).await;
            }
            Err(err) => {
                warn!(worker_id = %config.worker_id, error = %err, "dequeue failed");
                idle(&shutdown, config.backoff()).await;
            }
        }
    }
}

async fn idle(shutdown: &ShutdownToken, delay: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

async fn execute<B, H>(context: &QueueContext<B>, handler: &H, claimed: ClaimedJob)
where
    B: QueueBackend,
    H: JobHandler + ?Sized,
{
    let job_id = claimed.job.id;
    let reporter = JobProgress {
        context: context.clone(),
        job_id,
    };
    let outcome = telemetry::instrument_dispatch(
        job_id.to_string(),
        claimed.job.job_type,
        claimed.job.priority,
        handler.handle(&claimed, &reporter),
    )
    .await;

    let recorded = match outcome {
        HandlerOutcome::Completed { metrics } => {
            context.complete(job_id, metrics).await.map(|_| ())
        }
        HandlerOutcome::Failed { error, retry_at } => {
            context.fail(job_id, error, retry_at).await.map(|_| ())
        }
        HandlerOutcome::Cancelled => {
            debug!(%job_id, "handler stopped on cancellation");
            Ok(())
        }
    };

    match recorded {
        Ok(()) => {}
        Err(QueueError::InvalidTransition { from, to, .. }) => {
            info!(%job_id, %from, %to, "job changed state while running; outcome dropped");
        }
        Err(err) => error!(%job_id, error = %err, "recording job outcome failed"),
    }
}
