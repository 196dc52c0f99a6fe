//! Tracing spans and event recording for the queue.
//!
//! Every `record_*` helper logs through `tracing` and, with the `metrics`
//! feature, also updates the matching Prometheus collector. Without the
//! feature they only log.

use std::future::Future;
use tracing::{info_span, Instrument, Span};

use crate::error::QueueError;
use crate::job::{JobPriority, JobStatus, JobType};
use crate::scheduler::QueueSnapshot;

/// Span around a single or batch submission.
#[must_use]
pub fn submit_span(owner_id: impl AsRef<str>, job_count: usize) -> Span {
    info_span!(
        "spool.submit",
        owner_id = %owner_id.as_ref(),
        job_count = job_count,
    )
}

/// Span around one dequeue attempt by a worker.
#[must_use]
pub fn dequeue_span(worker_id: impl AsRef<str>) -> Span {
    info_span!(
        "spool.dequeue",
        worker_id = %worker_id.as_ref(),
        job_id = tracing::field::Empty,
    )
}

/// Span around handler execution for a claimed job.
#[must_use]
pub fn dispatch_span(job_id: impl AsRef<str>, job_type: JobType, priority: JobPriority) -> Span {
    info_span!(
        "spool.dispatch",
        job_id = %job_id.as_ref(),
        job_type = %job_type,
        priority = %priority,
    )
}

/// Span around a status transition.
#[must_use]
pub fn transition_span(job_id: impl AsRef<str>, to: JobStatus) -> Span {
    info_span!(
        "spool.transition",
        job_id = %job_id.as_ref(),
        to = %to,
    )
}

/// Span around a housekeeping sweep (`retry`, `escalation`, `overdue`,
/// `retention`, `positions`).
#[must_use]
pub fn sweep_span(kind: &'static str) -> Span {
    info_span!("spool.sweep", kind = kind)
}

/// Attach a dispatch span to a handler future.
pub fn instrument_dispatch<F>(
    job_id: impl AsRef<str>,
    job_type: JobType,
    priority: JobPriority,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(dispatch_span(job_id, job_type, priority))
}

pub fn record_job_submitted(job_id: impl AsRef<str>, job_type: JobType, priority: JobPriority) {
    tracing::info!(
        job_id = %job_id.as_ref(),
        job_type = %job_type,
        priority = %priority,
        "job submitted"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_submitted(job_type.as_str(), priority.as_str());
}

/// Log a job reaching a terminal status and, when both timestamps are known,
/// observe how long it ran.
pub fn record_job_finished(
    job_id: impl AsRef<str>,
    job_type: JobType,
    status: JobStatus,
    duration_secs: Option<f64>,
) {
    match status {
        JobStatus::Failed => tracing::warn!(
            job_id = %job_id.as_ref(),
            job_type = %job_type,
            duration_secs = ?duration_secs,
            "job failed"
        ),
        _ => tracing::info!(
            job_id = %job_id.as_ref(),
            job_type = %job_type,
            status = %status,
            duration_secs = ?duration_secs,
            "job finished"
        ),
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(job_type.as_str(), status.as_str());
    #[cfg(feature = "metrics")]
    if let Some(secs) = duration_secs {
        crate::metrics::observe_job_duration(job_type.as_str(), status.as_str(), secs);
    };
}

pub fn record_jobs_requeued(count: usize) {
    if count == 0 {
        return;
    }
    tracing::info!(count = count, "failed jobs requeued");

    #[cfg(feature = "metrics")]
    crate::metrics::record_jobs_requeued(count as u64);
}

pub fn record_job_escalated(job_id: impl AsRef<str>, from: JobPriority, to: JobPriority) {
    tracing::info!(
        job_id = %job_id.as_ref(),
        from = %from,
        to = %to,
        "job priority escalated"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_escalated(to.as_str());
}

pub fn record_job_overdue(job_id: impl AsRef<str>, job_type: JobType, overdue_by_seconds: i64) {
    tracing::warn!(
        job_id = %job_id.as_ref(),
        job_type = %job_type,
        overdue_by_seconds = overdue_by_seconds,
        "job past its processing deadline"
    );
}

pub fn record_jobs_retained(status: JobStatus, count: usize) {
    if count == 0 {
        return;
    }
    tracing::info!(status = %status, count = count, "jobs soft-deleted by retention");

    #[cfg(feature = "metrics")]
    crate::metrics::record_jobs_retained(status.as_str(), count as u64);
}

/// A rebuild after a committed mutation failed; positions stay stale until
/// the next successful one.
pub fn record_position_rebuild_failed(error: &QueueError) {
    tracing::warn!(error = %error, "queue position rebuild failed; positions are stale");

    #[cfg(feature = "metrics")]
    crate::metrics::record_position_rebuild_failed();
}

/// Publish per-priority depths from a snapshot.
pub fn record_queue_snapshot(snapshot: &QueueSnapshot) {
    tracing::debug!(
        queued = snapshot.queued_total(),
        processing = snapshot.processing_total(),
        "queue depth updated"
    );

    #[cfg(feature = "metrics")]
    publish_depths(snapshot);
}

#[cfg(feature = "metrics")]
fn publish_depths(snapshot: &QueueSnapshot) {
    for (priority, entry) in &snapshot.priorities {
        crate::metrics::set_queue_depth(priority, "queued", entry.queued_count as f64);
        crate::metrics::set_queue_depth(priority, "processing", entry.processing_count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        assert_eq!(submit_span("owner-1", 3).metadata().unwrap().name(), "spool.submit");
        assert_eq!(dequeue_span("worker-1").metadata().unwrap().name(), "spool.dequeue");
        let span = dispatch_span("job-1", JobType::VideoGeneration, JobPriority::High);
        assert_eq!(span.metadata().unwrap().name(), "spool.dispatch");
        let span = transition_span("job-1", JobStatus::Completed);
        assert_eq!(span.metadata().unwrap().name(), "spool.transition");
        assert_eq!(sweep_span("retry").metadata().unwrap().name(), "spool.sweep");
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_job_submitted("job-1", JobType::VideoGeneration, JobPriority::Low);
        record_job_finished("job-1", JobType::VideoGeneration, JobStatus::Completed, Some(3.5));
        record_job_finished("job-2", JobType::VideoGeneration, JobStatus::Failed, None);
        record_jobs_requeued(0);
        record_jobs_requeued(2);
        record_job_escalated("job-3", JobPriority::Low, JobPriority::Normal);
        record_job_overdue("job-4", JobType::BatchVideoGeneration, 90);
        record_jobs_retained(JobStatus::Cancelled, 5);
        record_queue_snapshot(&QueueSnapshot::new(chrono::Utc::now()));
    }
}
