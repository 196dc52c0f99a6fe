//! Prometheus metrics for the job queue.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `spool_jobs_submitted_total` - Jobs accepted into the queue
//! - `spool_jobs_finished_total` - Jobs that reached a terminal status
//! - `spool_jobs_requeued_total` - Failed jobs moved back by the retry sweep
//! - `spool_jobs_escalated_total` - Priority bumps applied to waiting jobs
//! - `spool_jobs_retained_total` - Jobs soft-deleted by retention
//! - `spool_position_rebuild_failures_total` - Queue position rebuilds that
//!   failed after a committed mutation
//!
//! ## Gauges
//! - `spool_queue_depth` - Entries per priority and queue status
//!
//! ## Histograms
//! - `spool_job_duration_seconds` - Time from dequeue to terminal status
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, CounterVec, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts,
    Registry,
};
use std::sync::LazyLock;

/// Registry holding every spool collector.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `job_type`, `priority`.
pub static JOBS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("spool_jobs_submitted_total", "Jobs accepted into the queue");
    CounterVec::new(opts, &["job_type", "priority"])
        .expect("spool_jobs_submitted_total metric creation failed")
});

/// Labels: `job_type`, `status` (completed, failed, cancelled).
pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "spool_jobs_finished_total",
        "Jobs that reached a terminal status",
    );
    CounterVec::new(opts, &["job_type", "status"])
        .expect("spool_jobs_finished_total metric creation failed")
});

pub static JOBS_REQUEUED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "spool_jobs_requeued_total",
        "Failed jobs moved back into the queue",
    )
    .expect("spool_jobs_requeued_total metric creation failed")
});

/// Labels: `to` (priority after the bump).
pub static JOBS_ESCALATED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "spool_jobs_escalated_total",
        "Priority bumps applied to waiting jobs",
    );
    CounterVec::new(opts, &["to"]).expect("spool_jobs_escalated_total metric creation failed")
});

/// Labels: `status`.
pub static JOBS_RETAINED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "spool_jobs_retained_total",
        "Jobs soft-deleted by retention",
    );
    CounterVec::new(opts, &["status"]).expect("spool_jobs_retained_total metric creation failed")
});

pub static POSITION_REBUILD_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "spool_position_rebuild_failures_total",
        "Queue position rebuilds that failed after a committed mutation",
    )
    .expect("spool_position_rebuild_failures_total metric creation failed")
});

/// Labels: `priority`, `queue_status`.
pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("spool_queue_depth", "Queue entries per priority and status");
    GaugeVec::new(opts, &["priority", "queue_status"])
        .expect("spool_queue_depth metric creation failed")
});

/// Labels: `job_type`, `status`.
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    // 1s .. ~9h
    let buckets = exponential_buckets(1.0, 2.0, 16).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "spool_job_duration_seconds",
        "Time from dequeue to terminal status",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["job_type", "status"])
        .expect("spool_job_duration_seconds metric creation failed")
});

/// Register every collector with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(JOBS_REQUEUED_TOTAL.clone()),
        Box::new(JOBS_ESCALATED_TOTAL.clone()),
        Box::new(JOBS_RETAINED_TOTAL.clone()),
        Box::new(POSITION_REBUILD_FAILURES_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_position_rebuild_failed() {
    POSITION_REBUILD_FAILURES_TOTAL.inc();
}

pub fn record_job_submitted(job_type: &str, priority: &str) {
    JOBS_SUBMITTED_TOTAL
        .with_label_values(&[job_type, priority])
        .inc();
}

pub fn record_job_finished(job_type: &str, status: &str) {
    JOBS_FINISHED_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
}

pub fn record_jobs_requeued(count: u64) {
    JOBS_REQUEUED_TOTAL.inc_by(count);
}

pub fn record_job_escalated(to: &str) {
    JOBS_ESCALATED_TOTAL.with_label_values(&[to]).inc();
}

pub fn record_jobs_retained(status: &str, count: u64) {
    JOBS_RETAINED_TOTAL
        .with_label_values(&[status])
        .inc_by(count as f64);
}

pub fn set_queue_depth(priority: &str, queue_status: &str, depth: f64) {
    QUEUE_DEPTH
        .with_label_values(&[priority, queue_status])
        .set(depth);
}

pub fn observe_job_duration(job_type: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[job_type, status])
        .observe(duration_secs);
}

/// Every registered metric in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
