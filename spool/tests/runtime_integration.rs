//! Worker pool, housekeeper and shutdown against the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use spool::*;
use spool_testkit::{memory_context, owner, video_request, ScriptedHandler};
use tokio::time::{sleep, timeout, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_workers() -> WorkerConfig {
    WorkerConfig::new("test")
        .with_poll_interval(10)
        .with_max_poll_attempts(5)
        .with_backoff(50)
}

async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(Instant::now() < deadline, "condition not reached within 5 seconds");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_drain_the_queue() {
    init_tracing();
    let (context, _backend, _events) = memory_context(QueueConfig::default());
    let owner = owner();
    let mut ids = Vec::new();
    for _ in 0..12 {
        ids.push(context.submit(owner, video_request(JobPriority::Normal)).await.unwrap().id);
    }

    let handler = Arc::new(ScriptedHandler::new());
    let runtime = QueueRuntime::new(context.clone()).with_worker_config(fast_workers());
    runtime.spawn_workers(Arc::clone(&handler), 3).await;

    wait_for(|| {
        let context = context.clone();
        async move {
            context
                .snapshot()
                .await
                .map(|s| s.queued_total() == 0 && s.processing_total() == 0)
                .unwrap_or(false)
        }
    })
    .await;
    timeout(Duration::from_secs(5), runtime.shutdown())
        .await
        .unwrap()
        .unwrap();

    handler.assert_dispatch_count_eq(12);
    for id in ids {
        let job = context.get_job(id, None).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_stages, Vec::<String>::new());
        assert_eq!(job.current_stage.as_deref(), Some("rendering"));
    }
    assert!(handler
        .record()
        .iter()
        .all(|r| r.worker_id.as_deref().is_some_and(|w| w.starts_with("test-w"))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_housekeeper_retries_failed_jobs() {
    init_tracing();
    let config = QueueConfig {
        housekeeper_interval_ms: 20,
        ..QueueConfig::default()
    };
    let (context, _backend, events) = memory_context(config);
    let job = context.submit(owner(), video_request(JobPriority::High)).await.unwrap();

    let handler = Arc::new(ScriptedHandler::new());
    handler.push_outcome(HandlerOutcome::failed("render_failed", "encoder crashed"));

    let runtime = QueueRuntime::new(context.clone()).with_worker_config(fast_workers());
    runtime.spawn_workers(Arc::clone(&handler), 1).await;
    runtime.spawn_housekeeper().await;

    wait_for(|| {
        let context = context.clone();
        async move {
            matches!(
                context.get_job(job.id, None).await,
                Ok(job) if job.status == JobStatus::Completed
            )
        }
    })
    .await;
    runtime.shutdown().await.unwrap();

    handler.assert_dispatch_count_eq(2);
    assert_eq!(
        events.count(|p| matches!(p, JobEventPayload::Requeued { retry_count: 1, .. })),
        1
    );
    assert_eq!(
        context.backend().queue_entry(job.id).await.unwrap().retry_count,
        1
    );
}

/// Reports progress until the job is cancelled under it.
struct UntilCancelled;

#[async_trait]
impl JobHandler for UntilCancelled {
    async fn handle(&self, _job: &ClaimedJob, progress: &dyn ProgressReporter) -> HandlerOutcome {
        for step in 0..=100u8 {
            if progress.report(step.min(99), None).await.is_err() {
                return HandlerOutcome::Cancelled;
            }
            sleep(Duration::from_millis(10)).await;
        }
        HandlerOutcome::completed()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_running_job_observes_cancellation() {
    init_tracing();
    let (context, _backend, _events) = memory_context(QueueConfig::default());
    let job = context.submit(owner(), video_request(JobPriority::Normal)).await.unwrap();

    let runtime = QueueRuntime::new(context.clone()).with_worker_config(fast_workers());
    runtime.spawn_workers(Arc::new(UntilCancelled), 1).await;

    wait_for(|| {
        let context = context.clone();
        async move {
            matches!(
                context.get_job(job.id, None).await,
                Ok(job) if job.status == JobStatus::Processing && job.progress > 0
            )
        }
    })
    .await;
    context.cancel(job.id, None).await.unwrap();
    runtime.shutdown().await.unwrap();

    let job = context.get_job(job.id, None).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.progress < 100);
}

#[tokio::test]
async fn test_shutdown_without_tasks_returns() {
    let (context, _backend, _events) = memory_context(QueueConfig::default());
    let runtime = QueueRuntime::new(context);
    runtime.shutdown().await.unwrap();
    assert!(runtime.shutdown_token().is_cancelled());
}

#[tokio::test]
async fn test_idle_workers_stop_promptly_on_shutdown() {
    let (context, _backend, _events) = memory_context(QueueConfig::default());
    let runtime = QueueRuntime::new(context).with_worker_config(
        WorkerConfig::new("idle").with_poll_interval(60_000).with_backoff(60_000),
    );
    runtime.spawn_workers(Arc::new(ScriptedHandler::new()), 2).await;
    sleep(Duration::from_millis(20)).await;

    timeout(Duration::from_secs(2), runtime.shutdown())
        .await
        .expect("idle workers should wake on shutdown")
        .unwrap();
}
