//! End-to-end checks of the PostgreSQL backend.
//!
//! Requires a running Postgres instance; the schema is applied on connect.
//! Run with: `DATABASE_URL=postgres://... cargo test --test postgres_queue -- --ignored`

#![cfg(feature = "postgres")]

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use spool::*;
use spool_testkit::{invalid_request, owner, video_request, RecordingPublisher};
use tokio::sync::{Mutex, MutexGuard};

// every test owns the whole queue while it runs
static DATABASE: Mutex<()> = Mutex::const_new(());

async fn connect() -> (MutexGuard<'static, ()>, QueueContext<PostgresQueueService>) {
    let guard = DATABASE.lock().await;
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let config = SpoolConfig {
        persistence: PersistenceConfig {
            connection_string: url,
            ..PersistenceConfig::default()
        },
        ..SpoolConfig::default()
    };
    let context = QueueContextBuilder::<PostgresQueueService>::from_config(&config)
        .with_events(Arc::new(RecordingPublisher::new()))
        .connect_postgres()
        .await
        .expect("connect to postgres");

    sqlx::query("TRUNCATE queue_entries, batch_metadata, jobs")
        .execute(context.backend().pool())
        .await
        .expect("truncate queue tables");
    (guard, context)
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_priority_order_and_positions() {
    let (_guard, context) = connect().await;
    let owner = owner();

    let normal = context.submit(owner, video_request(JobPriority::Normal)).await.unwrap();
    let urgent = context.submit(owner, video_request(JobPriority::Urgent)).await.unwrap();
    let high = context.submit(owner, video_request(JobPriority::High)).await.unwrap();

    assert_eq!(context.backend().queue_position(urgent.id).await.unwrap(), Some(1));
    assert_eq!(context.backend().queue_position(high.id).await.unwrap(), Some(2));
    assert_eq!(context.backend().queue_position(normal.id).await.unwrap(), Some(3));
    assert_eq!(context.recalculate_positions().await.unwrap(), 3);
    assert_eq!(context.backend().queue_position(normal.id).await.unwrap(), Some(3));

    let mut order = Vec::new();
    while let Some(claimed) = context.dequeue("pg-worker", None).await.unwrap() {
        assert_eq!(claimed.entry.queue_status, QueueStatus::Processing);
        order.push(claimed.job.id);
    }
    assert_eq!(order, vec![urgent.id, high.id, normal.id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_concurrent_dequeue_is_exclusive() {
    let (_guard, context) = connect().await;
    let owner = owner();
    let mut submitted = HashSet::new();
    for _ in 0..10 {
        submitted.insert(context.submit(owner, video_request(JobPriority::Normal)).await.unwrap().id);
    }

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let context = context.clone();
            tokio::spawn(async move {
                context
                    .dequeue(&format!("pg-worker-{i}"), None)
                    .await
                    .unwrap()
                    .map(|claimed| claimed.job.id)
            })
        })
        .collect();

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(id) = handle.await.unwrap() {
            claimed.push(id);
        }
    }
    let unique: HashSet<JobId> = claimed.iter().copied().collect();
    assert_eq!(unique.len(), claimed.len());
    assert!(unique.is_subset(&submitted));
}

// cancels lock a job and then its entry; dequeue and the sweeps must take
// the same order or Postgres aborts one side with a deadlock
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_cancels_and_dequeues_interleave() {
    let (_guard, context) = connect().await;
    let owner = owner();

    let mut singles = Vec::new();
    for i in 0..60 {
        let priority = if i % 2 == 0 { JobPriority::Normal } else { JobPriority::High };
        singles.push(context.submit(owner, video_request(priority)).await.unwrap().id);
    }
    let batch = context
        .submit_batch(
            owner,
            BatchJobRequest::new((0..40).map(|_| video_request(JobPriority::Low)).collect()),
        )
        .await
        .unwrap();
    let mut every_job = singles.clone();
    every_job.extend(batch.job_ids.iter().copied());

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let context = context.clone();
            tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = context.dequeue(&format!("pg-worker-{i}"), None).await.unwrap() {
                    claimed.push(job.job.id);
                }
                claimed
            })
        })
        .collect();

    let cancellers: Vec<_> = singles
        .chunks(15)
        .map(|chunk| {
            let context = context.clone();
            let chunk = chunk.to_vec();
            tokio::spawn(async move {
                for id in chunk {
                    match context.cancel(id, Some(owner)).await {
                        Ok(_) | Err(QueueError::InvalidTransition { .. }) => {}
                        Err(err) => panic!("cancelling {id} failed: {err}"),
                    }
                }
            })
        })
        .collect();

    let batch_cancel = {
        let context = context.clone();
        let batch_id = batch.batch_id;
        tokio::spawn(async move { context.cancel_batch(batch_id, Some(owner)).await })
    };

    let sweeper = {
        let context = context.clone();
        tokio::spawn(async move {
            for _ in 0..5 {
                context.run_escalation().await.unwrap();
                context.recalculate_positions().await.unwrap();
            }
        })
    };

    let mut claimed = Vec::new();
    for worker in workers {
        claimed.extend(worker.await.unwrap());
    }
    for canceller in cancellers {
        canceller.await.unwrap();
    }
    let cancellation = batch_cancel.await.unwrap().unwrap();
    sweeper.await.unwrap();

    let unique: HashSet<JobId> = claimed.iter().copied().collect();
    assert_eq!(unique.len(), claimed.len());
    assert_eq!(cancellation.cancelled.len() + cancellation.failed.len(), 40);

    // nothing finishes on its own here, so every cancel lands
    for id in every_job {
        let job = context.get_job(id, None).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled, "job {id}");
    }
    let snapshot = context.snapshot().await.unwrap();
    assert!(snapshot.priorities.values().all(|entry| entry.queued_count == 0));
    assert!(!context.positions_stale());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_retry_budget() {
    let (_guard, context) = connect().await;
    let job = context
        .submit(owner(), video_request(JobPriority::Normal).with_max_retries(1))
        .await
        .unwrap();

    context.dequeue("pg-worker", None).await.unwrap().unwrap();
    let outcome = context
        .fail(job.id, ErrorInfo::new("render_failed", "boom"), None)
        .await
        .unwrap();
    assert!(!outcome.outlook.is_exhausted());
    assert_eq!(context.run_retry_sweep().await.unwrap().len(), 1);

    context.dequeue("pg-worker", None).await.unwrap().unwrap();
    let outcome = context
        .fail(job.id, ErrorInfo::new("render_failed", "boom"), None)
        .await
        .unwrap();
    assert!(outcome.outlook.is_exhausted());
    assert!(context.run_retry_sweep().await.unwrap().is_empty());

    let entry = context.backend().queue_entry(job.id).await.unwrap();
    assert_eq!(entry.retry_count, 1);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_batch_partial_success() {
    let (_guard, context) = connect().await;
    let owner = owner();
    let response = context
        .submit_batch(
            owner,
            BatchJobRequest::new(vec![
                video_request(JobPriority::Normal),
                invalid_request(),
                video_request(JobPriority::Normal),
            ]),
        )
        .await
        .unwrap();
    assert_eq!(response.job_ids.len(), 2);
    assert_eq!(response.failed_jobs[0].index, 1);

    let status = context.batch_status(response.batch_id, Some(owner)).await.unwrap();
    assert_eq!(status.aggregate_status, AggregateStatus::Queued);
    assert_eq!(status.jobs.len(), 2);
    assert_eq!(status.total_jobs, 3);

    let cancellation = context.cancel_batch(response.batch_id, Some(owner)).await.unwrap();
    assert!(cancellation.is_complete());
    let status = context.batch_status(response.batch_id, None).await.unwrap();
    assert_eq!(status.aggregate_status, AggregateStatus::Cancelled);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_retention_preview_equals_apply() {
    let (_guard, context) = connect().await;
    let owner = owner();
    let job = context.submit(owner, video_request(JobPriority::Normal)).await.unwrap();
    context.dequeue("pg-worker", None).await.unwrap();
    context.complete(job.id, None).await.unwrap();

    sqlx::query("UPDATE jobs SET completed_at = $2 WHERE id = $1")
        .bind(job.id.as_uuid())
        .bind(Utc::now() - Duration::days(40))
        .execute(context.backend().pool())
        .await
        .unwrap();

    let policy = RetentionPolicy::default();
    let preview = context.preview_retention(&policy).await.unwrap();
    assert_eq!(preview.completed_jobs, 1);
    let applied = context.apply_retention(&policy).await.unwrap();
    assert!(applied.same_selection(&preview));
    assert!(context.get_job(job.id, None).await.unwrap_err().is_not_found());

    let listed = context
        .list_jobs(&JobFilter {
            include_deleted: true,
            ..JobFilter::for_owner(owner)
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].is_deleted);
}
