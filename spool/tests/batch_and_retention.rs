//! Batch submission with partial success, batch status aggregation and
//! retention runs.

use chrono::{Duration, Utc};
use spool::*;
use spool_testkit::{invalid_request, memory_context, owner, video_request};

async fn finished_job<B: QueueBackend>(context: &QueueContext<B>, owner: OwnerId) -> Job {
    let job = context.submit(owner, video_request(JobPriority::Normal)).await.unwrap();
    let claimed = context.dequeue("worker-1", None).await.unwrap().unwrap();
    assert_eq!(claimed.job.id, job.id);
    context.complete(job.id, None).await.unwrap()
}

#[tokio::test]
async fn test_batch_partial_success_reports_failed_indices() {
    let (context, backend, events) = memory_context(QueueConfig::default());
    let owner = owner();
    let request = BatchJobRequest::new(vec![
        video_request(JobPriority::Normal),
        invalid_request(),
        video_request(JobPriority::High),
    ]);

    let response = context.submit_batch(owner, request).await.unwrap();
    assert_eq!(response.total_jobs, 3);
    assert_eq!(response.created_count(), 2);
    assert!(response.is_partial());
    assert_eq!(response.failed_jobs.len(), 1);
    assert_eq!(response.failed_jobs[0].index, 1);
    assert_eq!(backend.job_count(), 2);

    for id in &response.job_ids {
        let job = context.get_job(*id, Some(owner)).await.unwrap();
        assert_eq!(job.batch_id, Some(response.batch_id));
    }

    let metadata = context.get_batch(response.batch_id, Some(owner)).await.unwrap();
    assert_eq!(metadata.total_count, 3);
    assert_eq!(metadata.created_count, 2);
    assert_eq!(metadata.failed_count, 1);
    assert_eq!(metadata.job_ids, response.job_ids);

    let submitted: Vec<JobEvent> = events
        .events()
        .into_iter()
        .filter(|e| matches!(e.payload, JobEventPayload::Submitted { .. }))
        .collect();
    assert_eq!(submitted.len(), 2);
    assert!(submitted
        .iter()
        .all(|e| e.meta.correlation_id == response.batch_id.as_uuid()));
}

#[tokio::test]
async fn test_batch_priority_overrides_member_priority() {
    let (context, _backend, _events) = memory_context(QueueConfig::default());
    let owner = owner();
    let request = BatchJobRequest::new(vec![
        video_request(JobPriority::Low),
        video_request(JobPriority::Normal),
    ])
    .with_priority(JobPriority::Urgent);

    let response = context.submit_batch(owner, request).await.unwrap();
    for id in &response.job_ids {
        assert_eq!(
            context.get_job(*id, None).await.unwrap().priority,
            JobPriority::Urgent
        );
    }
    let metadata = context.get_batch(response.batch_id, None).await.unwrap();
    assert_eq!(metadata.priority, JobPriority::Urgent);
}

#[tokio::test]
async fn test_oversized_batch_is_rejected_whole() {
    let config = QueueConfig {
        max_batch_size: 2,
        ..QueueConfig::default()
    };
    let (context, backend, _events) = memory_context(config);
    let request = BatchJobRequest::new(vec![video_request(JobPriority::Normal); 3]);

    let err = context.submit_batch(owner(), request).await.unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));
    assert_eq!(backend.job_count(), 0);

    let err = context
        .submit_batch(owner(), BatchJobRequest::new(Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));
}

#[tokio::test]
async fn test_batch_status_follows_members() {
    let (context, _backend, _events) = memory_context(QueueConfig::default());
    let owner = owner();
    let response = context
        .submit_batch(
            owner,
            BatchJobRequest::new(vec![
                video_request(JobPriority::High),
                video_request(JobPriority::Normal),
            ]),
        )
        .await
        .unwrap();
    let (first, second) = (response.job_ids[0], response.job_ids[1]);

    let status = context.batch_status(response.batch_id, Some(owner)).await.unwrap();
    assert_eq!(status.aggregate_status, AggregateStatus::Queued);
    assert_eq!(status.counts.queued, 2);
    assert_eq!(status.total_jobs, 2);

    let claimed = context.dequeue("worker-1", None).await.unwrap().unwrap();
    assert_eq!(claimed.job.id, first);
    let status = context.batch_status(response.batch_id, None).await.unwrap();
    assert_eq!(status.aggregate_status, AggregateStatus::Processing);

    context.complete(first, None).await.unwrap();
    let status = context.batch_status(response.batch_id, None).await.unwrap();
    assert_eq!(status.aggregate_status, AggregateStatus::Queued);
    assert_eq!(status.jobs[0].job_id, first);
    assert_eq!(status.jobs[0].progress, 100);

    let cancellation = context.cancel_batch(response.batch_id, Some(owner)).await.unwrap();
    assert_eq!(cancellation.cancelled, vec![second]);
    assert_eq!(cancellation.failed.len(), 1);
    assert_eq!(cancellation.failed[0].job_id, first);
    assert!(!cancellation.is_complete());

    let status = context.batch_status(response.batch_id, None).await.unwrap();
    assert_eq!(status.aggregate_status, AggregateStatus::Mixed);
    assert_eq!(status.counts.completed, 1);
    assert_eq!(status.counts.cancelled, 1);
}

#[tokio::test]
async fn test_batch_is_owner_scoped() {
    let (context, _backend, _events) = memory_context(QueueConfig::default());
    let owner = owner();
    let response = context
        .submit_batch(owner, BatchJobRequest::new(vec![video_request(JobPriority::Normal)]))
        .await
        .unwrap();

    let stranger = spool_testkit::owner();
    assert!(context.get_batch(response.batch_id, Some(stranger)).await.unwrap_err().is_not_found());
    assert!(context.batch_status(response.batch_id, Some(stranger)).await.unwrap_err().is_not_found());
    assert!(context.cancel_batch(response.batch_id, Some(stranger)).await.unwrap_err().is_not_found());
    assert!(context.get_batch(BatchId::new(), None).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_retention_preview_matches_apply() {
    let (context, backend, events) = memory_context(QueueConfig::default());
    let owner = owner();
    let now = Utc::now();

    let old_completed = finished_job(&context, owner).await;
    backend.backdate_completion(old_completed.id, now - Duration::days(40));
    let recent_completed = finished_job(&context, owner).await;
    backend.backdate_completion(recent_completed.id, now - Duration::days(5));

    let old_failed = context.submit(owner, video_request(JobPriority::Normal)).await.unwrap();
    context.dequeue("worker-1", None).await.unwrap();
    context
        .fail(old_failed.id, ErrorInfo::new("render_failed", "boom"), None)
        .await
        .unwrap();
    backend.backdate_completion(old_failed.id, now - Duration::days(40));

    let old_cancelled = context.submit(owner, video_request(JobPriority::Normal)).await.unwrap();
    context.cancel(old_cancelled.id, Some(owner)).await.unwrap();
    backend.backdate_completion(old_cancelled.id, now - Duration::days(10));

    let batch = context
        .submit_batch(owner, BatchJobRequest::new(vec![video_request(JobPriority::Low)]))
        .await
        .unwrap();
    backend.backdate_batch(batch.batch_id, now - Duration::days(40));

    let policy = RetentionPolicy::default();
    let preview = context.preview_retention(&policy).await.unwrap();
    assert!(preview.dry_run);
    assert_eq!(preview.completed_jobs, 1);
    assert_eq!(preview.failed_jobs, 0);
    assert_eq!(preview.cancelled_jobs, 1);
    assert_eq!(preview.batches, 1);
    assert_eq!(preview.affected_owners, 1);

    // preview leaves everything in place
    assert!(context.get_job(old_completed.id, None).await.is_ok());

    let applied = context.apply_retention(&policy).await.unwrap();
    assert!(!applied.dry_run);
    assert!(applied.same_selection(&preview));

    let row = backend.job_row(old_completed.id).unwrap();
    assert!(row.is_deleted);
    assert!(row.deleted_at.is_some());
    assert!(context.get_job(old_completed.id, None).await.unwrap_err().is_not_found());
    assert!(context.get_job(old_cancelled.id, None).await.unwrap_err().is_not_found());
    assert!(context.get_job(recent_completed.id, None).await.is_ok());
    assert!(context.get_job(old_failed.id, None).await.is_ok());
    assert!(context.get_batch(batch.batch_id, None).await.unwrap_err().is_not_found());
    // members of a retained batch are governed by their own status
    assert!(context.get_job(batch.job_ids[0], None).await.is_ok());

    assert_eq!(
        events.count(|p| matches!(p, JobEventPayload::SoftDeleted { .. })),
        2
    );
    assert_eq!(context.preview_retention(&policy).await.unwrap().total_jobs(), 0);
}

#[tokio::test]
async fn test_retention_respects_limit_oldest_first() {
    let (context, backend, _events) = memory_context(QueueConfig::default());
    let owner = owner();
    let now = Utc::now();

    let oldest = finished_job(&context, owner).await;
    backend.backdate_completion(oldest.id, now - Duration::days(50));
    let older = finished_job(&context, owner).await;
    backend.backdate_completion(older.id, now - Duration::days(45));

    let policy = RetentionPolicy {
        limit: 1,
        ..RetentionPolicy::default()
    };
    let report = context.apply_retention(&policy).await.unwrap();
    assert_eq!(report.completed_jobs, 1);
    assert!(backend.job_row(oldest.id).unwrap().is_deleted);
    assert!(!backend.job_row(older.id).unwrap().is_deleted);
}

#[tokio::test]
async fn test_invalid_retention_policy_is_rejected() {
    let (context, _backend, _events) = memory_context(QueueConfig::default());
    let policy = RetentionPolicy {
        completed_days: -1,
        ..RetentionPolicy::default()
    };
    assert!(matches!(
        context.preview_retention(&policy).await.unwrap_err(),
        QueueError::Validation(_)
    ));
    assert!(matches!(
        context.apply_retention(&policy).await.unwrap_err(),
        QueueError::Validation(_)
    ));
}
