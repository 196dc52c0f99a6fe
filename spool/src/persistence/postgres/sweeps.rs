use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{insert_job, job_from_row, lock_queue_sweeps, PostgresQueueService, JOB_COLUMNS};
use crate::error::{QueueError, Result};
use crate::job::{Job, JobId, JobPriority, JobStatus, JobType, NewJob, OwnerId};
use crate::lifecycle::{Escalation, EscalationPolicy, LifecycleManager, OverdueJob, TimeoutPolicy};
use crate::retry::{RequeuedJob, RetryCoordinator, RetrySweep};
use crate::store::JobStore;

#[async_trait]
impl RetryCoordinator for PostgresQueueService {
    async fn requeue_failed(
        &self,
        max_retries: u32,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<RetrySweep> {
        let mut tx = self.pool.begin().await?;
        lock_queue_sweeps(&mut tx).await?;

        // the CTE locks the jobs rows before the outer update touches entries;
        // escalated_at restarts the escalation clock, queued_at keeps seniority
        let rows = sqlx::query(
            r#"
            WITH eligible AS (
                SELECT q.job_id
                FROM queue_entries q
                JOIN jobs j ON j.id = q.job_id
                WHERE j.status = 'failed'
                  AND NOT j.is_deleted
                  AND NOT q.is_deleted
                  AND q.retry_count < LEAST($1, q.max_retries)
                  AND (q.next_retry_at IS NULL OR q.next_retry_at <= $2)
                ORDER BY q.completed_at ASC NULLS FIRST, q.job_id ASC
                LIMIT $3
                FOR UPDATE OF j SKIP LOCKED
            )
            UPDATE queue_entries q
            SET queue_status = 'queued',
                retry_count = q.retry_count + 1,
                worker_id = NULL,
                processing_node = NULL,
                processing_started_at = NULL,
                completed_at = NULL,
                next_retry_at = NULL,
                escalated_at = $2
            FROM eligible
            WHERE q.job_id = eligible.job_id
            RETURNING q.job_id, q.retry_count, q.max_retries
            "#,
        )
        .bind(max_retries.min(i32::MAX as u32) as i32)
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut requeued = Vec::with_capacity(rows.len());
        for row in &rows {
            let retry_count: i32 = row.try_get("retry_count")?;
            let max: i32 = row.try_get("max_retries")?;
            requeued.push(RequeuedJob {
                job_id: JobId(row.try_get("job_id")?),
                retry_count: retry_count.max(0) as u32,
                max_retries: max.max(0) as u32,
            });
        }

        if !requeued.is_empty() {
            let ids: Vec<Uuid> = requeued.iter().map(|r| r.job_id.0).collect();
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'queued',
                    progress = 0,
                    current_stage = NULL,
                    error = NULL,
                    completed_at = NULL,
                    updated_at = NOW()
                WHERE id = ANY($1)
                "#,
            )
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(count = requeued.len(), "retry sweep finished");
        Ok(RetrySweep { requeued })
    }

    async fn retry_as_new(&self, id: JobId, owner: Option<OwnerId>) -> Result<Job> {
        let original = self.get(id, owner).await?;
        if !matches!(original.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(QueueError::validation(format!(
                "job {id} is {}; only failed or cancelled jobs can be retried",
                original.status
            )));
        }
        let entry = self.queue_entry(id).await?;

        let new_job = NewJob::new(
            original.owner_id,
            original.priority,
            original.configuration,
            entry.max_retries,
        )
        .retry_of(original.id);

        let mut tx = self.pool.begin().await?;
        let job = insert_job(&mut tx, &new_job).await?;
        tx.commit().await?;
        info!(job_id = %job.id, parent_job_id = %id, "job resubmitted as new");
        Ok(job)
    }
}

#[async_trait]
impl LifecycleManager for PostgresQueueService {
    async fn escalate_stale(
        &self,
        policy: &EscalationPolicy,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Escalation>> {
        let mut tx = self.pool.begin().await?;
        lock_queue_sweeps(&mut tx).await?;

        let due = sqlx::query(
            r#"
            SELECT q.job_id, q.priority
            FROM queue_entries q
            JOIN jobs j ON j.id = q.job_id
            WHERE q.queue_status = 'queued'
              AND NOT q.is_deleted
              AND j.status = 'queued'
              AND NOT j.is_deleted
              AND q.priority < $1
              AND COALESCE(q.escalated_at, q.queued_at) < $2
            ORDER BY q.queued_at ASC, q.job_id ASC
            LIMIT $3
            FOR UPDATE OF j SKIP LOCKED
            "#,
        )
        .bind(JobPriority::Urgent.weight())
        .bind(policy.cutoff(now))
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut escalations = Vec::with_capacity(due.len());
        for row in &due {
            let job_id = JobId(row.try_get("job_id")?);
            let from = JobPriority::from_weight(row.try_get("priority")?)?;
            let to = from.escalated();

            sqlx::query("UPDATE jobs SET priority = $2, updated_at = NOW() WHERE id = $1")
                .bind(job_id.0)
                .bind(to.as_str())
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "UPDATE queue_entries SET priority = $2, escalated_at = $3 WHERE job_id = $1",
            )
            .bind(job_id.0)
            .bind(to.weight())
            .bind(now)
            .execute(&mut *tx)
            .await?;

            escalations.push(Escalation { job_id, from, to });
        }

        tx.commit().await?;
        Ok(escalations)
    }

    async fn overdue(
        &self,
        policy: &TimeoutPolicy,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OverdueJob>> {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'processing' AND NOT is_deleted \
             AND created_at < "
        ));
        qb.push_bind(policy.scan_cutoff(now))
            .push(" AND created_at + CASE");
        for job_type in [JobType::VideoGeneration, JobType::BatchVideoGeneration] {
            for priority in JobPriority::ALL {
                let seconds = policy.timeout(job_type, priority).num_seconds() as f64;
                qb.push(" WHEN job_type = ")
                    .push_bind(job_type.as_str())
                    .push(" AND priority = ")
                    .push_bind(priority.as_str())
                    .push(" THEN make_interval(secs => ")
                    .push_bind(seconds)
                    .push(")");
            }
        }
        qb.push(" END < ")
            .push_bind(now)
            .push(" ORDER BY created_at ASC, id ASC LIMIT ")
            .push_bind(limit);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| job_from_row(row).map(|job| OverdueJob::from_job(&job, policy, now)))
            .collect()
    }
}
