use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use tracing::debug;

use super::{
    entry_from_row, job_from_row, lock_queue_sweeps, PostgresQueueService, ENTRY_COLUMNS,
    JOB_COLUMNS,
};
use crate::error::{QueueError, Result};
use crate::estimate::WaitTimeEstimator;
use crate::job::{ClaimedJob, JobId, JobPriority, QueueStatus};
use crate::scheduler::{PriorityScheduler, QueueSnapshot};

#[async_trait]
impl PriorityScheduler for PostgresQueueService {
    async fn recalculate_positions(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        lock_queue_sweeps(&mut tx).await?;

        let ranked = sqlx::query(
            r#"
            WITH ranked AS (
                SELECT job_id,
                       ROW_NUMBER() OVER (
                           ORDER BY priority DESC, queued_at ASC, job_id ASC
                       )::INTEGER AS position
                FROM queue_entries
                WHERE queue_status = 'queued'
                  AND NOT is_deleted
            )
            UPDATE queue_entries q
            SET queue_position = ranked.position
            FROM ranked
            WHERE q.job_id = ranked.job_id
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE queue_entries
            SET queue_position = NULL
            WHERE queue_position IS NOT NULL
              AND (queue_status <> 'queued' OR is_deleted)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(ranked, "queue positions rebuilt");
        Ok(ranked)
    }

    async fn dequeue_next(
        &self,
        worker_id: &str,
        processing_node: Option<&str>,
    ) -> Result<Option<ClaimedJob>> {
        let mut tx = self.pool.begin().await?;

        // jobs row first, then its entry: the same order as update_status
        let job_row = sqlx::query(&format!(
            r#"
            WITH next AS (
                SELECT j.id AS next_id
                FROM queue_entries q
                JOIN jobs j ON j.id = q.job_id
                WHERE q.queue_status = 'queued'
                  AND NOT q.is_deleted
                  AND j.status = 'queued'
                  AND NOT j.is_deleted
                ORDER BY q.priority DESC, q.queued_at ASC, q.job_id ASC
                LIMIT 1
                FOR UPDATE OF j SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'processing',
                started_at = COALESCE(started_at, NOW()),
                updated_at = NOW()
            FROM next
            WHERE id = next.next_id
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job_row) = job_row else {
            drop(tx);
            return Ok(None);
        };
        let job = job_from_row(&job_row)?;

        let entry_row = sqlx::query(&format!(
            r#"
            UPDATE queue_entries
            SET queue_status = 'processing',
                worker_id = $2,
                processing_node = $3,
                processing_started_at = NOW(),
                queue_position = NULL
            WHERE job_id = $1
              AND queue_status = 'queued'
            RETURNING {ENTRY_COLUMNS}
            "#
        ))
        .bind(job.id.0)
        .bind(worker_id)
        .bind(processing_node)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(entry_row) = entry_row else {
            // job said queued but its entry moved on; leave both untouched
            drop(tx);
            return Err(QueueError::persistence(format!(
                "job {} is queued but its queue entry is not",
                job.id
            )));
        };
        let entry = entry_from_row(&entry_row)?;

        tx.commit().await?;
        debug!(job_id = %job.id, worker_id, "job dequeued");
        Ok(Some(ClaimedJob { job, entry }))
    }

    async fn queue_position(&self, id: JobId) -> Result<Option<i32>> {
        let row = sqlx::query(
            "SELECT queue_position FROM queue_entries WHERE job_id = $1 AND NOT is_deleted",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| QueueError::job_not_found(id))?;
        Ok(row.try_get("queue_position")?)
    }

    async fn snapshot(&self) -> Result<QueueSnapshot> {
        let rows = sqlx::query(
            r#"
            SELECT priority, queue_status, COUNT(*) AS entries
            FROM queue_entries
            WHERE NOT is_deleted
              AND queue_status IN ('queued', 'processing')
            GROUP BY priority, queue_status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = QueueSnapshot::new(Utc::now());
        for row in rows {
            let priority = JobPriority::from_weight(row.try_get("priority")?)?;
            let status: QueueStatus = row.try_get::<String, _>("queue_status")?.parse()?;
            let count: i64 = row.try_get("entries")?;
            let entry = snapshot.entry_mut(priority);
            match status {
                QueueStatus::Queued => entry.queued_count += count as usize,
                QueueStatus::Processing => entry.processing_count += count as usize,
                QueueStatus::Completed => {}
            }
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl WaitTimeEstimator for PostgresQueueService {
    async fn average_processing_time(
        &self,
        priority: JobPriority,
        since: DateTime<Utc>,
    ) -> Result<Option<Duration>> {
        let avg_secs: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT AVG(EXTRACT(EPOCH FROM (j.completed_at - q.processing_started_at)))::DOUBLE PRECISION
            FROM jobs j
            JOIN queue_entries q ON q.job_id = j.id
            WHERE j.status = 'completed'
              AND j.priority = $1
              AND q.processing_started_at IS NOT NULL
              AND j.completed_at >= $2
            "#,
        )
        .bind(priority.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(avg_secs.map(|secs| Duration::milliseconds((secs * 1000.0).round() as i64)))
    }
}
