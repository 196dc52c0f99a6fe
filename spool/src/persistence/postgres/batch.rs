use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{Connection, Row};
use tracing::{info, warn};
use uuid::Uuid;

use super::{insert_job, PostgresQueueService};
use crate::batch::{
    BatchCancellation, BatchCoordinator, BatchJobDetail, BatchMetadata, BatchStatus,
    CancelFailure,
};
use crate::error::{QueueError, Result};
use crate::job::{BatchId, JobId, JobStatus, OwnerId, StatusUpdate};
use crate::request::{BatchJobRequest, BatchJobResponse, FailedBatchItem};
use crate::store::JobStore;

#[async_trait]
impl BatchCoordinator for PostgresQueueService {
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

        let mut tx = self.pool.begin().await?;
        let mut job_ids = Vec::with_capacity(total_jobs);
        let mut failed_jobs = Vec::new();

        for (index, mut member) in request.jobs.into_iter().enumerate() {
            if let Some(priority) = batch_priority {
                member.priority = priority;
            }
            let new_job = match member.into_new_job(owner_id, &self.config) {
                Ok(new_job) => new_job.in_batch(batch_id),
                Err(err) => {
                    failed_jobs.push(FailedBatchItem {
                        index,
                        error: err.to_string(),
                    });
                    continue;
                }
            };

            // one savepoint per member so a failed insert only loses that member
            let mut savepoint = Connection::begin(&mut *tx).await?;
            match insert_job(&mut savepoint, &new_job).await {
                Ok(job) => {
                    savepoint.commit().await?;
                    job_ids.push(job.id);
                }
                Err(err) => {
                    savepoint.rollback().await?;
                    warn!(%batch_id, index, error = %err, "batch member rejected");
                    failed_jobs.push(FailedBatchItem {
                        index,
                        error: err.to_string(),
                    });
                }
            }
        }

        let ids: Vec<Uuid> = job_ids.iter().map(|id| id.0).collect();
        sqlx::query(
            r#"
            INSERT INTO batch_metadata (
                batch_id, owner_id, total_count, created_count, failed_count,
                priority, job_ids, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, clock_timestamp())
            "#,
        )
        .bind(batch_id.0)
        .bind(owner_id.0)
        .bind(total_jobs as i32)
        .bind(job_ids.len() as i32)
        .bind(failed_jobs.len() as i32)
        .bind(priority.as_str())
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(
            %batch_id,
            created = job_ids.len(),
            failed = failed_jobs.len(),
            "batch created"
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
        let row = sqlx::query(
            r#"
            SELECT batch_id, owner_id, total_count, created_count, failed_count,
                   priority, job_ids, created_at, is_deleted
            FROM batch_metadata
            WHERE batch_id = $1
              AND NOT is_deleted
              AND ($2::uuid IS NULL OR owner_id = $2)
            "#,
        )
        .bind(batch_id.0)
        .bind(owner.map(|o| o.0))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| QueueError::batch_not_found(batch_id))?;

        let job_ids: Vec<Uuid> = row.try_get("job_ids")?;
        Ok(BatchMetadata {
            batch_id: BatchId(row.try_get("batch_id")?),
            owner_id: OwnerId(row.try_get("owner_id")?),
            total_count: row.try_get("total_count")?,
            created_count: row.try_get("created_count")?,
            failed_count: row.try_get("failed_count")?,
            priority: row.try_get::<String, _>("priority")?.parse()?,
            created_at: row.try_get("created_at")?,
            job_ids: job_ids.into_iter().map(JobId).collect(),
            is_deleted: row.try_get("is_deleted")?,
        })
    }

    async fn batch_status(
        &self,
        batch_id: BatchId,
        owner: Option<OwnerId>,
    ) -> Result<BatchStatus> {
        let metadata = self.get_batch(batch_id, owner).await?;
        let ids: Vec<Uuid> = metadata.job_ids.iter().map(|id| id.0).collect();

        // bounded by the batch size limit
        let rows = sqlx::query(
            r#"
            SELECT id, status, progress, error
            FROM jobs
            WHERE id = ANY($1)
              AND NOT is_deleted
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_id = HashMap::with_capacity(rows.len());
        for row in rows {
            let job_id = JobId(row.try_get("id")?);
            let progress: i16 = row.try_get("progress")?;
            let error: Option<serde_json::Value> = row.try_get("error")?;
            by_id.insert(
                job_id,
                BatchJobDetail {
                    job_id,
                    status: row.try_get::<String, _>("status")?.parse::<JobStatus>()?,
                    progress: progress.clamp(0, 100) as u8,
                    error: error.map(serde_json::from_value).transpose()?,
                },
            );
        }

        let jobs = metadata
            .job_ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .collect();
        Ok(BatchStatus::from_members(&metadata, jobs))
    }

    async fn cancel_batch(
        &self,
        batch_id: BatchId,
        owner: Option<OwnerId>,
    ) -> Result<BatchCancellation> {
        let metadata = self.get_batch(batch_id, owner).await?;
        let mut outcome = BatchCancellation::default();

        for job_id in metadata.job_ids {
            match self
                .update_status(job_id, StatusUpdate::new(JobStatus::Cancelled))
                .await
            {
                Ok(_) => outcome.cancelled.push(job_id),
                Err(err) if err.is_recoverable() => outcome.failed.push(CancelFailure {
                    job_id,
                    error: err.to_string(),
                }),
                Err(err) => return Err(err),
            }
        }

        info!(
            %batch_id,
            cancelled = outcome.cancelled.len(),
            failed = outcome.failed.len(),
            "batch cancellation finished"
        );
        Ok(outcome)
    }
}
