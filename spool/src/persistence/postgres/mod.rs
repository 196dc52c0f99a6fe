use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::job::{
    apply_status_update, BatchId, Job, JobId, JobPriority, JobStatus, NewJob,
    OwnerId, QueueEntry, StatusUpdate,
};
use crate::lifecycle::check_status_update;
use crate::payload::JobConfiguration;
use crate::request::MAX_RETRIES_CAP;
use crate::store::{JobFilter, JobStore};

mod batch;
mod retention;
mod scheduler;
mod sweeps;

/// Schema for `jobs`, `queue_entries` and `batch_metadata`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub(crate) const JOB_COLUMNS: &str = "id, owner_id, job_type, priority, configuration, \
     status, progress, current_stage, completed_stages, error, metrics, created_at, \
     updated_at, started_at, completed_at, batch_id, parent_job_id, is_deleted, deleted_at";

pub(crate) const ENTRY_COLUMNS: &str = "job_id, priority, queue_status, worker_id, \
     processing_node, queued_at, processing_started_at, completed_at, escalated_at, \
     retry_count, max_retries, next_retry_at, queue_position, is_deleted";

/// Key of the transaction-scoped advisory lock held by every transaction
/// that writes many queue entries at once.
const QUEUE_SWEEP_LOCK_KEY: i64 = 0x5350_4f4f_4c00_0001;

/// Serialize multi-entry writers (position rebuild, retry sweep, escalation,
/// retention). Must be the first lock the transaction takes.
pub(crate) async fn lock_queue_sweeps(conn: &mut PgConnection) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(QUEUE_SWEEP_LOCK_KEY)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// PostgreSQL-backed queue.
///
/// All coordination between workers goes through row locks and one
/// transaction-scoped advisory lock; the service itself holds no state
/// besides the pool. Row locks are always taken on `jobs` before
/// `queue_entries`.
#[derive(Debug, Clone)]
pub struct PostgresQueueService {
    pool: PgPool,
    config: QueueConfig,
}

impl PostgresQueueService {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|err| QueueError::Persistence(Box::new(err)))
    }
}

fn to_u32(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| QueueError::persistence(format!("negative {column}: {value}")))
}

pub(crate) fn job_from_row(row: &PgRow) -> Result<Job> {
    let progress: i16 = row.try_get("progress")?;
    let progress = u8::try_from(progress)
        .map_err(|_| QueueError::persistence(format!("progress out of range: {progress}")))?;
    let configuration: serde_json::Value = row.try_get("configuration")?;
    let completed_stages: serde_json::Value = row.try_get("completed_stages")?;
    let error: Option<serde_json::Value> = row.try_get("error")?;
    let metrics: Option<serde_json::Value> = row.try_get("metrics")?;
    let batch_id: Option<Uuid> = row.try_get("batch_id")?;
    let parent_job_id: Option<Uuid> = row.try_get("parent_job_id")?;

    Ok(Job {
        id: JobId(row.try_get("id")?),
        owner_id: OwnerId(row.try_get("owner_id")?),
        job_type: row.try_get::<String, _>("job_type")?.parse()?,
        priority: row.try_get::<String, _>("priority")?.parse()?,
        configuration: JobConfiguration::from_json(configuration)?,
        status: row.try_get::<String, _>("status")?.parse()?,
        progress,
        current_stage: row.try_get("current_stage")?,
        completed_stages: serde_json::from_value(completed_stages)?,
        error: error.map(serde_json::from_value).transpose()?,
        metrics: metrics.map(serde_json::from_value).transpose()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        batch_id: batch_id.map(BatchId),
        parent_job_id: parent_job_id.map(JobId),
        is_deleted: row.try_get("is_deleted")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

pub(crate) fn entry_from_row(row: &PgRow) -> Result<QueueEntry> {
    Ok(QueueEntry {
        job_id: JobId(row.try_get("job_id")?),
        priority: JobPriority::from_weight(row.try_get("priority")?)?,
        queue_status: row.try_get::<String, _>("queue_status")?.parse()?,
        worker_id: row.try_get("worker_id")?,
        processing_node: row.try_get("processing_node")?,
        queued_at: row.try_get("queued_at")?,
        processing_started_at: row.try_get("processing_started_at")?,
        completed_at: row.try_get("completed_at")?,
        escalated_at: row.try_get("escalated_at")?,
        retry_count: to_u32(row.try_get("retry_count")?, "retry_count")?,
        max_retries: to_u32(row.try_get("max_retries")?, "max_retries")?,
        next_retry_at: row.try_get("next_retry_at")?,
        queue_position: row.try_get("queue_position")?,
        is_deleted: row.try_get("is_deleted")?,
    })
}

/// Insert a job and its queue entry on `conn`. The caller owns the
/// transaction.
pub(crate) async fn insert_job(conn: &mut PgConnection, new_job: &NewJob) -> Result<Job> {
    new_job.configuration.validate()?;
    if new_job.max_retries > MAX_RETRIES_CAP {
        return Err(QueueError::validation(format!(
            "max_retries must be at most {MAX_RETRIES_CAP}, got {}",
            new_job.max_retries
        )));
    }

    let row = sqlx::query(&format!(
        r#"
        INSERT INTO jobs (
            id, owner_id, job_type, priority, configuration, status, progress,
            completed_stages, created_at, updated_at, batch_id, parent_job_id
        )
        VALUES ($1, $2, $3, $4, $5, 'queued', 0, '[]'::jsonb,
                clock_timestamp(), clock_timestamp(), $6, $7)
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(new_job.id.0)
    .bind(new_job.owner_id.0)
    .bind(new_job.job_type.as_str())
    .bind(new_job.priority.as_str())
    .bind(new_job.configuration.to_json()?)
    .bind(new_job.batch_id.map(|id| id.0))
    .bind(new_job.parent_job_id.map(|id| id.0))
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO queue_entries (job_id, priority, queue_status, queued_at, retry_count, max_retries)
        VALUES ($1, $2, 'queued', clock_timestamp(), 0, $3)
        "#,
    )
    .bind(new_job.id.0)
    .bind(new_job.priority.weight())
    .bind(new_job.max_retries as i32)
    .execute(&mut *conn)
    .await?;

    job_from_row(&row)
}

/// Load a live job under a row lock.
pub(crate) async fn lock_job(conn: &mut PgConnection, id: JobId) -> Result<Job> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND NOT is_deleted FOR UPDATE"
    ))
    .bind(id.0)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| QueueError::job_not_found(id))?;
    job_from_row(&row)
}

pub(crate) async fn write_job(conn: &mut PgConnection, job: &Job) -> Result<()> {
    let completed_stages = serde_json::to_value(&job.completed_stages)?;
    let error = job.error.as_ref().map(serde_json::to_value).transpose()?;
    let metrics = job.metrics.as_ref().map(serde_json::to_value).transpose()?;

    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2,
            priority = $3,
            progress = $4,
            current_stage = $5,
            completed_stages = $6,
            error = $7,
            metrics = $8,
            updated_at = $9,
            started_at = $10,
            completed_at = $11
        WHERE id = $1
        "#,
    )
    .bind(job.id.0)
    .bind(job.status.as_str())
    .bind(job.priority.as_str())
    .bind(i16::from(job.progress))
    .bind(&job.current_stage)
    .bind(completed_stages)
    .bind(error)
    .bind(metrics)
    .bind(job.updated_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Move the queue entry to match a status the job just entered.
async fn sync_entry(
    conn: &mut PgConnection,
    id: JobId,
    previous: JobStatus,
    update: &StatusUpdate,
    now: DateTime<Utc>,
) -> Result<()> {
    if previous == update.status {
        return Ok(());
    }
    match update.status {
        JobStatus::Processing => {
            sqlx::query(
                r#"
                UPDATE queue_entries
                SET queue_status = 'processing',
                    processing_started_at = COALESCE(processing_started_at, $2),
                    queue_position = NULL
                WHERE job_id = $1
                "#,
            )
            .bind(id.0)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }
        JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
            let next_retry_at = match update.status {
                JobStatus::Failed => update.next_retry_at,
                _ => None,
            };
            sqlx::query(
                r#"
                UPDATE queue_entries
                SET queue_status = 'completed',
                    completed_at = COALESCE(completed_at, $2),
                    queue_position = NULL,
                    next_retry_at = $3
                WHERE job_id = $1
                "#,
            )
            .bind(id.0)
            .bind(now)
            .bind(next_retry_at)
            .execute(&mut *conn)
            .await?;
        }
        JobStatus::Queued => {}
    }
    Ok(())
}

#[async_trait]
impl JobStore for PostgresQueueService {
    async fn create(&self, new_job: NewJob) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let job = insert_job(&mut tx, &new_job).await?;
        tx.commit().await?;
        debug!(job_id = %job.id, priority = %job.priority, "job row created");
        Ok(job)
    }

    async fn get(&self, id: JobId, owner: Option<OwnerId>) -> Result<Job> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE id = $1
              AND NOT is_deleted
              AND ($2::uuid IS NULL OR owner_id = $2)
            "#
        ))
        .bind(id.0)
        .bind(owner.map(|o| o.0))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| QueueError::job_not_found(id))?;
        job_from_row(&row)
    }

    async fn update_status(&self, id: JobId, update: StatusUpdate) -> Result<Job> {
        update.validate()?;
        let mut tx = self.pool.begin().await?;

        let mut job = lock_job(&mut tx, id).await?;
        check_status_update(id, job.status, update.status)?;
        let previous = job.status;

        let now: DateTime<Utc> = sqlx::query_scalar("SELECT NOW()")
            .fetch_one(&mut *tx)
            .await?;
        apply_status_update(&mut job, &update, now);
        write_job(&mut tx, &job).await?;
        sync_entry(&mut tx, id, previous, &update, now).await?;

        tx.commit().await?;
        debug!(job_id = %id, from = %previous, to = %job.status, "job status updated");
        Ok(job)
    }

    async fn soft_delete(&self, id: JobId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET is_deleted = TRUE, deleted_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND NOT is_deleted
            "#,
        )
        .bind(id.0)
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            return Err(QueueError::job_not_found(id));
        }

        sqlx::query(
            r#"
            UPDATE queue_entries
            SET is_deleted = TRUE, deleted_at = NOW(), queue_position = NULL
            WHERE job_id = $1
            "#,
        )
        .bind(id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn queue_entry(&self, id: JobId) -> Result<QueueEntry> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE job_id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| QueueError::job_not_found(id))?;
        entry_from_row(&row)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE TRUE"));

        if !filter.include_deleted {
            qb.push(" AND NOT is_deleted");
        }
        if let Some(owner) = filter.owner_id {
            qb.push(" AND owner_id = ").push_bind(owner.0);
        }
        if !filter.statuses.is_empty() {
            let statuses: Vec<String> = filter
                .statuses
                .iter()
                .map(|s| s.as_str().to_string())
                .collect();
            qb.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if let Some(job_type) = filter.job_type {
            qb.push(" AND job_type = ").push_bind(job_type.as_str());
        }
        if let Some(priority) = filter.priority {
            qb.push(" AND priority = ").push_bind(priority.as_str());
        }
        if let Some(batch_id) = filter.batch_id {
            qb.push(" AND batch_id = ").push_bind(batch_id.0);
        }
        if let Some(after) = filter.created_after {
            qb.push(" AND created_at >= ").push_bind(after);
        }
        if let Some(before) = filter.created_before {
            qb.push(" AND created_at < ").push_bind(before);
        }

        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(filter.effective_limit())
            .push(" OFFSET ")
            .push_bind(filter.effective_offset());

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }
}
