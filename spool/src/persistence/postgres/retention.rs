use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use super::{lock_queue_sweeps, PostgresQueueService};
use crate::error::Result;
use crate::job::{BatchId, JobId, OwnerId};
use crate::retention::{
    BatchRetentionCandidate, RetentionCandidate, RetentionManager, RetentionPolicy,
    RetentionReport, RETAINED_STATUSES,
};

struct Selection {
    jobs: Vec<RetentionCandidate>,
    batches: Vec<BatchRetentionCandidate>,
}

/// Selection shared by preview and apply. With `lock` the selected rows are
/// held until the surrounding transaction ends.
async fn select_expired(
    conn: &mut PgConnection,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    lock: bool,
) -> Result<Selection> {
    let mut jobs = Vec::new();
    for status in RETAINED_STATUSES {
        let Some(cutoff) = policy.cutoff(status, now) else {
            continue;
        };
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT id, owner_id FROM jobs WHERE NOT is_deleted AND status = ",
        );
        qb.push_bind(status.as_str())
            .push(" AND completed_at < ")
            .push_bind(cutoff)
            .push(" ORDER BY completed_at ASC, id ASC LIMIT ")
            .push_bind(policy.limit);
        if lock {
            qb.push(" FOR UPDATE");
        }

        let rows = qb.build().fetch_all(&mut *conn).await?;
        for row in rows {
            jobs.push(RetentionCandidate {
                job_id: JobId(row.try_get("id")?),
                owner_id: OwnerId(row.try_get("owner_id")?),
                status,
            });
        }
    }

    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
        "SELECT batch_id, owner_id FROM batch_metadata WHERE NOT is_deleted AND created_at < ",
    );
    qb.push_bind(policy.batch_cutoff(now))
        .push(" ORDER BY created_at ASC, batch_id ASC LIMIT ")
        .push_bind(policy.limit);
    if lock {
        qb.push(" FOR UPDATE");
    }
    let batches = qb
        .build()
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(|row| {
            Ok(BatchRetentionCandidate {
                batch_id: BatchId(row.try_get("batch_id")?),
                owner_id: OwnerId(row.try_get("owner_id")?),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Selection { jobs, batches })
}

#[async_trait]
impl RetentionManager for PostgresQueueService {
    async fn preview_retention(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport> {
        policy.validate()?;
        let mut conn = self.pool.acquire().await?;
        let selection = select_expired(&mut conn, policy, now, false).await?;
        Ok(RetentionReport::from_selection(
            &selection.jobs,
            &selection.batches,
            true,
        ))
    }

    async fn apply_retention(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport> {
        policy.validate()?;
        let mut tx = self.pool.begin().await?;
        lock_queue_sweeps(&mut tx).await?;
        let selection = select_expired(&mut tx, policy, now, true).await?;

        if !selection.jobs.is_empty() {
            let ids: Vec<Uuid> = selection.jobs.iter().map(|c| c.job_id.0).collect();
            sqlx::query(
                r#"
                UPDATE jobs
                SET is_deleted = TRUE, deleted_at = NOW(), updated_at = NOW()
                WHERE id = ANY($1)
                "#,
            )
            .bind(&ids)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE queue_entries
                SET is_deleted = TRUE, deleted_at = NOW(), queue_position = NULL
                WHERE job_id = ANY($1)
                "#,
            )
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        }

        if !selection.batches.is_empty() {
            let ids: Vec<Uuid> = selection.batches.iter().map(|b| b.batch_id.0).collect();
            sqlx::query(
                r#"
                UPDATE batch_metadata
                SET is_deleted = TRUE, deleted_at = NOW()
                WHERE batch_id = ANY($1)
                "#,
            )
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        let report =
            RetentionReport::from_selection(&selection.jobs, &selection.batches, false);
        info!(
            jobs = report.total_jobs(),
            batches = report.batches,
            owners = report.affected_owners,
            "retention applied"
        );
        Ok(report)
    }
}
