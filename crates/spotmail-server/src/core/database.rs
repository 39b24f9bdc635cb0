use anyhow::{Context, Result};
use async_trait::async_trait;
use spotmail_proto::{JobStatus, Payload, QueueStats, TemplateName};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::store::{
    EmailJob, JobFailure, JobStore, NewEmailJob, StoreError, new_job
};

const JOB_COLUMNS: &str = "id, recipient, template, payload, status, attempt_count, last_error, created_at, processed_at, next_eligible_at";

/// `email_queue` table on Postgres. Schema: `sql/email_queue.sql`.
#[derive(Debug)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("failed to open postgres pool")?;

        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .context("database ping failed")?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(
        &self,
        job: NewEmailJob,
        now: OffsetDateTime,
    ) -> Result<EmailJob, StoreError> {
        let job = new_job(job, now);

        sqlx::query(
            "INSERT INTO email_queue (id, recipient, template, payload, status, attempt_count, last_error, created_at, processed_at, next_eligible_at) VALUES ($1, $2, $3, $4, $5, $6, NULL, $7, NULL, $8)",
        )
        .bind(job.id)
        .bind(&job.recipient)
        .bind(job.template.as_str())
        .bind(Json(&job.payload))
        .bind(job.status.as_str())
        .bind(attempt_to_db(job.attempt_count))
        .bind(job.created_at)
        .bind(job.next_eligible_at)
        .execute(&self.pool)
        .await?;

        debug!(
            "db insert email_queue: id={}, template={}, recipients={}",
            job.id,
            job.template,
            job.recipient.len()
        );
        Ok(job)
    }

    async fn fetch_due(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<EmailJob>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM email_queue WHERE status = 'pending' AND next_eligible_at <= $1 ORDER BY created_at ASC, id ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        at: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE email_queue SET status = 'sent', processed_at = $2, last_error = NULL WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        debug!(
            "db update email_queue: op=sent, id={}, rows_affected={}",
            id,
            result.rows_affected()
        );
        Ok(result.rows_affected() == 1)
    }

    async fn record_failure(
        &self,
        id: Uuid,
        failure: &JobFailure,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE email_queue SET status = $2, attempt_count = $3, last_error = $4, next_eligible_at = $5, processed_at = $6 WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(failure.status.as_str())
        .bind(attempt_to_db(failure.attempt_count))
        .bind(&failure.last_error)
        .bind(failure.next_eligible_at)
        .bind(failure.processed_at)
        .execute(&self.pool)
        .await?;

        debug!(
            "db update email_queue: op=failure, id={}, status={}, attempt_count={}, rows_affected={}",
            id,
            failure.status.as_str(),
            failure.attempt_count,
            result.rows_affected()
        );
        Ok(result.rows_affected() == 1)
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM email_queue GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or_default();
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Pending) => stats.pending = count,
                Ok(JobStatus::Sent) => stats.sent = count,
                Ok(JobStatus::Failed) => stats.failed = count,
                Err(_) => {}
            }
            stats.total += count;
        }
        Ok(stats)
    }
}

fn attempt_to_db(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn job_from_row(row: &PgRow) -> Result<EmailJob, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let corrupt = |reason: String| StoreError::Corrupt { id, reason };

    let template = row
        .try_get::<String, _>("template")?
        .parse::<TemplateName>()
        .map_err(|err| corrupt(err.to_string()))?;
    let status = row
        .try_get::<String, _>("status")?
        .parse::<JobStatus>()
        .map_err(|err| corrupt(err.to_string()))?;
    let attempt_count = u32::try_from(row.try_get::<i32, _>("attempt_count")?)
        .map_err(|_| corrupt("negative attempt_count".to_string()))?;
    let Json(payload) = row.try_get::<Json<Payload>, _>("payload")?;

    Ok(EmailJob {
        id,
        recipient: row.try_get("recipient")?,
        template,
        payload,
        status,
        attempt_count,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
        next_eligible_at: row.try_get("next_eligible_at")?,
    })
}
