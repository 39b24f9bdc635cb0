use async_trait::async_trait;
use spotmail_proto::{JobStatus, JobView, Payload, QueueStats, Recipients, TemplateName};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::clock::rfc3339;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt email job {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
}

/// A queued outbound email.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailJob {
    pub id: Uuid,
    pub recipient: Vec<String>,
    pub template: TemplateName,
    pub payload: Payload,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
    pub next_eligible_at: OffsetDateTime,
}

impl EmailJob {
    pub fn view(&self) -> JobView {
        JobView {
            id: self.id.to_string(),
            recipient: Recipients::from_vec(self.recipient.clone()),
            template: self.template,
            status: self.status,
            attempt_count: self.attempt_count,
            last_error: self.last_error.clone(),
            created_at: rfc3339(self.created_at),
            processed_at: self.processed_at.map(rfc3339),
            next_eligible_at: rfc3339(self.next_eligible_at),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewEmailJob {
    pub recipient: Vec<String>,
    pub template: TemplateName,
    pub payload: Payload,
}

/// Outcome of a failed attempt, written back in one update.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub attempt_count: u32,
    pub last_error: String,
    pub status: JobStatus,
    pub next_eligible_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
}

/// Persistence for email jobs.
///
/// Updates only apply to jobs that are still `pending`; the returned flag
/// tells whether a row was changed.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(
        &self,
        job: NewEmailJob,
        now: OffsetDateTime,
    ) -> Result<EmailJob, StoreError>;

    /// Pending jobs with `next_eligible_at <= now`, oldest first.
    async fn fetch_due(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<EmailJob>, StoreError>;

    async fn mark_sent(
        &self,
        id: Uuid,
        at: OffsetDateTime,
    ) -> Result<bool, StoreError>;

    async fn record_failure(
        &self,
        id: Uuid,
        failure: &JobFailure,
    ) -> Result<bool, StoreError>;

    async fn stats(&self) -> Result<QueueStats, StoreError>;
}

pub(crate) fn new_job(
    job: NewEmailJob,
    now: OffsetDateTime,
) -> EmailJob {
    EmailJob {
        id: Uuid::now_v7(),
        recipient: job.recipient,
        template: job.template,
        payload: job.payload,
        status: JobStatus::Pending,
        attempt_count: 0,
        last_error: None,
        created_at: now,
        processed_at: None,
        next_eligible_at: now,
    }
}

/// Process-local queue used when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<Vec<EmailJob>>,
}

impl MemoryJobStore {
    #[cfg(test)]
    pub async fn get(
        &self,
        id: Uuid,
    ) -> Option<EmailJob> {
        self.jobs.lock().await.iter().find(|job| job.id == id).cloned()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(
        &self,
        job: NewEmailJob,
        now: OffsetDateTime,
    ) -> Result<EmailJob, StoreError> {
        let job = new_job(job, now);
        self.jobs.lock().await.push(job.clone());
        Ok(job)
    }

    async fn fetch_due(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<EmailJob>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut due: Vec<EmailJob> = jobs
            .iter()
            .filter(|job| {
                !job.status.is_terminal() && job.next_eligible_at <= now
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        at: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs
            .iter_mut()
            .find(|job| job.id == id && !job.status.is_terminal())
        else {
            return Ok(false);
        };

        job.status = JobStatus::Sent;
        job.processed_at = Some(at);
        job.last_error = None;
        Ok(true)
    }

    async fn record_failure(
        &self,
        id: Uuid,
        failure: &JobFailure,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs
            .iter_mut()
            .find(|job| job.id == id && !job.status.is_terminal())
        else {
            return Ok(false);
        };

        job.attempt_count = failure.attempt_count;
        job.last_error = Some(failure.last_error.clone());
        job.status = failure.status;
        job.next_eligible_at = failure.next_eligible_at;
        job.processed_at = failure.processed_at;
        Ok(true)
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut stats = QueueStats::default();
        for job in jobs.iter() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Sent => stats.sent += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats.total = stats.pending + stats.sent + stats.failed;
        Ok(stats)
    }
}
