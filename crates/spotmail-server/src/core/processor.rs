use std::sync::Arc;
use std::time::Duration;

use spotmail_proto::{BatchSummary, JobStatus, Payload, QueueStats, TemplateName};
use thiserror::Error;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::alerting::{AdminAlerter, FailureContext};
use super::clock::Clock;
use super::mailer::{DispatchError, Mailer, OutboundMessage};
use super::store::{EmailJob, JobFailure, JobStore, NewEmailJob, StoreError};
use super::templates::{RenderError, render};
use crate::config::QueueConfig;

pub type BatchOutcome = BatchSummary;

/// Exponential backoff between attempts of the same job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(queue: &QueueConfig) -> Self {
        Self {
            max_attempts: queue.max_attempts.max(1),
            base_backoff: queue.base_backoff,
            max_backoff: queue.max_backoff,
        }
    }

    /// `base * 2^(attempt - 1)`, capped at `max_backoff`.
    pub fn backoff(
        &self,
        attempt: u32,
    ) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    pub fn is_exhausted(
        &self,
        attempts: u32,
    ) -> bool {
        attempts >= self.max_attempts
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("job store failed: {0}")]
    Store(#[from] StoreError),
    #[error("batch halted at job {job_id}: {source}")]
    Halted {
        job_id: Uuid,
        #[source]
        source: DispatchError,
        progress: BatchOutcome,
    },
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl AttemptError {
    fn is_permanent(&self) -> bool {
        match self {
            Self::Render(_) => true,
            Self::Dispatch(err) => err.is_permanent(),
        }
    }
}

pub struct QueueProcessor {
    store: Arc<dyn JobStore>,
    mailer: Arc<Mailer>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl QueueProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        mailer: Arc<Mailer>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self { store, mailer, clock, retry }
    }

    pub async fn enqueue(
        &self,
        recipient: Vec<String>,
        template: TemplateName,
        payload: Payload,
    ) -> Result<EmailJob, StoreError> {
        let job = self
            .store
            .enqueue(NewEmailJob { recipient, template, payload }, self.clock.now())
            .await?;
        info!(
            "email job queued: id={}, template={}, recipients={}",
            job.id,
            job.template,
            job.recipient.len()
        );
        Ok(job)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        self.store.stats().await
    }

    /// Sends up to `max_batch_size` due jobs, one after another, oldest first.
    ///
    /// Configuration, authentication and unreachable-provider errors stop the
    /// batch and leave the current job as it was. Every other dispatch error
    /// is written back to the job.
    pub async fn process_queue(
        &self,
        max_batch_size: usize,
    ) -> Result<BatchOutcome, BatchError> {
        let jobs = self.store.fetch_due(self.clock.now(), max_batch_size).await?;
        let mut outcome = BatchOutcome::default();

        for job in jobs {
            match self.attempt(&job).await {
                Ok(message_id) => {
                    let updated = self.store.mark_sent(job.id, self.clock.now()).await?;
                    if !updated {
                        debug!("email job changed during send: id={}", job.id);
                    }
                    info!(
                        "email job sent: id={}, template={}, message_id={}",
                        job.id, job.template, message_id
                    );
                    outcome.succeeded += 1;
                }
                Err(AttemptError::Dispatch(err)) if err.halts_batch() => {
                    warn!(
                        "batch halted: id={}, code={:?}, processed={}, error={}",
                        job.id, err.code(), outcome.processed, err
                    );
                    return Err(BatchError::Halted {
                        job_id: job.id,
                        source: err,
                        progress: outcome,
                    });
                }
                Err(err) => {
                    let failure = self.failure_for(&job, &err);
                    self.store.record_failure(job.id, &failure).await?;
                    if failure.status == JobStatus::Failed {
                        warn!(
                            "email job failed: id={}, attempts={}, error={}",
                            job.id, failure.attempt_count, failure.last_error
                        );
                        outcome.failed += 1;
                    } else {
                        info!(
                            "email job deferred: id={}, attempts={}, retry_at={}, error={}",
                            job.id,
                            failure.attempt_count,
                            failure.next_eligible_at,
                            failure.last_error
                        );
                        outcome.deferred += 1;
                    }
                }
            }
            outcome.processed += 1;
        }

        Ok(outcome)
    }

    async fn attempt(
        &self,
        job: &EmailJob,
    ) -> Result<String, AttemptError> {
        let rendered = render(job.template, &job.payload)?;
        let outbound = OutboundMessage::from_rendered(job.recipient.clone(), rendered);
        let delivery = self.mailer.send(&outbound).await?;
        Ok(delivery.message_id)
    }

    fn failure_for(
        &self,
        job: &EmailJob,
        err: &AttemptError,
    ) -> JobFailure {
        let now = self.clock.now();
        let attempt_count = job.attempt_count.saturating_add(1);

        if err.is_permanent() || self.retry.is_exhausted(attempt_count) {
            JobFailure {
                attempt_count,
                last_error: err.to_string(),
                status: JobStatus::Failed,
                next_eligible_at: job.next_eligible_at,
                processed_at: Some(now),
            }
        } else {
            JobFailure {
                attempt_count,
                last_error: err.to_string(),
                status: JobStatus::Pending,
                next_eligible_at: now + self.retry.backoff(attempt_count),
                processed_at: None,
            }
        }
    }
}

/// One batch run as triggered by cron or the ticker. A failed run is
/// reported to the admin before the error is returned.
pub async fn run_scheduled_batch(
    processor: &QueueProcessor,
    alerter: &AdminAlerter,
    batch_size: usize,
    source: &str,
) -> Result<BatchOutcome, BatchError> {
    match processor.process_queue(batch_size).await {
        Ok(outcome) => {
            info!(
                "batch finished: source={}, processed={}, succeeded={}, failed={}, deferred={}",
                source,
                outcome.processed,
                outcome.succeeded,
                outcome.failed,
                outcome.deferred
            );
            Ok(outcome)
        }
        Err(err) => {
            if let BatchError::Halted { progress, .. } = &err {
                warn!(
                    "batch aborted: source={}, processed={}, succeeded={}, failed={}, deferred={}",
                    source,
                    progress.processed,
                    progress.succeeded,
                    progress.failed,
                    progress.deferred
                );
            }
            alerter
                .notify_failure(&FailureContext { source, error: err.to_string() })
                .await;
            Err(err)
        }
    }
}

/// Drains the queue on a fixed interval without an external cron.
pub async fn spawn_queue_ticker(
    processor: Arc<QueueProcessor>,
    alerter: Arc<AdminAlerter>,
    batch_size: usize,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("queue ticker active: every={}s, batch_size={}", every.as_secs(), batch_size);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("queue ticker stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(err) =
                    run_scheduled_batch(&processor, &alerter, batch_size, "ticker").await
                {
                    warn!("scheduled batch failed: error={err}");
                }
            }
        }
    }
}
