//! Job lifecycle operations on top of a [`JobStore`].
//!
//! Every operation is expressed as a [`JobChangeSet`] and applied in one
//! atomic unit. The `plan_*` functions return that change set instead, for
//! callers that apply it inside their own transaction
//! (see `PostgresJobStore::apply_in_tx`).

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use cakeday_core::schedule::{retry_at, RetryPolicy};
use cakeday_core::{ClaimedJob, DomainError, JobId, JobKind, MessageJob, User, UserId};

use super::store::{JobChange, JobChangeSet, JobStore, JobStoreError};

#[derive(Debug, thiserror::Error)]
pub enum JobServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// What `mark_retry` did with a transiently failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back in `Retry`, eligible again at `next_attempt_at`.
    Scheduled {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// The attempt ceiling was reached; the job is now `Failed`.
    Exhausted { attempts: u32 },
}

impl RetryDecision {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryDecision::Scheduled { attempts, .. } | RetryDecision::Exhausted { attempts } => *attempts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobService<S> {
    store: S,
    retry: RetryPolicy,
    kind: JobKind,
}

impl<S: JobStore> JobService<S> {
    /// Birthday jobs with the default retry policy.
    pub fn new(store: S) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            kind: JobKind::Birthday,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn plan_schedule_next(&self, user: &User, now: DateTime<Utc>) -> Result<(JobChangeSet, MessageJob), DomainError> {
        let job = MessageJob::next_for(user, self.kind.clone(), now)?;
        let changes = JobChangeSet::new(now).push(JobChange::Insert(job.clone()));
        Ok((changes, job))
    }

    /// Create the `Pending` job for the user's next occurrence.
    pub async fn schedule_next(&self, user: &User, now: DateTime<Utc>) -> Result<MessageJob, JobServiceError> {
        let (changes, job) = self.plan_schedule_next(user, now)?;
        self.store.apply(changes).await?;
        debug!(job_id = %job.id, user_id = %user.id, scheduled_at = %job.scheduled_at_utc, "job scheduled");
        Ok(job)
    }

    pub fn plan_reschedule(&self, user: &User, now: DateTime<Utc>) -> Result<(JobChangeSet, MessageJob), DomainError> {
        let job = MessageJob::next_for(user, self.kind.clone(), now)?;
        let changes = JobChangeSet::new(now)
            .push(JobChange::CancelOpen {
                user_id: user.id,
                kind: self.kind.clone(),
            })
            .push(JobChange::Insert(job.clone()));
        Ok((changes, job))
    }

    /// Replace the user's open job with one for their current profile.
    ///
    /// Idempotent: repeated calls leave exactly one open job. Jobs already
    /// claimed (`Sending`) are left alone.
    pub async fn reschedule(&self, user: &User, now: DateTime<Utc>) -> Result<MessageJob, JobServiceError> {
        let (changes, job) = self.plan_reschedule(user, now)?;
        self.store.apply(changes).await?;
        debug!(job_id = %job.id, user_id = %user.id, scheduled_at = %job.scheduled_at_utc, "job rescheduled");
        Ok(job)
    }

    pub fn plan_cancel_all(&self, user_id: UserId, now: DateTime<Utc>) -> JobChangeSet {
        JobChangeSet::new(now).push(JobChange::CancelAllOpen { user_id })
    }

    /// Drop every open job of a user (profile deleted or opted out).
    pub async fn cancel_all(&self, user_id: UserId, now: DateTime<Utc>) -> Result<(), JobServiceError> {
        self.store.apply(self.plan_cancel_all(user_id, now)).await?;
        debug!(%user_id, "open jobs cancelled");
        Ok(())
    }

    pub async fn mark_sent(&self, job_id: JobId, now: DateTime<Utc>) -> Result<(), JobServiceError> {
        self.store
            .apply(JobChangeSet::new(now).push(JobChange::MarkSent { job_id, sent_at: now }))
            .await?;
        Ok(())
    }

    /// Retry change for a claimed job whose current attempt just failed.
    ///
    /// At the attempt ceiling this is [`plan_fail`](Self::plan_fail) instead.
    pub fn plan_retry(
        &self,
        job: &ClaimedJob,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(JobChangeSet, RetryDecision), DomainError> {
        let attempts_so_far = job.job.attempts;
        let attempts = attempts_so_far.saturating_add(1);
        if !self.retry.should_retry(attempts) {
            let (changes, _) = self.plan_fail(job, error, now)?;
            return Ok((changes, RetryDecision::Exhausted { attempts }));
        }

        let next_attempt_at = retry_at(now, self.retry.next_delay(attempts_so_far));
        let changes = JobChangeSet::new(now).push(JobChange::MarkRetry {
            job_id: job.id(),
            attempts,
            next_attempt_at,
            error: error.to_string(),
        });
        Ok((changes, RetryDecision::Scheduled { attempts, next_attempt_at }))
    }

    /// Move a `Sending` job to `Retry` with back-off, or fail it (queueing the
    /// next occurrence) once the attempt ceiling is reached.
    pub async fn mark_retry(
        &self,
        job: &ClaimedJob,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision, JobServiceError> {
        let (changes, decision) = self.plan_retry(job, error, now)?;
        self.store.apply(changes).await?;
        Ok(decision)
    }

    pub fn plan_fail(
        &self,
        job: &ClaimedJob,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(JobChangeSet, MessageJob), DomainError> {
        let (follow_up, next) = self.plan_follow_up(job, now)?;
        let changes = JobChangeSet::new(now)
            .push(JobChange::MarkFailed {
                job_id: job.id(),
                attempts: job.job.attempts.saturating_add(1),
                error: error.to_string(),
            })
            .merge(follow_up);
        Ok((changes, next))
    }

    /// Give up on this occurrence and queue the next one, atomically.
    ///
    /// A failed occurrence never ends the user's schedule.
    pub async fn fail(&self, job: &ClaimedJob, error: &str, now: DateTime<Utc>) -> Result<MessageJob, JobServiceError> {
        let (changes, next) = self.plan_fail(job, error, now)?;
        self.store.apply(changes).await?;
        Ok(next)
    }

    /// Terminal failure with no follow-up, for jobs whose kind cannot be
    /// scheduled at all.
    pub async fn mark_failed(
        &self,
        job_id: JobId,
        attempts_so_far: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), JobServiceError> {
        self.store
            .apply(JobChangeSet::new(now).push(JobChange::MarkFailed {
                job_id,
                attempts: attempts_so_far.saturating_add(1),
                error: error.to_string(),
            }))
            .await?;
        Ok(())
    }

    pub fn plan_follow_up(&self, job: &ClaimedJob, now: DateTime<Utc>) -> Result<(JobChangeSet, MessageJob), DomainError> {
        let next = job.follow_up(now)?;
        let changes = JobChangeSet::new(now).push(JobChange::InsertUnlessOpen(next.clone()));
        Ok((changes, next))
    }

    /// Queue the occurrence after the one `job` delivered.
    ///
    /// Skipped when the user already has an open job of that kind (a
    /// reschedule raced the send).
    pub async fn schedule_follow_up(&self, job: &ClaimedJob, now: DateTime<Utc>) -> Result<MessageJob, JobServiceError> {
        let (changes, next) = self.plan_follow_up(job, now)?;
        self.store.apply(changes).await?;
        Ok(next)
    }

    pub fn plan_complete(&self, job: &ClaimedJob, now: DateTime<Utc>) -> Result<(JobChangeSet, MessageJob), DomainError> {
        let (follow_up, next) = self.plan_follow_up(job, now)?;
        let changes = JobChangeSet::new(now)
            .push(JobChange::MarkSent {
                job_id: job.id(),
                sent_at: now,
            })
            .merge(follow_up);
        Ok((changes, next))
    }

    /// Mark a delivered job sent and queue its follow-up, atomically.
    pub async fn complete(&self, job: &ClaimedJob, now: DateTime<Utc>) -> Result<MessageJob, JobServiceError> {
        let (changes, next) = self.plan_complete(job, now)?;
        self.store.apply(changes).await?;
        Ok(next)
    }

    pub fn render_message(&self, job: &ClaimedJob) -> Result<String, JobServiceError> {
        Ok(job.render_message()?)
    }

    /// Operator action: put a job stuck in `Sending` back in the queue.
    ///
    /// Only for jobs known not to have been delivered; the worker never does
    /// this on its own.
    pub async fn requeue_stuck(&self, job_id: JobId, now: DateTime<Utc>) -> Result<(), JobServiceError> {
        self.store
            .apply(JobChangeSet::new(now).push(JobChange::Requeue { job_id }))
            .await?;
        info!(%job_id, "stuck job requeued by operator");
        Ok(())
    }
}
