//! Job storage abstraction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cakeday_core::{ClaimedJob, JobId, JobKind, JobStatus, MessageJob, UserId};

/// Durable home of message jobs.
///
/// Implementations must make `claim_due_jobs` and `apply` atomic: a claimed
/// job is handed to exactly one caller, and a change set lands entirely or
/// not at all.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Claim up to `limit` due jobs, moving them to `Sending`.
    ///
    /// Due means open (`Pending`/`Retry`), `scheduled_at_utc <= now` and no
    /// back-off pending. Rows another claimer holds are skipped, not waited
    /// on. The result is ordered by `scheduled_at_utc` ascending.
    async fn claim_due_jobs(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<ClaimedJob>, JobStoreError>;

    /// Apply every change in `changes` atomically.
    async fn apply(&self, changes: JobChangeSet) -> Result<(), JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<MessageJob>, JobStoreError>;

    /// The open job for (user, kind), if any.
    async fn open_job_for(&self, user_id: UserId, kind: &JobKind) -> Result<Option<MessageJob>, JobStoreError>;

    /// All jobs of a user, oldest schedule first.
    async fn jobs_for_user(&self, user_id: UserId) -> Result<Vec<MessageJob>, JobStoreError>;

    /// Jobs in `Sending` whose last update is before `updated_before`.
    async fn stuck_sending(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageJob>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// Cheap reachability check used at startup.
    async fn ping(&self) -> Result<(), JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("user not found: {0}")]
    UserNotFound(UserId),
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    /// Lost a race with a concurrent writer (serialization failure, open-job
    /// uniqueness). Safe to try again later.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub sending: usize,
    pub sent: usize,
    pub retry: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Sending => self.sending += count,
            JobStatus::Sent => self.sent += count,
            JobStatus::Retry => self.retry += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn open(&self) -> usize {
        self.pending + self.retry
    }
}

/// One mutation inside a [`JobChangeSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobChange {
    /// Insert a new job row.
    Insert(MessageJob),
    /// Insert a job unless the user already has an open job of that kind.
    /// Used for follow-ups, which must not fight a concurrent reschedule.
    InsertUnlessOpen(MessageJob),
    /// Delete the open (`Pending`/`Retry`) jobs of one kind for a user.
    CancelOpen { user_id: UserId, kind: JobKind },
    /// Delete every open job of a user.
    CancelAllOpen { user_id: UserId },
    /// `Sending → Sent`, stamping `sent_at_utc` and counting the attempt.
    MarkSent { job_id: JobId, sent_at: DateTime<Utc> },
    /// `Sending → Retry` with an explicit attempt count and back-off.
    MarkRetry {
        job_id: JobId,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    /// `Sending → Failed`, terminal.
    MarkFailed {
        job_id: JobId,
        attempts: u32,
        error: String,
    },
    /// `Sending → Retry` with no back-off. Operator action only.
    Requeue { job_id: JobId },
}

impl JobChange {
    /// Status a guarded transition moves to, if this change is one.
    pub fn target_status(&self) -> Option<JobStatus> {
        match self {
            JobChange::MarkSent { .. } => Some(JobStatus::Sent),
            JobChange::MarkRetry { .. } | JobChange::Requeue { .. } => Some(JobStatus::Retry),
            JobChange::MarkFailed { .. } => Some(JobStatus::Failed),
            JobChange::Insert(_)
            | JobChange::InsertUnlessOpen(_)
            | JobChange::CancelOpen { .. }
            | JobChange::CancelAllOpen { .. } => None,
        }
    }
}

/// Ordered list of job mutations applied as one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobChangeSet {
    /// Timestamp written to `updated_at` of every touched row.
    pub at: DateTime<Utc>,
    pub changes: Vec<JobChange>,
}

impl JobChangeSet {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            at,
            changes: Vec::new(),
        }
    }

    pub fn push(mut self, change: JobChange) -> Self {
        self.changes.push(change);
        self
    }

    /// Append another change set; the earlier timestamp is kept.
    pub fn merge(mut self, other: JobChangeSet) -> Self {
        self.at = self.at.min(other.at);
        self.changes.extend(other.changes);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn claim_due_jobs(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<ClaimedJob>, JobStoreError> {
        (**self).claim_due_jobs(limit, now).await
    }

    async fn apply(&self, changes: JobChangeSet) -> Result<(), JobStoreError> {
        (**self).apply(changes).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<MessageJob>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn open_job_for(&self, user_id: UserId, kind: &JobKind) -> Result<Option<MessageJob>, JobStoreError> {
        (**self).open_job_for(user_id, kind).await
    }

    async fn jobs_for_user(&self, user_id: UserId) -> Result<Vec<MessageJob>, JobStoreError> {
        (**self).jobs_for_user(user_id).await
    }

    async fn stuck_sending(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageJob>, JobStoreError> {
        (**self).stuck_sending(updated_before, limit).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }

    async fn ping(&self) -> Result<(), JobStoreError> {
        (**self).ping().await
    }
}
