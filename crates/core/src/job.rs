//! Message jobs and the occasions they deliver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, UserId};
use crate::user::User;

/// Delivery state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for its scheduled instant.
    Pending,
    /// Claimed by a worker; a delivery attempt is in flight (or its
    /// bookkeeping failed and it needs an operator).
    Sending,
    /// Delivered.
    Sent,
    /// A transient failure happened; eligible again after `next_attempt_at_utc`.
    Retry,
    /// Permanently failed; never retried automatically.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Sending,
        JobStatus::Sent,
        JobStatus::Retry,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Sending => "SENDING",
            JobStatus::Sent => "SENT",
            JobStatus::Retry => "RETRY",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> DomainResult<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str() == value)
            .ok_or_else(|| DomainError::invalid_input(format!("unknown job status {value}")))
    }

    /// Open jobs are the ones a claim may pick up and a reschedule replaces.
    pub fn is_open(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retry)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Sent | JobStatus::Failed)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job delivers.
///
/// Stored as text; kinds written by a newer build load as `Unrecognized`
/// so they can be failed cleanly instead of breaking the claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    Birthday,
    Unrecognized(String),
}

impl JobKind {
    pub fn as_str(&self) -> &str {
        match self {
            JobKind::Birthday => "BIRTHDAY",
            JobKind::Unrecognized(kind) => kind,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "BIRTHDAY" => JobKind::Birthday,
            other => JobKind::Unrecognized(other.to_string()),
        }
    }

    /// Scheduling and rendering rules for this kind.
    pub fn occasion(&self) -> DomainResult<&'static dyn Occasion> {
        match self {
            JobKind::Birthday => Ok(&Birthday),
            JobKind::Unrecognized(kind) => Err(DomainError::unsupported_kind(kind.clone())),
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recurring occasion: when it next happens for a user and what to say.
pub trait Occasion: Send + Sync {
    fn name(&self) -> &'static str;

    /// First occurrence strictly after `now`.
    fn next_occurrence(&self, user: &User, now: DateTime<Utc>) -> DomainResult<DateTime<Utc>>;

    fn render_message(&self, user: &User) -> String;
}

/// Yearly birthday greeting at 09:00 local time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Birthday;

impl Occasion for Birthday {
    fn name(&self) -> &'static str {
        "birthday"
    }

    fn next_occurrence(&self, user: &User, now: DateTime<Utc>) -> DomainResult<DateTime<Utc>> {
        user.next_birthday_utc(now)
    }

    fn render_message(&self, user: &User) -> String {
        format!("Hey, {} it's your birthday", user.full_name())
    }
}

/// A scheduled notification attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageJob {
    pub id: JobId,
    pub user_id: UserId,
    pub kind: JobKind,
    /// When the message becomes eligible. Never changes after creation.
    pub scheduled_at_utc: DateTime<Utc>,
    pub status: JobStatus,
    /// Delivery attempts made so far.
    pub attempts: u32,
    /// A `Retry` job must not be reclaimed before this instant.
    pub next_attempt_at_utc: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub sent_at_utc: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageJob {
    /// New `Pending` job.
    pub fn pending(user_id: UserId, kind: JobKind, scheduled_at_utc: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            user_id,
            kind,
            scheduled_at_utc,
            status: JobStatus::Pending,
            attempts: 0,
            next_attempt_at_utc: None,
            last_error: None,
            sent_at_utc: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// New `Pending` job for the user's next occurrence of `kind`.
    pub fn next_for(user: &User, kind: JobKind, now: DateTime<Utc>) -> DomainResult<Self> {
        let scheduled_at = kind.occasion()?.next_occurrence(user, now)?;
        Ok(Self::pending(user.id, kind, scheduled_at, now))
    }

    /// Whether a claim at `now` may pick this job up.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open()
            && self.scheduled_at_utc <= now
            && self.next_attempt_at_utc.is_none_or(|at| at <= now)
    }
}

/// A job handed to a worker by a claim, with its owner joined in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub job: MessageJob,
    pub user: User,
}

impl ClaimedJob {
    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn render_message(&self) -> DomainResult<String> {
        Ok(self.job.kind.occasion()?.render_message(&self.user))
    }

    /// Next occurrence after the one this job delivered.
    ///
    /// Anchored at the later of `now` and the job's own schedule so a job
    /// sent early (clock skew) never reschedules the same occurrence.
    pub fn follow_up(&self, now: DateTime<Utc>) -> DomainResult<MessageJob> {
        let anchor = now.max(self.job.scheduled_at_utc);
        let scheduled_at = self.job.kind.occasion()?.next_occurrence(&self.user, anchor)?;
        Ok(MessageJob::pending(self.user.id, self.job.kind.clone(), scheduled_at, now))
    }
}
