//! In-memory job store for tests/dev.
//!
//! One lock guards users and jobs together, so a claim or a change set is
//! atomic with respect to every other caller, including concurrent claimers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use cakeday_core::{ClaimedJob, JobId, JobKind, JobStatus, MessageJob, User, UserId};

use super::store::{JobChange, JobChangeSet, JobStats, JobStore, JobStoreError};

#[derive(Debug, Default)]
struct State {
    users: HashMap<UserId, User>,
    jobs: HashMap<JobId, MessageJob>,
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: RwLock<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Create or replace a user row (the profile service's job in production).
    pub async fn upsert_user(&self, user: User) {
        self.state.write().await.users.insert(user.id, user);
    }

    /// Delete a user and, like the foreign key cascade, all of their jobs.
    pub async fn remove_user(&self, user_id: UserId) -> bool {
        let mut state = self.state.write().await;
        state.jobs.retain(|_, job| job.user_id != user_id);
        state.users.remove(&user_id).is_some()
    }

    /// Snapshot of every job, oldest schedule first.
    pub async fn all_jobs(&self) -> Vec<MessageJob> {
        let state = self.state.read().await;
        let mut jobs: Vec<_> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| (j.scheduled_at_utc, j.id));
        jobs
    }
}

fn apply_change(
    jobs: &mut HashMap<JobId, MessageJob>,
    users: &HashMap<UserId, User>,
    change: &JobChange,
    at: DateTime<Utc>,
) -> Result<(), JobStoreError> {
    match change {
        JobChange::Insert(job) => {
            if !users.contains_key(&job.user_id) {
                return Err(JobStoreError::UserNotFound(job.user_id));
            }
            if jobs.contains_key(&job.id) {
                return Err(JobStoreError::Conflict(format!("job already exists: {}", job.id)));
            }
            if job.status.is_open() {
                ensure_no_open_job(jobs, job.user_id, &job.kind)?;
            }
            jobs.insert(job.id, job.clone());
        }
        JobChange::InsertUnlessOpen(job) => {
            let open_exists = jobs
                .values()
                .any(|j| j.user_id == job.user_id && j.kind == job.kind && j.status.is_open());
            if !open_exists {
                apply_change(jobs, users, &JobChange::Insert(job.clone()), at)?;
            }
        }
        JobChange::CancelOpen { user_id, kind } => {
            jobs.retain(|_, j| !(j.user_id == *user_id && &j.kind == kind && j.status.is_open()));
        }
        JobChange::CancelAllOpen { user_id } => {
            jobs.retain(|_, j| !(j.user_id == *user_id && j.status.is_open()));
        }
        JobChange::MarkSent { job_id, sent_at } => {
            let job = sending_job(jobs, *job_id, JobStatus::Sent)?;
            job.status = JobStatus::Sent;
            job.sent_at_utc = Some(*sent_at);
            job.attempts += 1;
            job.updated_at = at;
        }
        JobChange::MarkRetry {
            job_id,
            attempts,
            next_attempt_at,
            error,
        } => {
            let job = sending_job(jobs, *job_id, JobStatus::Retry)?;
            job.status = JobStatus::Retry;
            job.attempts = job.attempts.max(*attempts);
            job.next_attempt_at_utc = Some(*next_attempt_at);
            job.last_error = Some(error.clone());
            job.updated_at = at;
        }
        JobChange::MarkFailed { job_id, attempts, error } => {
            let job = sending_job(jobs, *job_id, JobStatus::Failed)?;
            job.status = JobStatus::Failed;
            job.attempts = job.attempts.max(*attempts);
            job.last_error = Some(error.clone());
            job.updated_at = at;
        }
        JobChange::Requeue { job_id } => {
            let (user_id, kind) = {
                let job = sending_job(jobs, *job_id, JobStatus::Retry)?;
                (job.user_id, job.kind.clone())
            };
            ensure_no_open_job(jobs, user_id, &kind)?;
            let job = sending_job(jobs, *job_id, JobStatus::Retry)?;
            job.status = JobStatus::Retry;
            job.next_attempt_at_utc = None;
            job.updated_at = at;
        }
    }
    Ok(())
}

fn ensure_no_open_job(
    jobs: &HashMap<JobId, MessageJob>,
    user_id: UserId,
    kind: &JobKind,
) -> Result<(), JobStoreError> {
    if jobs
        .values()
        .any(|j| j.user_id == user_id && &j.kind == kind && j.status.is_open())
    {
        return Err(JobStoreError::Conflict(format!(
            "user {user_id} already has an open {kind} job"
        )));
    }
    Ok(())
}

fn sending_job(
    jobs: &mut HashMap<JobId, MessageJob>,
    job_id: JobId,
    to: JobStatus,
) -> Result<&mut MessageJob, JobStoreError> {
    let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
    if job.status != JobStatus::Sending {
        return Err(JobStoreError::InvalidTransition {
            job_id,
            from: job.status,
            to,
        });
    }
    Ok(job)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn claim_due_jobs(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<ClaimedJob>, JobStoreError> {
        let mut state = self.state.write().await;
        let State { users, jobs } = &mut *state;

        let mut due: Vec<_> = jobs
            .values()
            .filter(|j| j.is_due(now) && users.contains_key(&j.user_id))
            .map(|j| (j.scheduled_at_utc, j.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, job_id) in due {
            let Some(job) = jobs.get_mut(&job_id) else {
                continue;
            };
            let Some(user) = users.get(&job.user_id) else {
                continue;
            };
            job.status = JobStatus::Sending;
            job.updated_at = now;
            claimed.push(ClaimedJob {
                job: job.clone(),
                user: user.clone(),
            });
        }

        Ok(claimed)
    }

    async fn apply(&self, changes: JobChangeSet) -> Result<(), JobStoreError> {
        let mut state = self.state.write().await;

        // Work on a copy so a failing change leaves nothing behind.
        let mut draft = state.jobs.clone();
        for change in &changes.changes {
            apply_change(&mut draft, &state.users, change, changes.at)?;
        }
        state.jobs = draft;
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<MessageJob>, JobStoreError> {
        Ok(self.state.read().await.jobs.get(&job_id).cloned())
    }

    async fn open_job_for(&self, user_id: UserId, kind: &JobKind) -> Result<Option<MessageJob>, JobStoreError> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .find(|j| j.user_id == user_id && &j.kind == kind && j.status.is_open())
            .cloned())
    }

    async fn jobs_for_user(&self, user_id: UserId) -> Result<Vec<MessageJob>, JobStoreError> {
        let state = self.state.read().await;
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.scheduled_at_utc, j.created_at));
        Ok(jobs)
    }

    async fn stuck_sending(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageJob>, JobStoreError> {
        let state = self.state.read().await;
        let mut stuck: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Sending && j.updated_at < updated_before)
            .cloned()
            .collect();
        stuck.sort_by_key(|j| j.updated_at);
        stuck.truncate(limit);
        Ok(stuck)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let state = self.state.read().await;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }

    async fn ping(&self) -> Result<(), JobStoreError> {
        Ok(())
    }
}
