//! Delivery worker: claim due jobs, send, settle.
//!
//! One poll cycle at a time per worker. Within a cycle the claimed batch is
//! processed concurrently, bounded by the batch size. Stopping never aborts
//! an in-flight send or write; it takes effect at the next idle sleep or
//! cycle boundary.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cakeday_core::{ClaimedJob, JobId, MessageJob};

use super::{Clock, SystemClock};
use crate::jobs::{JobService, JobServiceError, JobStore, JobStoreError, RetryDecision};
use crate::notify::{Notification, NotificationSender, SendError};

#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Jobs claimed per cycle; also the concurrency limit within a cycle.
    pub batch_size: usize,
    /// Sleep after a cycle that claimed nothing.
    pub idle_interval: Duration,
    /// Minimum sleep after a failed claim, whatever `idle_interval` is.
    pub error_backoff: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            idle_interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(1),
            name: "job-worker".to_string(),
        }
    }
}

impl JobWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }

    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }
}

/// Result of processing one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Delivered; marked `Sent` and the follow-up queued.
    Sent,
    /// Transient failure; back in `Retry`.
    Retrying {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Terminal for this occurrence: permanent rejection, attempt ceiling,
    /// or unrenderable job. Only the last leaves no follow-up.
    Failed { reason: String },
    /// Bookkeeping failed; the job stays in `Sending` until an operator looks.
    NeedsAttention(String),
}

/// Failures that leave a job in `Sending`.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The message went out but recording it failed. Never re-sent.
    #[error("delivered but not recorded: {0}")]
    PostSend(#[source] JobServiceError),
    /// Delivery failed and recording the failure failed too.
    #[error("delivery failed ({cause}) and recording it failed: {source}")]
    Bookkeeping {
        cause: String,
        #[source]
        source: JobServiceError,
    },
}

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    claimed: AtomicU64,
    sent: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    needs_attention: AtomicU64,
    claim_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            needs_attention: self.needs_attention.load(Ordering::Relaxed),
            claim_errors: self.claim_errors.load(Ordering::Relaxed),
        }
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub cycles: u64,
    pub claimed: u64,
    pub sent: u64,
    pub retried: u64,
    pub failed: u64,
    pub needs_attention: u64,
    pub claim_errors: u64,
}

pub struct JobWorker<S, N> {
    service: JobService<S>,
    sender: N,
    config: JobWorkerConfig,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
}

impl<S, N> JobWorker<S, N>
where
    S: JobStore + 'static,
    N: NotificationSender + 'static,
{
    pub fn new(service: JobService<S>, sender: N, config: JobWorkerConfig) -> Self {
        Self {
            service,
            sender,
            config,
            clock: Arc::new(SystemClock),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &JobWorkerConfig {
        &self.config
    }

    pub fn service(&self) -> &JobService<S> {
        &self.service
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// One poll cycle: claim up to `batch_size` due jobs and process them.
    ///
    /// Returns the number of jobs claimed. Per-job failures are settled and
    /// logged here; only a failed claim is returned as an error.
    pub async fn run_once(&self) -> Result<usize, JobStoreError> {
        let now = self.clock.now();
        let batch = self
            .service
            .store()
            .claim_due_jobs(self.config.batch_size, now)
            .await?;

        if batch.is_empty() {
            debug!(worker = %self.config.name, "no due jobs");
            return Ok(0);
        }

        let claimed = batch.len();
        Counters::bump(&self.counters.claimed, claimed as u64);
        debug!(worker = %self.config.name, claimed, "claimed due jobs");

        // The claim limit already bounds the batch, and so the fan-out.
        futures::future::join_all(batch.into_iter().map(|job| self.process_job(job))).await;

        Ok(claimed)
    }

    /// Deliver one claimed job and record the result.
    pub async fn process_job(&self, claimed: ClaimedJob) -> JobOutcome {
        let job_id = claimed.id();
        let user_id = claimed.user.id;
        let attempts_so_far = claimed.job.attempts;

        let message = match self.service.render_message(&claimed) {
            Ok(message) => message,
            Err(e) => {
                let reason = format!("cannot render message: {e}");
                let recorded = self
                    .service
                    .mark_failed(job_id, attempts_so_far, &reason, self.clock.now())
                    .await
                    .map(|()| None);
                return self.settle_failed(job_id, attempts_so_far, reason, recorded);
            }
        };

        let notification = Notification {
            recipient: claimed.user.email.clone(),
            message,
            idempotency_key: job_id.to_string(),
        };

        match self.sender.send(&notification).await {
            Ok(()) => match self.service.complete(&claimed, self.clock.now()).await {
                Ok(next) => {
                    Counters::bump(&self.counters.sent, 1);
                    info!(
                        %job_id,
                        %user_id,
                        next_job_id = %next.id,
                        next_scheduled_at = %next.scheduled_at_utc,
                        "message sent"
                    );
                    JobOutcome::Sent
                }
                Err(e) => self.needs_attention(job_id, ProcessError::PostSend(e)),
            },
            Err(SendError::Permanent { status, body }) => {
                let reason = format!("rejected with status {status}: {body}");
                let recorded = self.service.fail(&claimed, &reason, self.clock.now()).await.map(Some);
                self.settle_failed(job_id, attempts_so_far, reason, recorded)
            }
            Err(SendError::Transient(reason)) => {
                let now = self.clock.now();
                match self.service.mark_retry(&claimed, &reason, now).await {
                    Ok(RetryDecision::Scheduled { attempts, next_attempt_at }) => {
                        Counters::bump(&self.counters.retried, 1);
                        warn!(%job_id, %user_id, attempts, %next_attempt_at, error = %reason, "send failed, will retry");
                        JobOutcome::Retrying { attempts, next_attempt_at }
                    }
                    Ok(RetryDecision::Exhausted { attempts }) => {
                        Counters::bump(&self.counters.failed, 1);
                        error!(%job_id, %user_id, attempts, error = %reason, "send failed, attempts exhausted");
                        JobOutcome::Failed { reason }
                    }
                    Err(e) => self.needs_attention(job_id, ProcessError::Bookkeeping { cause: reason, source: e }),
                }
            }
        }
    }

    fn settle_failed(
        &self,
        job_id: JobId,
        attempts_so_far: u32,
        reason: String,
        recorded: Result<Option<MessageJob>, JobServiceError>,
    ) -> JobOutcome {
        match recorded {
            Ok(next) => {
                Counters::bump(&self.counters.failed, 1);
                error!(
                    %job_id,
                    attempts = attempts_so_far + 1,
                    next_job_id = ?next.as_ref().map(|n| n.id),
                    error = %reason,
                    "occurrence failed"
                );
                JobOutcome::Failed { reason }
            }
            Err(e) => self.needs_attention(job_id, ProcessError::Bookkeeping { cause: reason, source: e }),
        }
    }

    fn needs_attention(&self, job_id: JobId, err: ProcessError) -> JobOutcome {
        Counters::bump(&self.counters.needs_attention, 1);
        error!(%job_id, error = %err, "job left in SENDING, needs operator attention");
        JobOutcome::NeedsAttention(err.to_string())
    }

    /// Poll until `cancel` fires. Empty cycles sleep `idle_interval`, failed
    /// claims at least `error_backoff`; either sleep is cut short by
    /// cancellation.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            worker = %self.config.name,
            batch_size = self.config.batch_size,
            idle_ms = self.config.idle_interval.as_millis() as u64,
            "job worker started"
        );

        while !cancel.is_cancelled() {
            let pause = match self.run_once().await {
                Ok(0) => Some(self.config.idle_interval),
                Ok(_) => None,
                Err(e) => {
                    Counters::bump(&self.counters.claim_errors, 1);
                    warn!(worker = %self.config.name, error = %e, "claim failed");
                    Some(self.config.idle_interval.max(self.config.error_backoff))
                }
            };
            Counters::bump(&self.counters.cycles, 1);

            if let Some(pause) = pause {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!(worker = %self.config.name, "job worker stopped");
    }

    /// Run on a tokio task with its own cancellation token.
    pub fn spawn(self) -> JobWorkerHandle {
        self.spawn_with(CancellationToken::new())
    }

    /// Run on a tokio task, stopping when `cancel` (or the handle) fires.
    pub fn spawn_with(self, cancel: CancellationToken) -> JobWorkerHandle {
        let counters = self.counters.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move { self.run(token).await });

        JobWorkerHandle { cancel, join, counters }
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct JobWorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl JobWorkerHandle {
    /// Ask the worker to exit after its current iteration.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait for the in-flight iteration to finish. Returns the
    /// final counters.
    pub async fn shutdown(self) -> WorkerStats {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "job worker task ended abnormally");
        }
        self.counters.snapshot()
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobStore, JobChangeSet, JobStats};
    use crate::workers::ManualClock;
    use async_trait::async_trait;
    use cakeday_core::schedule::RetryPolicy;
    use cakeday_core::{JobKind, JobStatus, User, UserId};
    use chrono::NaiveDate;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn user() -> User {
        User::new(
            UserId::new(),
            "Ada",
            "Lovelace",
            "ada@example.com",
            "1990-05-02",
            "Asia/Jakarta",
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        )
        .unwrap()
    }

    /// Replies from a script, then succeeds.
    #[derive(Default)]
    struct ScriptedSender {
        replies: Mutex<VecDeque<Result<(), SendError>>>,
        sent: Mutex<Vec<Notification>>,
    }

    impl ScriptedSender {
        fn with(replies: Vec<Result<(), SendError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                sent: Mutex::default(),
            })
        }

        fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationSender for ScriptedSender {
        async fn send(&self, notification: &Notification) -> Result<(), SendError> {
            self.sent.lock().unwrap().push(notification.clone());
            self.replies.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    /// Delegates to the in-memory store; `apply` fails while `broken` is set,
    /// claims while `claims_down` is.
    struct BrokenWrites {
        inner: Arc<InMemoryJobStore>,
        broken: AtomicBool,
        claims_down: AtomicBool,
    }

    #[async_trait]
    impl JobStore for BrokenWrites {
        async fn claim_due_jobs(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<ClaimedJob>, JobStoreError> {
            if self.claims_down.load(Ordering::SeqCst) {
                return Err(JobStoreError::Unavailable("connection refused".into()));
            }
            self.inner.claim_due_jobs(limit, now).await
        }
        async fn apply(&self, changes: JobChangeSet) -> Result<(), JobStoreError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(JobStoreError::Unavailable("connection reset".into()));
            }
            self.inner.apply(changes).await
        }
        async fn get(&self, job_id: JobId) -> Result<Option<MessageJob>, JobStoreError> {
            self.inner.get(job_id).await
        }
        async fn open_job_for(&self, user_id: UserId, kind: &JobKind) -> Result<Option<MessageJob>, JobStoreError> {
            self.inner.open_job_for(user_id, kind).await
        }
        async fn jobs_for_user(&self, user_id: UserId) -> Result<Vec<MessageJob>, JobStoreError> {
            self.inner.jobs_for_user(user_id).await
        }
        async fn stuck_sending(&self, updated_before: DateTime<Utc>, limit: usize) -> Result<Vec<MessageJob>, JobStoreError> {
            self.inner.stuck_sending(updated_before, limit).await
        }
        async fn stats(&self) -> Result<JobStats, JobStoreError> {
            self.inner.stats().await
        }
        async fn ping(&self) -> Result<(), JobStoreError> {
            Ok(())
        }
    }

    async fn seeded() -> (Arc<InMemoryJobStore>, User, MessageJob) {
        let store = InMemoryJobStore::arc();
        let user = user();
        store.upsert_user(user.clone()).await;
        let job = JobService::new(store.clone())
            .schedule_next(&user, utc("2024-05-01T00:00:00Z"))
            .await
            .unwrap();
        (store, user, job)
    }

    fn worker<S: JobStore + 'static>(
        store: S,
        sender: Arc<ScriptedSender>,
        at: &str,
    ) -> JobWorker<S, Arc<ScriptedSender>> {
        JobWorker::new(JobService::new(store), sender, JobWorkerConfig::default())
            .with_clock(Arc::new(ManualClock::new(utc(at))))
    }

    #[tokio::test]
    async fn delivers_with_job_id_as_idempotency_key() {
        let (store, user, job) = seeded().await;
        let sender = ScriptedSender::with(vec![]);
        let worker = worker(store.clone(), sender.clone(), "2024-05-02T02:00:00Z");

        assert_eq!(worker.run_once().await.unwrap(), 1);

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, user.email);
        assert_eq!(sent[0].idempotency_key, job.id.to_string());
        assert_eq!(sent[0].message, "Hey, Ada Lovelace it's your birthday");
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Sent);
        assert_eq!(worker.stats().sent, 1);
    }

    #[tokio::test]
    async fn nothing_due_before_schedule() {
        let (store, _, _) = seeded().await;
        let sender = ScriptedSender::with(vec![]);
        let worker = worker(store, sender.clone(), "2024-05-02T01:59:59Z");

        assert_eq!(worker.run_once().await.unwrap(), 0);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn permanent_rejection_fails_the_job() {
        let (store, _, job) = seeded().await;
        let sender = ScriptedSender::with(vec![Err(SendError::Permanent {
            status: 400,
            body: "bad address".into(),
        })]);
        let worker = worker(store.clone(), sender, "2024-05-02T02:00:00Z");

        worker.run_once().await.unwrap();

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 1);
        let next = store
            .open_job_for(stored.user_id, &JobKind::Birthday)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.status, JobStatus::Pending);
        assert_eq!(next.scheduled_at_utc, utc("2025-05-02T02:00:00Z"));
    }

    #[tokio::test]
    async fn exhausted_retries_still_queue_next_year() {
        let (store, user, job) = seeded().await;
        let sender = ScriptedSender::with(vec![Err(SendError::Transient("HTTP 503".into()))]);
        let service = JobService::new(store.clone()).with_retry_policy(RetryPolicy::default().with_max_attempts(1));
        let worker = JobWorker::new(service, sender, JobWorkerConfig::default())
            .with_clock(Arc::new(ManualClock::new(utc("2024-05-02T02:00:00Z"))));

        worker.run_once().await.unwrap();

        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Failed);
        let jobs = store.jobs_for_user(user.id).await.unwrap();
        assert_eq!(jobs.len(), 2);
        let next = store.open_job_for(user.id, &JobKind::Birthday).await.unwrap().unwrap();
        assert_eq!(next.scheduled_at_utc, utc("2025-05-02T02:00:00Z"));
        assert_eq!(worker.stats().failed, 1);
    }

    #[tokio::test]
    async fn transient_failure_retries() {
        let (store, _, _) = seeded().await;
        let sender = ScriptedSender::with(vec![Err(SendError::Transient("HTTP 503".into()))]);
        let worker = worker(store.clone(), sender, "2024-05-02T02:00:00Z");

        let claimed = store.claim_due_jobs(1, utc("2024-05-02T02:00:00Z")).await.unwrap().remove(0);
        let outcome = worker.process_job(claimed).await;
        assert!(matches!(outcome, JobOutcome::Retrying { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn unknown_kind_fails_without_sending() {
        let store = InMemoryJobStore::arc();
        let user = user();
        store.upsert_user(user.clone()).await;
        let job = MessageJob::pending(
            user.id,
            JobKind::Unrecognized("ANNIVERSARY".into()),
            utc("2024-05-02T00:00:00Z"),
            utc("2024-05-01T00:00:00Z"),
        );
        store
            .apply(JobChangeSet::new(job.created_at).push(crate::jobs::JobChange::Insert(job.clone())))
            .await
            .unwrap();
        let sender = ScriptedSender::with(vec![]);
        let worker = worker(store.clone(), sender.clone(), "2024-05-02T02:00:00Z");

        worker.run_once().await.unwrap();

        assert!(sender.sent().is_empty());
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Failed);
        assert_eq!(store.jobs_for_user(user.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_bookkeeping_after_send_is_never_resent() {
        let (inner, _, job) = seeded().await;
        let store = Arc::new(BrokenWrites {
            inner: inner.clone(),
            broken: AtomicBool::new(true),
            claims_down: AtomicBool::new(false),
        });
        let sender = ScriptedSender::with(vec![]);
        let worker = worker(store.clone(), sender.clone(), "2024-05-02T02:00:00Z");

        let claimed = store.claim_due_jobs(1, utc("2024-05-02T02:00:00Z")).await.unwrap().remove(0);
        let outcome = worker.process_job(claimed).await;
        assert!(matches!(outcome, JobOutcome::NeedsAttention(ref msg) if msg.starts_with("delivered but not recorded")));

        // Still SENDING, so later cycles leave it alone.
        store.broken.store(false, Ordering::SeqCst);
        assert_eq!(worker.run_once().await.unwrap(), 0);
        assert_eq!(sender.sent().len(), 1);
        assert_eq!(inner.get(job.id).await.unwrap().unwrap().status, JobStatus::Sending);
        assert_eq!(worker.stats().needs_attention, 1);
    }

    #[tokio::test]
    async fn shutdown_interrupts_idle_sleep() {
        let store = InMemoryJobStore::arc();
        let worker = JobWorker::new(
            JobService::new(store),
            ScriptedSender::with(vec![]),
            JobWorkerConfig::default().with_idle_interval(Duration::from_secs(3600)),
        );

        let handle = worker.spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("worker did not stop");
    }

    #[tokio::test]
    async fn failed_claims_back_off_even_with_zero_idle() {
        let store = Arc::new(BrokenWrites {
            inner: InMemoryJobStore::arc(),
            broken: AtomicBool::new(false),
            claims_down: AtomicBool::new(true),
        });
        let worker = JobWorker::new(
            JobService::new(store),
            ScriptedSender::with(vec![]),
            JobWorkerConfig::default()
                .with_idle_interval(Duration::ZERO)
                .with_error_backoff(Duration::from_millis(50)),
        );

        let handle = worker.spawn();
        tokio::time::sleep(Duration::from_millis(120)).await;
        let stats = handle.shutdown().await;

        assert!(stats.claim_errors >= 1);
        assert!(stats.claim_errors <= 5, "spun {} times", stats.claim_errors);
    }

    #[tokio::test]
    async fn stop_is_observed_through_shared_token() {
        let store = InMemoryJobStore::arc();
        let worker = JobWorker::new(
            JobService::new(store),
            ScriptedSender::with(vec![]),
            JobWorkerConfig::default().with_idle_interval(Duration::from_millis(5)),
        );
        let token = CancellationToken::new();
        let handle = worker.spawn_with(token.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker did not observe cancellation");
        assert!(handle.stats().cycles >= 1);
    }
}
