use std::sync::Arc;
use std::time::Duration;

use cakeday_core::{JobKind, JobStatus, User, UserId};
use cakeday_infra::{
    Clock, HttpNotificationSender, HttpSenderConfig, InMemoryJobStore, JobService, JobStore, JobWorker,
    JobWorkerConfig, ManualClock,
};
use chrono::{DateTime, NaiveDate, Utc};
use url::Url;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn jakarta_user() -> User {
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

struct Harness {
    store: Arc<InMemoryJobStore>,
    clock: ManualClock,
    worker: JobWorker<Arc<InMemoryJobStore>, HttpNotificationSender>,
    user: User,
}

impl Harness {
    /// A user with a pending 2024 birthday job, a worker pointed at `server`,
    /// and the clock just past the scheduled instant.
    async fn new(server: &MockServer) -> Self {
        let store = InMemoryJobStore::arc();
        let user = jakarta_user();
        store.upsert_user(user.clone()).await;
        JobService::new(store.clone())
            .schedule_next(&user, utc("2024-05-01T00:00:00Z"))
            .await
            .unwrap();

        let sender = HttpNotificationSender::new(&HttpSenderConfig {
            base_url: Url::parse(&server.uri()).unwrap(),
            path: "/send-email".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();

        let clock = ManualClock::new(utc("2024-05-02T02:00:01Z"));
        let worker = JobWorker::new(
            JobService::new(store.clone()),
            sender,
            JobWorkerConfig::default().with_batch_size(1),
        )
        .with_clock(Arc::new(clock.clone()));

        Self {
            store,
            clock,
            worker,
            user,
        }
    }
}

#[tokio::test]
async fn scenario_a_schedules_nine_am_jakarta_same_day() {
    let store = InMemoryJobStore::arc();
    let user = jakarta_user();
    store.upsert_user(user.clone()).await;

    let job = JobService::new(store)
        .schedule_next(&user, utc("2024-05-01T00:00:00Z"))
        .await
        .unwrap();

    assert_eq!(job.scheduled_at_utc, utc("2024-05-02T02:00:00Z"));
}

#[tokio::test]
async fn scenario_b_schedules_next_year_after_local_nine() {
    let store = InMemoryJobStore::arc();
    let user = jakarta_user();
    store.upsert_user(user.clone()).await;

    let job = JobService::new(store)
        .schedule_next(&user, utc("2024-05-02T15:00:00Z"))
        .await
        .unwrap();

    assert_eq!(job.scheduled_at_utc, utc("2025-05-02T02:00:00Z"));
}

#[tokio::test]
async fn scenario_c_server_error_moves_job_to_retry() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/send-email"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    let h = Harness::new(&server).await;
    let now = h.clock.now();

    assert_eq!(h.worker.run_once().await.unwrap(), 1);

    let jobs = h.store.jobs_for_user(h.user.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.status, JobStatus::Retry);
    assert_eq!(job.attempts, 1);
    let next = job.next_attempt_at_utc.unwrap();
    assert!(next >= now + chrono::Duration::seconds(1));
    assert!(next <= now + chrono::Duration::milliseconds(1300));

    // Not eligible again until the back-off has elapsed.
    assert_eq!(h.worker.run_once().await.unwrap(), 0);
}

#[tokio::test]
async fn scenario_d_success_marks_sent_and_queues_next_year() {
    let server = MockServer::start().await;
    let h = Harness::new(&server).await;
    let job = h
        .store
        .open_job_for(h.user.id, &JobKind::Birthday)
        .await
        .unwrap()
        .unwrap();

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/send-email"))
        .and(matchers::header("Idempotency-Key", job.id.to_string().as_str()))
        .and(matchers::body_json(serde_json::json!({
            "email": "ada@example.com",
            "message": "Hey, Ada Lovelace it's your birthday"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    assert_eq!(h.worker.run_once().await.unwrap(), 1);

    let sent = h.store.get(job.id).await.unwrap().unwrap();
    assert_eq!(sent.status, JobStatus::Sent);
    assert!(sent.sent_at_utc.is_some());

    let jobs = h.store.jobs_for_user(h.user.id).await.unwrap();
    let pending: Vec<_> = jobs.iter().filter(|j| j.status == JobStatus::Pending).collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].scheduled_at_utc, utc("2025-05-02T02:00:00Z"));
}

#[tokio::test]
async fn scenario_e_concurrent_single_job_claims() {
    let store = InMemoryJobStore::arc();
    let user = jakarta_user();
    store.upsert_user(user.clone()).await;
    JobService::new(store.clone())
        .schedule_next(&user, utc("2024-05-01T00:00:00Z"))
        .await
        .unwrap();

    let now = utc("2024-05-02T02:00:01Z");
    let (a, b) = tokio::join!(store.claim_due_jobs(1, now), store.claim_due_jobs(1, now));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.len() + b.len(), 1);
}

#[tokio::test]
async fn permanent_rejection_fails_this_year_and_queues_next() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("mailbox does not exist"))
        .expect(1)
        .mount(&server)
        .await;
    let h = Harness::new(&server).await;

    h.worker.run_once().await.unwrap();

    let jobs = h.store.jobs_for_user(h.user.id).await.unwrap();
    assert_eq!(jobs.len(), 2);
    let failed: Vec<_> = jobs.iter().filter(|j| j.status == JobStatus::Failed).collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].last_error.as_deref().unwrap().contains("422"));

    let pending: Vec<_> = jobs.iter().filter(|j| j.status == JobStatus::Pending).collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].scheduled_at_utc, utc("2025-05-02T02:00:00Z"));
}

#[tokio::test]
async fn retry_then_success_counts_both_attempts() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let h = Harness::new(&server).await;

    h.worker.run_once().await.unwrap();
    h.clock.advance(chrono::Duration::seconds(2));
    assert_eq!(h.worker.run_once().await.unwrap(), 1);

    let jobs = h.store.jobs_for_user(h.user.id).await.unwrap();
    let sent = jobs.iter().find(|j| j.status == JobStatus::Sent).unwrap();
    assert_eq!(sent.attempts, 2);
    assert_eq!(h.worker.stats().retried, 1);
    assert_eq!(h.worker.stats().sent, 1);
}
