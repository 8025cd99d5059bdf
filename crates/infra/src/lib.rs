//! Infrastructure layer: job storage, delivery, background loops, config.

pub mod config;
pub mod jobs;
pub mod notify;
pub mod workers;

pub use config::{ConfigError, WorkerSettings};
pub use jobs::{
    InMemoryJobStore, JobChange, JobChangeSet, JobService, JobServiceError, JobStats, JobStore,
    JobStoreError, PostgresJobStore, RetryDecision,
};
pub use notify::{
    HttpNotificationSender, HttpSenderConfig, LogNotificationSender, Notification, NotificationSender,
    SendError,
};
pub use workers::{
    Clock, JobOutcome, JobWorker, JobWorkerConfig, JobWorkerHandle, ManualClock, Reconciler,
    ReconcilerConfig, SystemClock, WorkerStats,
};
