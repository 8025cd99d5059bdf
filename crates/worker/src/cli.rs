//! Command-line flags, each backed by an environment variable.

use clap::Parser;

use cakeday_infra::config::{
    DEFAULT_BATCH_SIZE, DEFAULT_EMAIL_SERVICE_ENDPOINT, DEFAULT_EMAIL_SERVICE_URL,
    DEFAULT_EMAIL_TIMEOUT_MS, DEFAULT_IDLE_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_RECONCILE_GRACE_SECS,
    DEFAULT_RECONCILE_INTERVAL_SECS,
};
use cakeday_infra::WorkerSettings;
use cakeday_observability::LogFormat;

/// Delivers scheduled birthday messages.
///
/// Any number of instances may run against the same database; each due job
/// is claimed by exactly one of them.
#[derive(Debug, Parser)]
#[command(name = "cakeday-worker", version, about)]
pub struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    /// Jobs claimed per poll cycle
    #[arg(long, env = "WORKER_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Sleep after an empty cycle, in milliseconds
    #[arg(long, env = "WORKER_IDLE_MS", default_value_t = DEFAULT_IDLE_MS)]
    pub idle_ms: u64,

    /// Hard timeout for one email request, in milliseconds
    #[arg(long, env = "EMAIL_TIMEOUT_MS", default_value_t = DEFAULT_EMAIL_TIMEOUT_MS)]
    pub email_timeout_ms: u64,

    /// Email service base URL
    #[arg(long, env = "EMAIL_SERVICE_URL", default_value = DEFAULT_EMAIL_SERVICE_URL)]
    pub email_service_url: String,

    /// Email service path, appended to the base URL
    #[arg(long, env = "EMAIL_SERVICE_ENDPOINT", default_value = DEFAULT_EMAIL_SERVICE_ENDPOINT)]
    pub email_service_endpoint: String,

    /// Attempts after which a transiently failing job is marked failed
    #[arg(long, env = "WORKER_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Seconds a job may stay in SENDING before it is reported
    #[arg(long, env = "RECONCILE_GRACE_SECS", default_value_t = DEFAULT_RECONCILE_GRACE_SECS)]
    pub reconcile_grace_secs: u64,

    /// Seconds between stuck-job sweeps
    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value_t = DEFAULT_RECONCILE_INTERVAL_SECS)]
    pub reconcile_interval_secs: u64,

    /// Log output: json or pretty
    #[arg(long, env = "LOG_FORMAT", default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Log messages instead of calling the email service
    #[arg(long, env = "WORKER_DRY_RUN")]
    pub dry_run: bool,
}

impl Cli {
    pub fn settings(&self) -> WorkerSettings {
        WorkerSettings {
            database_url: self.database_url.clone(),
            batch_size: self.batch_size,
            idle_ms: self.idle_ms,
            email_timeout_ms: self.email_timeout_ms,
            email_service_url: self.email_service_url.clone(),
            email_service_endpoint: self.email_service_endpoint.clone(),
            max_attempts: self.max_attempts,
            reconcile_grace_secs: self.reconcile_grace_secs,
            reconcile_interval_secs: self.reconcile_interval_secs,
        }
    }
}
