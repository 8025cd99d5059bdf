//! Worker process settings.
//!
//! The binary fills these from flags/environment; everything else takes the
//! derived per-component configs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use cakeday_core::schedule::RetryPolicy;

use crate::notify::HttpSenderConfig;
use crate::workers::{JobWorkerConfig, ReconcilerConfig};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_IDLE_MS: u64 = 30_000;
pub const DEFAULT_EMAIL_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_EMAIL_SERVICE_URL: &str = "https://email-service.digitalenvision.com.au";
pub const DEFAULT_EMAIL_SERVICE_ENDPOINT: &str = "/send-email";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;
pub const DEFAULT_RECONCILE_GRACE_SECS: u64 = 15 * 60;
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 5 * 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is required")]
    Missing { name: &'static str },
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            name,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub database_url: String,
    pub batch_size: usize,
    pub idle_ms: u64,
    pub email_timeout_ms: u64,
    pub email_service_url: String,
    pub email_service_endpoint: String,
    pub max_attempts: u32,
    pub reconcile_grace_secs: u64,
    pub reconcile_interval_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            idle_ms: DEFAULT_IDLE_MS,
            email_timeout_ms: DEFAULT_EMAIL_TIMEOUT_MS,
            email_service_url: DEFAULT_EMAIL_SERVICE_URL.to_string(),
            email_service_endpoint: DEFAULT_EMAIL_SERVICE_ENDPOINT.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            reconcile_grace_secs: DEFAULT_RECONCILE_GRACE_SECS,
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
        }
    }
}

impl WorkerSettings {
    /// Reject settings the worker cannot run with. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::Missing { name: "DATABASE_URL" });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("WORKER_BATCH_SIZE", "must be greater than 0"));
        }
        if self.email_timeout_ms == 0 {
            return Err(ConfigError::invalid("EMAIL_TIMEOUT_MS", "must be greater than 0"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("WORKER_MAX_ATTEMPTS", "must be greater than 0"));
        }
        if self.reconcile_grace_secs == 0 {
            return Err(ConfigError::invalid("RECONCILE_GRACE_SECS", "must be greater than 0"));
        }
        if self.reconcile_interval_secs == 0 {
            return Err(ConfigError::invalid("RECONCILE_INTERVAL_SECS", "must be greater than 0"));
        }
        self.email_base_url()?;
        if !self.email_service_endpoint.starts_with('/') {
            return Err(ConfigError::invalid("EMAIL_SERVICE_ENDPOINT", "must start with '/'"));
        }
        Ok(())
    }

    fn email_base_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.email_service_url)
            .map_err(|e| ConfigError::invalid("EMAIL_SERVICE_URL", e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid("EMAIL_SERVICE_URL", "scheme must be http or https"));
        }
        Ok(url)
    }

    /// One connection per in-flight job plus headroom for the claim and the reconciler.
    pub fn pool_size(&self) -> u32 {
        u32::try_from(self.batch_size.saturating_add(2)).unwrap_or(u32::MAX)
    }

    pub fn worker_config(&self) -> JobWorkerConfig {
        JobWorkerConfig::default()
            .with_batch_size(self.batch_size)
            .with_idle_interval(Duration::from_millis(self.idle_ms))
    }

    pub fn sender_config(&self) -> Result<HttpSenderConfig, ConfigError> {
        Ok(HttpSenderConfig {
            base_url: self.email_base_url()?,
            path: self.email_service_endpoint.clone(),
            timeout: Duration::from_millis(self.email_timeout_ms),
        })
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            grace_period: Duration::from_secs(self.reconcile_grace_secs),
            interval: Duration::from_secs(self.reconcile_interval_secs),
            ..ReconcilerConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_attempts(self.max_attempts)
    }
}
