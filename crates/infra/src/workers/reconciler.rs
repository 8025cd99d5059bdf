//! Reports jobs stuck in `SENDING`.
//!
//! A job stays in `SENDING` when a worker died mid-delivery or could not
//! record the outcome. Whether the message went out is unknown, so nothing
//! here re-sends: each stuck job is logged at error level for an operator,
//! who can `requeue_stuck` it once they know it was not delivered.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cakeday_core::MessageJob;

use super::{Clock, SystemClock};
use crate::jobs::{JobStore, JobStoreError};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How long a job may sit in `SENDING` before it is reported.
    pub grace_period: Duration,
    /// Time between sweeps.
    pub interval: Duration,
    /// Most jobs reported per sweep.
    pub limit: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(15 * 60),
            interval: Duration::from_secs(5 * 60),
            limit: 100,
        }
    }
}

pub struct Reconciler<S> {
    store: S,
    config: ReconcilerConfig,
    clock: Arc<dyn Clock>,
}

impl<S: JobStore + 'static> Reconciler<S> {
    pub fn new(store: S, config: ReconcilerConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Report every job that has been in `SENDING` longer than the grace period.
    pub async fn sweep(&self) -> Result<Vec<MessageJob>, JobStoreError> {
        let now = self.clock.now();
        let grace = chrono::Duration::from_std(self.config.grace_period).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(grace).unwrap_or(now);

        let stuck = self.store.stuck_sending(cutoff, self.config.limit).await?;
        for job in &stuck {
            error!(
                job_id = %job.id,
                user_id = %job.user_id,
                attempts = job.attempts,
                stuck_since = %job.updated_at,
                "job stuck in SENDING, delivery outcome unknown"
            );
        }
        if stuck.is_empty() {
            debug!("no stuck jobs");
        }
        Ok(stuck)
    }

    /// Sweep every `interval` until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                grace_secs = self.config.grace_period.as_secs(),
                interval_secs = self.config.interval.as_secs(),
                "reconciler started"
            );
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "reconciliation sweep failed");
                        }
                    }
                }
            }
            info!("reconciler stopped");
        })
    }
}
