//! Startup wiring and the run-until-shutdown lifecycle.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cakeday_infra::{
    HttpNotificationSender, JobService, JobStore, JobWorker, LogNotificationSender, NotificationSender,
    PostgresJobStore, Reconciler, WorkerSettings,
};

/// Connect, start the delivery worker and the reconciler, run until
/// `shutdown` resolves, then drain.
///
/// Fails only during startup (bad settings, database unreachable).
pub async fn run(
    settings: WorkerSettings,
    dry_run: bool,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    settings.validate().context("invalid configuration")?;

    let store = PostgresJobStore::connect(&settings.database_url, settings.pool_size())
        .await
        .context("failed to connect to database")?;
    store.ping().await.context("database unreachable")?;
    store.ensure_schema().await.context("failed to apply schema")?;
    let store = Arc::new(store);

    let sender: Arc<dyn NotificationSender> = if dry_run {
        warn!("dry run: messages are logged, not sent");
        Arc::new(LogNotificationSender)
    } else {
        let config = settings.sender_config()?;
        let sender = HttpNotificationSender::new(&config).context("failed to build email client")?;
        info!(endpoint = %sender.endpoint(), timeout_ms = settings.email_timeout_ms, "email service configured");
        Arc::new(sender)
    };

    let service = JobService::new(store.clone()).with_retry_policy(settings.retry_policy());
    let cancel = CancellationToken::new();

    let worker = JobWorker::new(service, sender, settings.worker_config()).spawn_with(cancel.child_token());
    let reconciler = Reconciler::new(store.clone(), settings.reconciler_config()).spawn(cancel.child_token());

    shutdown.await;
    info!("shutdown requested, draining in-flight work");
    cancel.cancel();

    let stats = worker.shutdown().await;
    if let Err(e) = reconciler.await {
        warn!(error = %e, "reconciler task ended abnormally");
    }
    store.pool().close().await;

    info!(
        claimed = stats.claimed,
        sent = stats.sent,
        retried = stats.retried,
        failed = stats.failed,
        needs_attention = stats.needs_attention,
        "worker stopped"
    );
    Ok(())
}
