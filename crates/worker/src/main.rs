use clap::Parser;

use cakeday_worker::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    cakeday_observability::init(cli.log_format);

    let settings = cli.settings();
    if let Err(e) = cakeday_worker::app::run(settings, cli.dry_run, shutdown_signal()).await {
        tracing::error!(error = %format!("{e:#}"), "worker failed to start");
        std::process::exit(1);
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
