//! `gamehost-daemon` -- compiles and stages builds for one game server instance.
//!
//! Configuration is read from the environment (see [`gamehost_daemon::config`]).
//! Runs until SIGINT or SIGTERM, then cancels running jobs and drains pending
//! build deletions before exiting.

use gamehost_daemon::{Daemon, DaemonConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "gamehost_daemon=debug,gamehost_jobs=debug,gamehost_deploy=debug,gamehost_events=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DaemonConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });
    tracing::info!(
        instance = %config.instance_name,
        root = %config.instance_root.display(),
        persistent = config.database_url.is_some(),
        "Starting gamehost-daemon",
    );

    let daemon = Daemon::start(config).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to start");
        std::process::exit(1);
    });

    shutdown_signal().await;
    daemon.shutdown().await;
    tracing::info!("Shutdown complete");
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT, starting graceful shutdown"),
        () = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
