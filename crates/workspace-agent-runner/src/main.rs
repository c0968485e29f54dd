//! `workspace-agent`: connects configured workspaces to their control
//! server and runs the commands and terminal sessions it requests.

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workspace_agent_runner::{AgentRunner, CONFIG_ENV, TOKEN_ENV, config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let path = config::config_path(std::env::args().nth(1), std::env::var(CONFIG_ENV).ok());
    let config = config::load(path, std::env::var(TOKEN_ENV).ok())
        .context("failed to load agent configuration")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => {
                tracing::info!("Shutdown requested");
                signal.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {e}"),
        }
    });

    AgentRunner::new(config, shutdown).run().await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
