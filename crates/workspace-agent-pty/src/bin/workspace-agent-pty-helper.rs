//! Terminal helper process for the workspace agent.
//!
//! Speaks the line-delimited JSON terminal protocol on stdin/stdout.
//! Diagnostics go to stderr so they never corrupt the protocol stream.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    workspace_agent_pty::host::serve_stdio()
}
