//! Composition root: one connection manager per configured identity.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use workspace_agent_core::{AgentConfig, AgentIdentity, AgentSettings, EventBus};
use workspace_agent_executor::CommandDispatcher;
use workspace_agent_pty::{HelperLaunch, TerminalController};
use workspace_agent_transport::{ConnectionManager, configured_shell};

/// Everything one identity owns. Identities share nothing.
pub struct AgentHandle {
    pub manager: Arc<ConnectionManager>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub terminal: Arc<TerminalController>,
}

impl AgentHandle {
    /// Wire up the components for `identity`. Cancelling `shutdown` also
    /// kills any command this identity is running.
    #[must_use]
    pub fn build(identity: AgentIdentity, settings: &AgentSettings, shutdown: &CancellationToken) -> Self {
        let bus = EventBus::new();
        let dispatcher = Arc::new(
            CommandDispatcher::new(&identity.working_dir, configured_shell(&identity))
                .with_timeout(settings.command_timeout())
                .with_shutdown(shutdown.clone()),
        );
        let terminal = Arc::new(TerminalController::new(
            helper_launch(settings),
            settings.history_capacity,
            bus.clone(),
        ));
        let manager = Arc::new(ConnectionManager::new(
            identity,
            settings.clone(),
            bus,
            Arc::clone(&dispatcher),
            Arc::clone(&terminal),
        ));
        Self {
            manager,
            dispatcher,
            terminal,
        }
    }
}

fn helper_launch(settings: &AgentSettings) -> HelperLaunch {
    settings.pty_helper_program.as_ref().map_or_else(HelperLaunch::locate, |program| {
        HelperLaunch::new(program).args(settings.pty_helper_args.iter().cloned())
    })
}

/// Runs every configured identity until shutdown.
pub struct AgentRunner {
    agents: Vec<AgentHandle>,
    shutdown: CancellationToken,
}

impl AgentRunner {
    #[must_use]
    pub fn new(config: AgentConfig, shutdown: CancellationToken) -> Self {
        let agents = config
            .agents
            .into_iter()
            .map(|identity| AgentHandle::build(identity, &config.settings, &shutdown))
            .collect();
        Self { agents, shutdown }
    }

    #[must_use]
    pub fn agents(&self) -> &[AgentHandle] {
        &self.agents
    }

    /// Run all identities concurrently. Returns once `shutdown` has been
    /// cancelled and every identity has wound down.
    pub async fn run(self) {
        let mut connections = JoinSet::new();
        for agent in &self.agents {
            let manager = Arc::clone(&agent.manager);
            let shutdown = self.shutdown.child_token();
            connections.spawn(async move { manager.run(shutdown).await });
        }
        tracing::info!(agents = self.agents.len(), "Agent running");

        while let Some(result) = connections.join_next().await {
            if let Err(e) = result {
                tracing::error!("Connection task failed: {e}");
            }
        }

        for agent in &self.agents {
            agent.terminal.shutdown().await;
        }
        tracing::info!("Agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config(agents: usize) -> AgentConfig {
        let agents = (0..agents)
            .map(|i| AgentIdentity {
                name: format!("agent-{i}"),
                // Nothing listens here; every connect fails fast.
                url: "ws://127.0.0.1:9/agent".into(),
                token: "secret".into(),
                agent_id: format!("a{i}"),
                workspace_id: "w1".into(),
                capabilities: Vec::new(),
                working_dir: std::env::temp_dir(),
                default_shell: Some("sh".into()),
            })
            .collect();
        AgentConfig {
            agents,
            settings: AgentSettings {
                reconnect_min_delay_ms: 20,
                reconnect_max_delay_ms: 50,
                command_timeout_secs: 7,
                ..AgentSettings::default()
            },
        }
    }

    #[tokio::test]
    async fn test_builds_one_handle_per_identity() {
        let runner = AgentRunner::new(config(3), CancellationToken::new());
        assert_eq!(runner.agents().len(), 3);
        let agent = &runner.agents()[0];
        assert_eq!(agent.dispatcher.timeout(), Duration::from_secs(7));
        assert!(!agent.dispatcher.is_busy());
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let shutdown = CancellationToken::new();
        let runner = AgentRunner::new(config(2), shutdown.clone());
        let task = tokio::spawn(runner.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!task.is_finished());
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_helper_launch_uses_configured_program() {
        let settings = AgentSettings {
            pty_helper_program: Some("/opt/agent/pty-helper".into()),
            pty_helper_args: vec!["--verbose".into()],
            ..AgentSettings::default()
        };
        let launch = helper_launch(&settings);
        assert_eq!(launch.program, std::path::PathBuf::from("/opt/agent/pty-helper"));
        assert_eq!(launch.args, vec!["--verbose"]);
    }
}
