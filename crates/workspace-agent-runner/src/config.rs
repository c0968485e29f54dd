//! Locating and loading the agent configuration.

use std::path::PathBuf;

use thiserror::Error;
use workspace_agent_core::{AgentConfig, ConfigError};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "WORKSPACE_AGENT_CONFIG";
/// Environment variable overriding the token of a single-agent config.
pub const TOKEN_ENV: &str = "WORKSPACE_AGENT_TOKEN";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("No config file given; pass a path or set {CONFIG_ENV}")]
    MissingConfig,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Config path from the first CLI argument, else the environment.
#[must_use]
pub fn config_path(arg: Option<String>, env: Option<String>) -> Option<PathBuf> {
    arg.or(env)
        .filter(|path| !path.trim().is_empty())
        .map(PathBuf::from)
}

/// Replace the token of a single-agent config.
///
/// Returns whether the override was applied; it is ignored when the
/// config names several agents.
pub fn apply_token_override(config: &mut AgentConfig, token: Option<String>) -> bool {
    let Some(token) = token.filter(|token| !token.is_empty()) else {
        return false;
    };
    match config.agents.as_mut_slice() {
        [agent] => {
            agent.token = token;
            true
        }
        agents => {
            tracing::warn!(agents = agents.len(), "{TOKEN_ENV} ignored for multi-agent config");
            false
        }
    }
}

/// Load, override, and validate the configuration.
///
/// # Errors
/// Returns error if no path is given or the file is missing or invalid.
pub fn load(path: Option<PathBuf>, token: Option<String>) -> Result<AgentConfig, LaunchError> {
    let path = path.ok_or(LaunchError::MissingConfig)?;
    let mut config = AgentConfig::read(&path)?;
    if apply_token_override(&mut config, token) {
        tracing::info!("Using token from {TOKEN_ENV}");
    }
    config.validate()?;
    tracing::info!(path = %path.display(), agents = config.agents.len(), "Configuration loaded");
    Ok(config)
}
