//! Agent identity and run settings.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ring_buffer::DEFAULT_CAPACITY;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("No agents configured")]
    NoAgents,
    #[error("Agent {agent}: {reason}")]
    Invalid { agent: String, reason: String },
    #[error("Setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: &'static str },
}

/// One configured connection, immutable for the lifetime of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    /// Human-readable label used in logs. Defaults to the agent id.
    #[serde(default)]
    pub name: String,
    /// Control server URL (`ws://` or `wss://`).
    pub url: String,
    /// Bearer token presented on connect.
    pub token: String,
    /// Stable agent identifier.
    pub agent_id: String,
    /// Workspace this agent serves.
    pub workspace_id: String,
    /// Declared capability set.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Working directory for commands and terminal sessions.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Preferred shell; detected from the environment when unset.
    #[serde(default)]
    pub default_shell: Option<String>,
}

fn default_working_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

impl AgentIdentity {
    /// Label for logs.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.agent_id
        } else {
            &self.name
        }
    }

    /// Check required fields.
    ///
    /// # Errors
    /// Returns error describing the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            agent: self.display_name().to_string(),
            reason: reason.to_string(),
        };
        if self.agent_id.trim().is_empty() {
            return Err(invalid("agentId is empty"));
        }
        if self.workspace_id.trim().is_empty() {
            return Err(invalid("workspaceId is empty"));
        }
        if self.token.trim().is_empty() {
            return Err(invalid("token is empty"));
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(invalid("url must use ws:// or wss://"));
        }
        Ok(())
    }
}

/// Tunables shared by every identity in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    pub heartbeat_interval_secs: u64,
    /// Unacknowledged heartbeats tolerated before forcing a reconnect.
    pub heartbeat_max_missed: u32,
    pub reconnect_min_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_multiplier: f64,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    /// Terminal history capacity in bytes.
    pub history_capacity: usize,
    /// Terminal helper executable. Resolved next to the agent binary when unset.
    pub pty_helper_program: Option<PathBuf>,
    pub pty_helper_args: Vec<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            heartbeat_max_missed: 3,
            reconnect_min_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            reconnect_multiplier: 1.5,
            connect_timeout_secs: 30,
            command_timeout_secs: 3_600,
            history_capacity: DEFAULT_CAPACITY,
            pty_helper_program: None,
            pty_helper_args: Vec::new(),
        }
    }
}

impl AgentSettings {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Reject values the connection and command loops cannot run with.
    ///
    /// # Errors
    /// Returns error naming the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &'static str| -> Result<(), ConfigError> {
            Err(ConfigError::InvalidSetting { field, reason })
        };
        if self.heartbeat_interval_secs == 0 {
            return invalid("heartbeatIntervalSecs", "must be at least 1");
        }
        if self.heartbeat_max_missed == 0 {
            return invalid("heartbeatMaxMissed", "must be at least 1");
        }
        if self.connect_timeout_secs == 0 {
            return invalid("connectTimeoutSecs", "must be at least 1");
        }
        if self.command_timeout_secs == 0 {
            return invalid("commandTimeoutSecs", "must be at least 1");
        }
        if self.reconnect_min_delay_ms == 0 {
            return invalid("reconnectMinDelayMs", "must be at least 1");
        }
        if self.reconnect_min_delay_ms > self.reconnect_max_delay_ms {
            return invalid("reconnectMinDelayMs", "exceeds reconnectMaxDelayMs");
        }
        if !self.reconnect_multiplier.is_finite() || self.reconnect_multiplier < 1.0 {
            return invalid("reconnectMultiplier", "must be a finite number of at least 1");
        }
        if self.history_capacity == 0 {
            return invalid("historyCapacity", "must be at least 1");
        }
        Ok(())
    }
}

/// Full agent configuration: one or more identities plus shared settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub agents: Vec<AgentIdentity>,
    #[serde(default)]
    pub settings: AgentSettings,
}

impl AgentConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Errors
    /// Returns error if the document is malformed or fails validation.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file without validating it, so
    /// callers can apply overrides first.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Validate the settings and every identity.
    ///
    /// # Errors
    /// Returns error if no agents are configured or anything is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::NoAgents);
        }
        self.settings.validate()?;
        self.agents.iter().try_for_each(AgentIdentity::validate)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const MINIMAL: &str = r#"{
        "agents": [{
            "url": "wss://control.example.com/agent",
            "token": "secret",
            "agentId": "agent-1",
            "workspaceId": "ws-1",
            "capabilities": ["exec", "pty"],
            "workingDir": "/tmp"
        }]
    }"#;

    #[test]
    fn test_parse_minimal_with_defaults() {
        let config = AgentConfig::from_json_str(MINIMAL).unwrap();
        let agent = &config.agents[0];
        assert_eq!(agent.display_name(), "agent-1");
        assert_eq!(agent.capabilities, vec!["exec", "pty"]);
        assert_eq!(agent.working_dir, PathBuf::from("/tmp"));
        assert_eq!(config.settings.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(config.settings.heartbeat_max_missed, 3);
        assert_eq!(config.settings.history_capacity, DEFAULT_CAPACITY);
    }

    #[test]
    fn test_partial_settings_keep_defaults() {
        let json = MINIMAL.replacen('{', r#"{ "settings": { "commandTimeoutSecs": 5 },"#, 1);
        let config = AgentConfig::from_json_str(&json).unwrap();
        assert_eq!(config.settings.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.settings.reconnect_max_delay_ms, 30_000);
    }

    #[test]
    fn test_rejects_bad_url() {
        let json = MINIMAL.replace("wss://", "https://");
        let err = tokio_test::assert_err!(AgentConfig::from_json_str(&json));
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_rejects_empty_agents() {
        let err = AgentConfig::from_json_str(r#"{ "agents": [] }"#).unwrap_err();
        assert!(matches!(err, ConfigError::NoAgents));
    }

    #[test]
    fn test_read_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = AgentConfig::read(file.path()).unwrap();
        assert_eq!(config.agents.len(), 1);
        tokio_test::assert_ok!(config.validate());

        let missing = AgentConfig::read(Path::new("/nonexistent/agent.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }

    fn rejected_setting(settings: &str) -> &'static str {
        let json = MINIMAL.replacen('{', &format!(r#"{{ "settings": {settings},"#), 1);
        match AgentConfig::from_json_str(&json) {
            Err(ConfigError::InvalidSetting { field, .. }) => field,
            other => panic!("expected {settings} to be rejected, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_zero_durations_and_counts() {
        assert_eq!(rejected_setting(r#"{ "heartbeatIntervalSecs": 0 }"#), "heartbeatIntervalSecs");
        assert_eq!(rejected_setting(r#"{ "heartbeatMaxMissed": 0 }"#), "heartbeatMaxMissed");
        assert_eq!(rejected_setting(r#"{ "connectTimeoutSecs": 0 }"#), "connectTimeoutSecs");
        assert_eq!(rejected_setting(r#"{ "commandTimeoutSecs": 0 }"#), "commandTimeoutSecs");
        assert_eq!(rejected_setting(r#"{ "historyCapacity": 0 }"#), "historyCapacity");
        assert_eq!(rejected_setting(r#"{ "reconnectMinDelayMs": 0 }"#), "reconnectMinDelayMs");
    }

    #[test]
    fn test_rejects_inverted_reconnect_bounds() {
        assert_eq!(
            rejected_setting(r#"{ "reconnectMinDelayMs": 5000, "reconnectMaxDelayMs": 1000 }"#),
            "reconnectMinDelayMs"
        );
        assert_eq!(rejected_setting(r#"{ "reconnectMultiplier": 0.5 }"#), "reconnectMultiplier");
    }

    #[test]
    fn test_default_settings_are_valid() {
        tokio_test::assert_ok!(AgentSettings::default().validate());
    }
}
