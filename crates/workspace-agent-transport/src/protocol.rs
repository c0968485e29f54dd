//! Wire protocol spoken with the control server.
//!
//! Every frame is a JSON object with a dotted `type` discriminator and
//! camelCase fields.

use std::{
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use workspace_agent_core::{AgentEvent, CommandEvent, OutputStream, TerminalEvent};

/// Inbound `type` values this agent understands.
const INBOUND_TYPES: &[&str] = &[
    "command.execute",
    "pty.start",
    "pty.input",
    "pty.resize",
    "pty.stop",
    "pty.history.request",
    "file.write.start",
    "file.write.chunk",
    "file.write.end",
    "agent.heartbeat.ack",
];

/// Message from the control server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum InboundMessage {
    #[serde(rename = "command.execute")]
    CommandExecute {
        command_id: String,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
    },
    #[serde(rename = "pty.start")]
    PtyStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    #[serde(rename = "pty.input")]
    PtyInput { data: String },
    #[serde(rename = "pty.resize")]
    PtyResize { cols: u16, rows: u16 },
    #[serde(rename = "pty.stop")]
    PtyStop,
    #[serde(rename = "pty.history.request")]
    PtyHistoryRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "file.write.start")]
    FileWriteStart {
        #[serde(alias = "fileId", alias = "writeId", alias = "requestId")]
        id: String,
        path: PathBuf,
    },
    #[serde(rename = "file.write.chunk")]
    FileWriteChunk {
        #[serde(alias = "fileId", alias = "writeId", alias = "requestId")]
        id: String,
        /// Base64-encoded bytes.
        data: String,
    },
    #[serde(rename = "file.write.end")]
    FileWriteEnd {
        #[serde(alias = "fileId", alias = "writeId", alias = "requestId")]
        id: String,
    },
    #[serde(rename = "agent.heartbeat.ack")]
    HeartbeatAck,
}

/// Message sent to the control server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum OutboundMessage {
    /// Handshake, sent first on every connection.
    #[serde(rename = "agent.connected")]
    AgentConnected {
        agent_id: String,
        workspace_id: String,
        name: String,
        capabilities: Vec<String>,
        default_shell: String,
        available_shells: Vec<String>,
        platform: String,
        version: String,
    },
    #[serde(rename = "agent.heartbeat")]
    Heartbeat {
        /// Milliseconds since the Unix epoch.
        timestamp: u64,
    },
    #[serde(rename = "command.output")]
    CommandOutput {
        command_id: String,
        stream: OutputStream,
        data: String,
    },
    #[serde(rename = "command.completed")]
    CommandCompleted { command_id: String, exit_code: i32 },
    #[serde(rename = "command.failed")]
    CommandFailed {
        command_id: String,
        exit_code: i32,
        error: String,
    },
    #[serde(rename = "command.busy")]
    CommandBusy { command_id: String },
    #[serde(rename = "pty.started")]
    PtyStarted { shell: String },
    #[serde(rename = "pty.output")]
    PtyOutput { data: String },
    #[serde(rename = "pty.exited")]
    PtyExited { exit_code: i32 },
    #[serde(rename = "pty.history")]
    PtyHistory {
        data: String,
        /// Bytes currently retained in the history buffer.
        buffer_size: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "pty.error")]
    PtyError { message: String },
}

impl OutboundMessage {
    /// Heartbeat stamped with the current time.
    #[must_use]
    pub fn heartbeat_now() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        Self::Heartbeat { timestamp }
    }

    /// Serialize for a text frame.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<AgentEvent> for OutboundMessage {
    fn from(event: AgentEvent) -> Self {
        match event {
            AgentEvent::Command(CommandEvent::Output {
                command_id,
                stream,
                data,
            }) => Self::CommandOutput {
                command_id,
                stream,
                data,
            },
            AgentEvent::Command(CommandEvent::Completed {
                command_id,
                exit_code,
            }) => Self::CommandCompleted {
                command_id,
                exit_code,
            },
            AgentEvent::Command(CommandEvent::Failed {
                command_id,
                exit_code,
                error,
            }) => Self::CommandFailed {
                command_id,
                exit_code,
                error,
            },
            AgentEvent::Command(CommandEvent::Busy { command_id }) => {
                Self::CommandBusy { command_id }
            }
            AgentEvent::Terminal(TerminalEvent::Started { shell }) => Self::PtyStarted { shell },
            AgentEvent::Terminal(TerminalEvent::Output { data }) => Self::PtyOutput { data },
            AgentEvent::Terminal(TerminalEvent::Exited { exit_code }) => {
                Self::PtyExited { exit_code }
            }
            AgentEvent::Terminal(TerminalEvent::Error { message }) => Self::PtyError { message },
        }
    }
}

/// Why an inbound frame was not turned into a message.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("Message has no string `type` field")]
    MissingType,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Invalid {kind} message: {source}")]
    Invalid {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode one inbound text frame.
///
/// Unknown types are reported separately so callers can ignore them
/// quietly while still flagging malformed known messages.
///
/// # Errors
/// Returns error if the frame is not a well-formed known message.
pub fn decode_inbound(text: &str) -> Result<InboundMessage, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(DecodeError::Json)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_string();
    if !INBOUND_TYPES.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|source| DecodeError::Invalid { kind, source })
}
