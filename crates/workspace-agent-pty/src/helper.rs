//! Line-delimited JSON protocol spoken with the terminal helper process.
//!
//! Each message is one JSON object per line with a `type` discriminator.
//! The agent writes [`HelperCommand`]s to the helper's stdin and reads
//! [`HelperEvent`]s from its stdout.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Command sent to the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HelperCommand {
    /// Allocate a PTY and spawn the shell in it.
    Start {
        shell: String,
        cwd: PathBuf,
        cols: u16,
        rows: u16,
    },
    /// Keystrokes for the shell.
    Input { data: String },
    /// Change the terminal dimensions.
    Resize { cols: u16, rows: u16 },
    /// Terminate the shell.
    Stop,
}

/// Event emitted by the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HelperEvent {
    /// Helper is up and accepting commands.
    Ready,
    /// Shell is running.
    Started {
        shell: String,
        #[serde(default)]
        pid: Option<u32>,
    },
    /// Terminal output.
    Output { data: String },
    /// Shell exited.
    Exit {
        #[serde(default)]
        exit_code: Option<i32>,
        #[serde(default)]
        signal: Option<String>,
    },
    /// Helper-side failure.
    Error { message: String },
}

/// Serialize a message as one protocol line, newline included.
///
/// # Errors
/// Returns error if serialization fails.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_shape() {
        let line = encode_line(&HelperCommand::Start {
            shell: "bash".into(),
            cwd: PathBuf::from("/tmp"),
            cols: 120,
            rows: 40,
        })
        .unwrap();
        assert_eq!(
            line,
            "{\"type\":\"start\",\"shell\":\"bash\",\"cwd\":\"/tmp\",\"cols\":120,\"rows\":40}\n"
        );
        assert_eq!(encode_line(&HelperCommand::Stop).unwrap(), "{\"type\":\"stop\"}\n");
    }

    #[test]
    fn test_parse_exit_event() {
        let event: HelperEvent =
            serde_json::from_str(r#"{"type":"exit","exitCode":130,"signal":"SIGINT"}"#).unwrap();
        assert_eq!(
            event,
            HelperEvent::Exit {
                exit_code: Some(130),
                signal: Some("SIGINT".into()),
            }
        );
        let bare: HelperEvent = serde_json::from_str(r#"{"type":"exit"}"#).unwrap();
        assert_eq!(
            bare,
            HelperEvent::Exit {
                exit_code: None,
                signal: None,
            }
        );
    }

    #[test]
    fn test_parse_started_without_pid() {
        let event: HelperEvent = serde_json::from_str(r#"{"type":"started","shell":"zsh"}"#).unwrap();
        assert_eq!(
            event,
            HelperEvent::Started {
                shell: "zsh".into(),
                pid: None,
            }
        );
    }
}
