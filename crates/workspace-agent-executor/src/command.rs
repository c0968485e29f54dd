//! Shell invocation building.

use std::path::PathBuf;

use thiserror::Error;
use workspace_agent_pty::{ShellKind, resolve_executable_path};

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Command is empty")]
    EmptyCommand,
    #[error("Command contains a NUL byte")]
    NulByte,
    #[error("Shell {0} is not available on this platform")]
    UnsupportedShell(ShellKind),
    #[error("Executable not found: {0}")]
    NotFound(String),
}

/// Program and arguments for one shell invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
    /// Appended verbatim after `args`, bypassing platform argument quoting.
    pub raw_tail: Option<String>,
}

impl CommandParts {
    /// Build the invocation that runs `text` through `shell`.
    ///
    /// POSIX shells get the text as a single `-c` argument, so no quoting
    /// is needed. `cmd.exe` parses its own command line, so the text is
    /// wrapped for `/s /c` and passed raw.
    ///
    /// # Errors
    /// Returns error if the command is empty, contains NUL, or the shell
    /// does not exist on this platform.
    pub fn for_shell(shell: ShellKind, text: &str) -> Result<Self, CommandBuildError> {
        if text.trim().is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }
        if text.contains('\0') {
            return Err(CommandBuildError::NulByte);
        }
        if shell.windows_only() && !cfg!(windows) {
            return Err(CommandBuildError::UnsupportedShell(shell));
        }

        let program = shell.program().to_string();
        let with_args = |args: &[&str]| Self {
            program: program.clone(),
            args: args
                .iter()
                .map(|arg| (*arg).to_string())
                .chain(std::iter::once(text.to_string()))
                .collect(),
            raw_tail: None,
        };

        Ok(match shell {
            ShellKind::PowerShell | ShellKind::Pwsh => {
                with_args(&["-NoLogo", "-NoProfile", "-NonInteractive", "-Command"])
            }
            ShellKind::Cmd => Self {
                program,
                args: vec!["/d".into(), "/s".into(), "/c".into()],
                raw_tail: Some(quote_for_cmd(text)),
            },
            ShellKind::Bash | ShellKind::Zsh | ShellKind::Fish | ShellKind::Sh => {
                if shell.supports_login() {
                    with_args(&["-l", "-c"])
                } else {
                    with_args(&["-c"])
                }
            }
        })
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if the executable is not on `PATH`.
    pub async fn into_resolved(self) -> Result<(PathBuf, Self), CommandBuildError> {
        let executable = resolve_executable_path(&self.program)
            .await
            .ok_or_else(|| CommandBuildError::NotFound(self.program.clone()))?;
        Ok((executable, self))
    }

    /// Shell-quoted rendering for logs.
    #[must_use]
    pub fn preview(&self) -> String {
        let words = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .chain(self.raw_tail.as_deref());
        shlex::try_join(words).unwrap_or_else(|_| self.program.clone())
    }
}

/// `cmd /s /c` strips exactly one pair of outer quotes and runs the rest.
fn quote_for_cmd(text: &str) -> String {
    format!("\"{text}\"")
}
