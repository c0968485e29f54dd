//! Spawning shell commands in their own process group.

use std::{
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use thiserror::Error;
use tokio::process::{ChildStderr, ChildStdout, Command};
use workspace_agent_pty::ShellKind;

use crate::command::{CommandBuildError, CommandParts};

/// Exit code reported when a process was killed without one.
const SIGNAL_EXIT_BASE: i32 = 128;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Build(#[from] CommandBuildError),
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Child {0} pipe was not captured")]
    MissingPipe(&'static str),
}

/// A running command and its captured output pipes.
///
/// Dropping a process that is still running kills its whole group.
pub struct SpawnedProcess {
    child: AsyncGroupChild,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl SpawnedProcess {
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub const fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub const fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Wait for the group leader to exit.
    ///
    /// # Errors
    /// Returns error if waiting fails.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Kill the process and every descendant in its group, then reap it.
    pub async fn kill_tree(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(pid = ?self.id(), "Process group already gone: {e}");
        }
        if let Err(e) = self.child.wait().await {
            tracing::debug!(pid = ?self.id(), "Reaping killed process failed: {e}");
        }
    }
}

impl Drop for SpawnedProcess {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.start_kill();
        }
    }
}

/// Launches shell commands with piped output and no stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Spawn `text` under `shell` in `cwd`.
    ///
    /// The child leads a new process group so [`SpawnedProcess::kill_tree`]
    /// reaches everything it starts.
    ///
    /// # Errors
    /// Returns error if the invocation cannot be built or the spawn fails.
    pub async fn spawn(shell: ShellKind, text: &str, cwd: &Path) -> Result<SpawnedProcess, RunnerError> {
        let (program, parts) = CommandParts::for_shell(shell, text)?.into_resolved().await?;
        tracing::debug!(command = %parts.preview(), cwd = %cwd.display(), "Spawning command");

        let mut command = Command::new(&program);
        command
            .args(&parts.args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(windows)]
        if let Some(raw) = &parts.raw_tail {
            command.raw_arg(raw);
        }

        let mut child = command
            .group_spawn()
            .map_err(|source| RunnerError::Spawn { program, source })?;
        let stdout = child.inner().stdout.take().ok_or(RunnerError::MissingPipe("stdout"))?;
        let stderr = child.inner().stderr.take().ok_or(RunnerError::MissingPipe("stderr"))?;

        Ok(SpawnedProcess {
            child,
            stdout: Some(stdout),
            stderr: Some(stderr),
        })
    }
}

/// Numeric exit code for a finished process.
///
/// Signal deaths map to `128 + signal` the way shells report them.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return SIGNAL_EXIT_BASE + signal;
        }
    }
    -1
}
