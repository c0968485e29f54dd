//! Single-flight command dispatch.
//!
//! At most one command runs per agent. A request arriving while another is
//! in flight is refused with [`DispatchError::Busy`]; the slot is released
//! by [`ExecutionPermit`]'s drop, so every exit path frees it, panics
//! included.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, sleep_until, timeout_at},
};
use tokio_util::sync::CancellationToken;
use workspace_agent_core::{CommandEvent, EventBus, OutputStream};
use workspace_agent_pty::{ShellKind, UnknownShell};

use crate::runner::{ProcessRunner, RunnerError, exit_code};

/// Exit code reported for a command killed by the timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when a command never ran or was abandoned.
pub const FAILURE_EXIT_CODE: i32 = -1;
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// How long to keep reading output after the process is gone.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Agent is busy running command {active}")]
    Busy { active: String },
    #[error("Unsupported shell: {0}")]
    Shell(#[from] UnknownShell),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("Failed waiting for command: {0}")]
    Wait(#[from] std::io::Error),
}

/// A command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub command_id: String,
    pub command: String,
    /// Shell name; the dispatcher default when absent.
    pub shell: Option<String>,
}

/// How a command that started ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Exited(i32),
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
enum Slot {
    Idle,
    Busy { command_id: String },
}

/// Proof that the caller holds the single execution slot.
#[derive(Debug)]
pub struct ExecutionPermit {
    slot: Arc<Mutex<Slot>>,
    command_id: String,
}

impl ExecutionPermit {
    #[must_use]
    pub fn command_id(&self) -> &str {
        &self.command_id
    }
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Slot::Idle;
        tracing::debug!(command_id = %self.command_id, "Execution slot released");
    }
}

enum Ending {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Runs one shell command at a time with a deadline.
#[derive(Debug)]
pub struct CommandDispatcher {
    slot: Arc<Mutex<Slot>>,
    working_dir: PathBuf,
    default_shell: ShellKind,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl CommandDispatcher {
    #[must_use]
    pub fn new(working_dir: impl Into<PathBuf>, default_shell: ShellKind) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Idle)),
            working_dir: working_dir.into(),
            default_shell,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Cancelling `token` kills whatever is running.
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.active_command().is_some()
    }

    /// Id of the command currently holding the slot.
    #[must_use]
    pub fn active_command(&self) -> Option<String> {
        match &*self.slot.lock().unwrap_or_else(PoisonError::into_inner) {
            Slot::Idle => None,
            Slot::Busy { command_id } => Some(command_id.clone()),
        }
    }

    /// Claim the execution slot for `command_id`.
    ///
    /// # Errors
    /// Returns [`DispatchError::Busy`] if another command holds it.
    pub fn try_acquire(&self, command_id: &str) -> Result<ExecutionPermit, DispatchError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Slot::Busy { command_id: active } = &*slot {
            return Err(DispatchError::Busy {
                active: active.clone(),
            });
        }
        *slot = Slot::Busy {
            command_id: command_id.to_string(),
        };
        drop(slot);
        Ok(ExecutionPermit {
            slot: Arc::clone(&self.slot),
            command_id: command_id.to_string(),
        })
    }

    /// Shell for a request, falling back to the configured default.
    ///
    /// # Errors
    /// Returns error if the name is not a known shell.
    pub fn resolve_shell(&self, shell: Option<&str>) -> Result<ShellKind, UnknownShell> {
        match shell.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => name.parse(),
            None => Ok(self.default_shell),
        }
    }

    /// Acquire the slot and run `request`.
    ///
    /// # Errors
    /// Returns error if busy or if the command cannot be started.
    pub async fn execute_request<F>(
        &self,
        request: &CommandRequest,
        on_line: F,
    ) -> Result<CommandOutcome, DispatchError>
    where
        F: FnMut(OutputStream, String) + Send,
    {
        let permit = self.try_acquire(&request.command_id)?;
        self.execute(permit, request, on_line).await
    }

    /// Run `request`, streaming each output line to `on_line`.
    ///
    /// On timeout the process tree is killed and a final `[timeout]` line
    /// goes to stderr. The permit is released when this returns.
    ///
    /// # Errors
    /// Returns error if the shell is unknown or the process fails to start.
    pub async fn execute<F>(
        &self,
        permit: ExecutionPermit,
        request: &CommandRequest,
        mut on_line: F,
    ) -> Result<CommandOutcome, DispatchError>
    where
        F: FnMut(OutputStream, String) + Send,
    {
        let _permit = permit;
        let command_id = request.command_id.as_str();
        let shell = self.resolve_shell(request.shell.as_deref())?;
        let mut process = ProcessRunner::spawn(shell, &request.command, &self.working_dir).await?;
        tracing::info!(command_id, %shell, pid = ?process.id(), "Command started");

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = process.take_stdout() {
            readers.push(spawn_line_reader(stdout, OutputStream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = process.take_stderr() {
            readers.push(spawn_line_reader(stderr, OutputStream::Stderr, line_tx));
        }

        let deadline = Instant::now() + self.timeout;
        let ending = {
            let wait = process.wait();
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    Some((stream, line)) = line_rx.recv() => on_line(stream, line),
                    status = &mut wait => break Ending::Exited(status?),
                    () = sleep_until(deadline) => break Ending::TimedOut,
                    () = self.shutdown.cancelled() => break Ending::Cancelled,
                }
            }
        };

        if !matches!(ending, Ending::Exited(_)) {
            process.kill_tree().await;
        }
        drain_output(&mut line_rx, &mut on_line).await;
        for reader in readers {
            reader.abort();
        }

        let outcome = match ending {
            Ending::Exited(status) => CommandOutcome::Exited(exit_code(status)),
            Ending::TimedOut => {
                on_line(
                    OutputStream::Stderr,
                    format!(
                        "[timeout] Command exceeded {}s and was terminated",
                        self.timeout.as_secs()
                    ),
                );
                CommandOutcome::TimedOut
            }
            Ending::Cancelled => CommandOutcome::Cancelled,
        };
        tracing::info!(command_id, ?outcome, "Command finished");
        Ok(outcome)
    }

    /// Run `request` and publish its output and final status on `bus`.
    pub async fn dispatch(&self, permit: ExecutionPermit, request: CommandRequest, bus: &EventBus) {
        let command_id = request.command_id.clone();
        let result = self
            .execute(permit, &request, |stream, data| {
                bus.publish(CommandEvent::Output {
                    command_id: command_id.clone(),
                    stream,
                    data,
                });
            })
            .await;

        let event = match result {
            Ok(CommandOutcome::Exited(exit_code)) => CommandEvent::Completed {
                command_id,
                exit_code,
            },
            Ok(CommandOutcome::TimedOut) => CommandEvent::Failed {
                command_id,
                exit_code: TIMEOUT_EXIT_CODE,
                error: format!("Command timed out after {}s", self.timeout.as_secs()),
            },
            Ok(CommandOutcome::Cancelled) => CommandEvent::Failed {
                command_id,
                exit_code: FAILURE_EXIT_CODE,
                error: "Command cancelled by agent shutdown".into(),
            },
            Err(e) => {
                tracing::warn!(%command_id, "Command failed to run: {e}");
                CommandEvent::Failed {
                    command_id,
                    exit_code: FAILURE_EXIT_CODE,
                    error: e.to_string(),
                }
            }
        };
        bus.publish(event);
    }

    /// Start `request` in the background, or announce that the agent is busy.
    ///
    /// Returns the task handle when the command was accepted.
    pub fn submit(self: &Arc<Self>, request: CommandRequest, bus: &EventBus) -> Option<JoinHandle<()>> {
        match self.try_acquire(&request.command_id) {
            Ok(permit) => {
                let this = Arc::clone(self);
                let bus = bus.clone();
                Some(tokio::spawn(async move {
                    this.dispatch(permit, request, &bus).await;
                }))
            }
            Err(e) => {
                tracing::info!(command_id = %request.command_id, "Rejecting command: {e}");
                bus.publish(CommandEvent::Busy {
                    command_id: request.command_id,
                });
                None
            }
        }
    }
}

fn spawn_line_reader<R>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<(OutputStream, String)>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(|c| c == '\n' || c == '\r')
                        .to_string();
                    if tx.send((stream, line)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(stream = stream.as_str(), "Output read failed: {e}");
                    break;
                }
            }
        }
    })
}

/// Forward buffered lines until both pipes close or the drain window ends.
///
/// Background children can keep a pipe open past the shell's exit.
async fn drain_output<F>(rx: &mut mpsc::UnboundedReceiver<(OutputStream, String)>, on_line: &mut F)
where
    F: FnMut(OutputStream, String),
{
    let deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;
    while let Ok(Some((stream, line))) = timeout_at(deadline, rx.recv()).await {
        on_line(stream, line);
    }
}
