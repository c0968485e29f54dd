//! Interactive terminal session controller.
//!
//! At most one session runs per agent. The PTY itself lives in a helper
//! process spoken to over the line protocol in [`crate::helper`]; the
//! controller owns that process, relays its output to the event bus and
//! keeps a bounded history for replay after reconnection.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, timeout, timeout_at},
};
use workspace_agent_core::{EventBus, OutputRingBuffer, TerminalEvent};

use crate::helper::{HelperCommand, HelperEvent, encode_line};

/// Default terminal width.
pub const DEFAULT_COLS: u16 = 80;
/// Default terminal height.
pub const DEFAULT_ROWS: u16 = 24;
/// File name of the bundled helper binary.
pub const HELPER_BIN_NAME: &str = "workspace-agent-pty-helper";

const HELPER_READY_TIMEOUT: Duration = Duration::from_secs(10);
const HELPER_START_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_GRACE: Duration = Duration::from_secs(3);
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Bound on a single write to the helper's stdin.
const HELPER_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
/// Exit code reported when the helper vanished without saying why.
const UNKNOWN_EXIT_CODE: i32 = -1;

type HelperLines = Lines<BufReader<ChildStdout>>;

/// Terminal session error.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("Failed to spawn terminal helper {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Terminal helper I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Terminal helper protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("Terminal helper did not respond within {0:?}")]
    Timeout(Duration),
    #[error("Terminal helper exited during startup")]
    HelperExited,
    #[error("Terminal helper reported: {0}")]
    Helper(String),
    #[error("Terminal session is {0}")]
    Busy(&'static str),
    #[error("No terminal session is running")]
    NotRunning,
    #[error("Terminal start cancelled by stop")]
    Cancelled,
}

/// How to launch the helper process.
#[derive(Debug, Clone)]
pub struct HelperLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl HelperLaunch {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// The bundled helper: next to the running executable if present,
    /// otherwise looked up on PATH.
    #[must_use]
    pub fn locate() -> Self {
        let file_name = format!("{HELPER_BIN_NAME}{}", std::env::consts::EXE_SUFFIX);
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)))
            .filter(|path| path.is_file());
        Self::new(sibling.unwrap_or_else(|| PathBuf::from(file_name)))
    }
}

/// Parameters of a `start` request.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub shell: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

/// Result of a successful `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new helper was spawned.
    Spawned,
    /// A healthy session already existed and was re-announced.
    Resumed,
}

/// Externally visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Absent,
    Starting,
    Running,
    Stopping,
}

/// Snapshot of the session history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    pub data: String,
    /// Bytes currently retained by the buffer.
    pub size: usize,
}

enum SessionState {
    Absent,
    Starting { id: u64 },
    Running(Box<ActiveSession>),
    /// Exit events seen in this state are recorded, never published.
    Stopping { id: u64, exit_code: Option<i32> },
}

struct ActiveSession {
    id: u64,
    shell: String,
    child: Child,
    stdin: ChildStdin,
    history: Arc<OutputRingBuffer>,
    reader: JoinHandle<()>,
}

impl ActiveSession {
    fn is_healthy(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None)) && !self.reader.is_finished()
    }

    fn discard(mut self) {
        self.reader.abort();
        let _ = self.child.start_kill();
    }
}

/// Helper that completed the handshake but is not yet published.
struct PendingSession {
    child: Child,
    stdin: ChildStdin,
    lines: HelperLines,
    shell: String,
    pid: Option<u32>,
    history: Arc<OutputRingBuffer>,
    early_output: Vec<String>,
}

/// Controller for the single interactive terminal session of an agent.
pub struct TerminalController {
    launch: HelperLaunch,
    history_capacity: usize,
    bus: EventBus,
    state: Arc<Mutex<SessionState>>,
    next_id: AtomicU64,
}

impl TerminalController {
    #[must_use]
    pub fn new(launch: HelperLaunch, history_capacity: usize, bus: EventBus) -> Self {
        Self {
            launch,
            history_capacity,
            bus,
            state: Arc::new(Mutex::new(SessionState::Absent)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Start a session, or re-announce the running one if it is healthy.
    ///
    /// # Errors
    /// Returns error if a start or stop is already in progress, or the
    /// helper fails to come up. Startup failures are also published as
    /// [`TerminalEvent::Error`].
    pub async fn start(&self, request: StartRequest) -> Result<StartOutcome, PtyError> {
        let id = {
            let mut state = self.state.lock().await;
            let unhealthy = match &mut *state {
                SessionState::Running(session) => {
                    if session.is_healthy() {
                        tracing::info!(session_id = session.id, "Terminal session already running, re-announcing");
                        self.bus.publish(TerminalEvent::Started {
                            shell: session.shell.clone(),
                        });
                        return Ok(StartOutcome::Resumed);
                    }
                    true
                }
                SessionState::Starting { .. } => return Err(PtyError::Busy("starting")),
                SessionState::Stopping { .. } => return Err(PtyError::Busy("stopping")),
                SessionState::Absent => false,
            };
            if unhealthy {
                if let SessionState::Running(session) =
                    std::mem::replace(&mut *state, SessionState::Absent)
                {
                    tracing::warn!(session_id = session.id, "Terminal session unhealthy, replacing");
                    session.discard();
                }
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            *state = SessionState::Starting { id };
            id
        };

        let pending = match self.launch_helper(&request).await {
            Ok(pending) => pending,
            Err(e) => {
                let mut state = self.state.lock().await;
                if matches!(&*state, SessionState::Starting { id: current } if *current == id) {
                    *state = SessionState::Absent;
                }
                drop(state);
                tracing::error!(session_id = id, "Failed to start terminal session: {e}");
                self.bus.publish(TerminalEvent::Error {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let mut state = self.state.lock().await;
        if !matches!(&*state, SessionState::Starting { id: current } if *current == id) {
            drop(state);
            let PendingSession { mut child, .. } = pending;
            let _ = child.kill().await;
            tracing::info!(session_id = id, "Terminal start superseded by stop");
            return Err(PtyError::Cancelled);
        }

        let PendingSession {
            child,
            stdin,
            lines,
            shell,
            pid,
            history,
            early_output,
        } = pending;

        tracing::info!(session_id = id, %shell, ?pid, "Terminal session started");
        self.bus.publish(TerminalEvent::Started {
            shell: shell.clone(),
        });
        for data in early_output {
            self.bus.publish(TerminalEvent::Output { data });
        }

        let reader = tokio::spawn(read_events(
            id,
            lines,
            Arc::clone(&history),
            self.bus.clone(),
            Arc::clone(&self.state),
        ));
        *state = SessionState::Running(Box::new(ActiveSession {
            id,
            shell,
            child,
            stdin,
            history,
            reader,
        }));
        Ok(StartOutcome::Spawned)
    }

    /// Forward keystrokes to the running session.
    ///
    /// A helper that stops draining its stdin fails the write after a short
    /// bound instead of holding the session lock.
    ///
    /// # Errors
    /// Returns error if no session is running or the write fails.
    pub async fn input(&self, data: &str) -> Result<(), PtyError> {
        let mut state = self.state.lock().await;
        let SessionState::Running(session) = &mut *state else {
            return Err(PtyError::NotRunning);
        };
        write_command(
            &mut session.stdin,
            &HelperCommand::Input {
                data: data.to_string(),
            },
        )
        .await
    }

    /// Resize the running session.
    ///
    /// # Errors
    /// Returns error if no session is running or the write fails.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let mut state = self.state.lock().await;
        let SessionState::Running(session) = &mut *state else {
            return Err(PtyError::NotRunning);
        };
        write_command(&mut session.stdin, &HelperCommand::Resize { cols, rows }).await
    }

    /// Stop the session. Returns whether anything was stopped.
    ///
    /// Publishes exactly one [`TerminalEvent::Exited`] for a running session;
    /// the helper's own exit notification is swallowed.
    ///
    /// # Errors
    /// Currently infallible; helper misbehaviour is handled by killing it.
    pub async fn stop(&self) -> Result<bool, PtyError> {
        let session = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, SessionState::Absent) {
                SessionState::Running(session) => {
                    *state = SessionState::Stopping {
                        id: session.id,
                        exit_code: None,
                    };
                    session
                }
                SessionState::Starting { id } => {
                    tracing::info!(session_id = id, "Cancelling terminal start");
                    return Ok(true);
                }
                other => {
                    *state = other;
                    return Ok(false);
                }
            }
        };

        let ActiveSession {
            id,
            mut child,
            mut stdin,
            mut reader,
            ..
        } = *session;

        if let Err(e) = write_command(&mut stdin, &HelperCommand::Stop).await {
            tracing::debug!(session_id = id, "Could not send stop to terminal helper: {e}");
        }
        drop(stdin);

        match timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(session_id = id, %status, "Terminal helper exited"),
            Ok(Err(e)) => tracing::warn!(session_id = id, "Failed to wait for terminal helper: {e}"),
            Err(_) => {
                tracing::warn!(session_id = id, "Terminal helper ignored stop, killing");
                let _ = child.kill().await;
            }
        }
        if timeout(READER_JOIN_TIMEOUT, &mut reader).await.is_err() {
            reader.abort();
        }

        let exit_code = {
            let mut state = self.state.lock().await;
            match &*state {
                SessionState::Stopping {
                    id: current,
                    exit_code,
                } if *current == id => {
                    let code = exit_code.unwrap_or(0);
                    *state = SessionState::Absent;
                    code
                }
                _ => 0,
            }
        };

        tracing::info!(session_id = id, exit_code, "Terminal session stopped");
        self.bus.publish(TerminalEvent::Exited { exit_code });
        Ok(true)
    }

    /// Current history; empty when no session is running.
    pub async fn history(&self) -> History {
        match &*self.state.lock().await {
            SessionState::Running(session) => History {
                data: session.history.read_all(),
                size: session.history.size(),
            },
            _ => History::default(),
        }
    }

    /// Current lifecycle phase.
    pub async fn phase(&self) -> SessionPhase {
        match &*self.state.lock().await {
            SessionState::Absent => SessionPhase::Absent,
            SessionState::Starting { .. } => SessionPhase::Starting,
            SessionState::Running(_) => SessionPhase::Running,
            SessionState::Stopping { .. } => SessionPhase::Stopping,
        }
    }

    /// Process id of the running helper.
    pub async fn helper_pid(&self) -> Option<u32> {
        match &*self.state.lock().await {
            SessionState::Running(session) => session.child.id(),
            _ => None,
        }
    }

    /// Stop any session as part of agent shutdown.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop().await {
            tracing::warn!("Terminal shutdown failed: {e}");
        }
    }

    async fn launch_helper(&self, request: &StartRequest) -> Result<PendingSession, PtyError> {
        let mut child = Command::new(&self.launch.program)
            .args(&self.launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PtyError::Spawn {
                program: self.launch.program.display().to_string(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("helper stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("helper stdout unavailable"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(relay_stderr(stderr));
        }

        let mut pending = PendingSession {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            shell: request.shell.clone(),
            pid: None,
            history: Arc::new(OutputRingBuffer::new(self.history_capacity)),
            early_output: Vec::new(),
        };

        let deadline = Instant::now() + HELPER_READY_TIMEOUT;
        loop {
            match next_event_before(&mut pending.lines, deadline, HELPER_READY_TIMEOUT).await? {
                HelperEvent::Ready => break,
                HelperEvent::Error { message } => return Err(PtyError::Helper(message)),
                HelperEvent::Exit { .. } => return Err(PtyError::HelperExited),
                other => tracing::debug!(?other, "Ignoring helper event before ready"),
            }
        }

        write_command(
            &mut pending.stdin,
            &HelperCommand::Start {
                shell: request.shell.clone(),
                cwd: request.cwd.clone(),
                cols: request.cols,
                rows: request.rows,
            },
        )
        .await?;

        let deadline = Instant::now() + HELPER_START_TIMEOUT;
        loop {
            match next_event_before(&mut pending.lines, deadline, HELPER_START_TIMEOUT).await? {
                HelperEvent::Started { shell, pid } => {
                    if !shell.is_empty() {
                        pending.shell = shell;
                    }
                    pending.pid = pid;
                    return Ok(pending);
                }
                HelperEvent::Output { data } => {
                    pending.history.write(data.as_bytes());
                    pending.early_output.push(data);
                }
                HelperEvent::Error { message } => return Err(PtyError::Helper(message)),
                HelperEvent::Exit { .. } => return Err(PtyError::HelperExited),
                HelperEvent::Ready => {}
            }
        }
    }
}

async fn next_event_before(
    lines: &mut HelperLines,
    deadline: Instant,
    limit: Duration,
) -> Result<HelperEvent, PtyError> {
    match timeout_at(deadline, next_event(lines)).await {
        Ok(Ok(Some(event))) => Ok(event),
        Ok(Ok(None)) => Err(PtyError::HelperExited),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(PtyError::Timeout(limit)),
    }
}

/// Next well-formed event; malformed lines are logged and skipped.
async fn next_event(lines: &mut HelperLines) -> Result<Option<HelperEvent>, PtyError> {
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<HelperEvent>(line) {
            Ok(event) => return Ok(Some(event)),
            Err(e) => tracing::warn!("Invalid terminal helper event: {e}"),
        }
    }
    Ok(None)
}

async fn write_command(stdin: &mut ChildStdin, command: &HelperCommand) -> Result<(), PtyError> {
    let line = encode_line(command)?;
    let write = async {
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await
    };
    timeout(HELPER_WRITE_TIMEOUT, write)
        .await
        .map_err(|_| PtyError::Timeout(HELPER_WRITE_TIMEOUT))??;
    Ok(())
}

async fn relay_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "pty_helper", "{line}");
    }
}

/// Relay helper events for one session until the helper goes away.
async fn read_events(
    id: u64,
    mut lines: HelperLines,
    history: Arc<OutputRingBuffer>,
    bus: EventBus,
    state: Arc<Mutex<SessionState>>,
) {
    let mut exit_code = None;
    loop {
        match next_event(&mut lines).await {
            Ok(Some(HelperEvent::Output { data })) => {
                history.write(data.as_bytes());
                bus.publish(TerminalEvent::Output { data });
            }
            Ok(Some(HelperEvent::Exit {
                exit_code: code,
                signal,
            })) => {
                tracing::debug!(session_id = id, ?code, ?signal, "Terminal helper reported exit");
                exit_code = code;
                break;
            }
            Ok(Some(HelperEvent::Error { message })) => {
                tracing::warn!(session_id = id, "Terminal helper error: {message}");
                bus.publish(TerminalEvent::Error { message });
            }
            Ok(Some(other)) => tracing::debug!(session_id = id, ?other, "Ignoring helper event"),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(session_id = id, "Terminal helper stream failed: {e}");
                break;
            }
        }
    }

    let mut guard = state.lock().await;
    let owns_session = matches!(&*guard, SessionState::Running(session) if session.id == id);
    if owns_session {
        let previous = std::mem::replace(&mut *guard, SessionState::Absent);
        drop(guard);
        drop(previous);
        let exit_code = exit_code.unwrap_or(UNKNOWN_EXIT_CODE);
        tracing::info!(session_id = id, exit_code, "Terminal session exited");
        bus.publish(TerminalEvent::Exited { exit_code });
    } else if let SessionState::Stopping {
        id: stopping,
        exit_code: recorded,
    } = &mut *guard
    {
        if *stopping == id {
            *recorded = exit_code;
        }
    }
}
