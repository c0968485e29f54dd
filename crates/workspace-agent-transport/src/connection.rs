//! Reconnecting client connection to the control server.
//!
//! One [`ConnectionManager`] per agent identity. Each connection gets a
//! child cancellation token shared by its writer task, heartbeat task and
//! receive loop; cancelling it tears the whole connection down and the
//! manager reconnects after a backoff delay.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::{
    SinkExt, StreamExt,
    stream::{BoxStream, SplitSink},
};
use thiserror::Error;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION, header::InvalidHeaderValue},
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;
use uuid::Uuid;
use workspace_agent_core::{AgentEvent, AgentIdentity, AgentSettings, EventBus};
use workspace_agent_executor::{CommandDispatcher, CommandRequest};
use workspace_agent_pty::{
    DEFAULT_COLS, DEFAULT_ROWS, ShellKind, StartRequest, TerminalController, available_shells,
    default_shell,
};

use crate::{
    backoff::Backoff,
    heartbeat::{HeartbeatOutcome, run_heartbeat},
    protocol::{DecodeError, InboundMessage, OutboundMessage, decode_inbound},
    uploads::FileWrites,
};

/// How long a graceful close may take before the socket is dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Invalid server URL: {0}")]
    InvalidUrl(#[source] tungstenite::Error),
    #[error("Token is not a valid header value: {0}")]
    InvalidToken(#[from] InvalidHeaderValue),
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("Connection closed by server")]
    Closed,
    #[error("Heartbeat went unanswered")]
    HeartbeatTimeout,
    #[error("Connection aborted")]
    Aborted,
}

/// Lifecycle of the current connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Per-connection handles the receive loop routes into.
struct Session {
    replies: mpsc::UnboundedSender<OutboundMessage>,
    acks: mpsc::UnboundedSender<()>,
    uploads: FileWrites,
}

/// Keeps one identity connected and routes its traffic.
pub struct ConnectionManager {
    identity: AgentIdentity,
    settings: AgentSettings,
    bus: EventBus,
    dispatcher: Arc<CommandDispatcher>,
    terminal: Arc<TerminalController>,
    default_shell: ShellKind,
    state: Mutex<ConnectionState>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(
        identity: AgentIdentity,
        settings: AgentSettings,
        bus: EventBus,
        dispatcher: Arc<CommandDispatcher>,
        terminal: Arc<TerminalController>,
    ) -> Self {
        let default_shell = configured_shell(&identity);
        Self {
            identity,
            settings,
            bus,
            dispatcher,
            terminal,
            default_shell,
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    #[must_use]
    pub const fn default_shell(&self) -> ShellKind {
        self.default_shell
    }

    /// Connect, serve, and reconnect until `shutdown` is cancelled.
    ///
    /// Never fails: transport and protocol errors are logged and retried.
    pub async fn run(&self, shutdown: CancellationToken) {
        let agent = self.identity.display_name();
        let mut backoff = Backoff::from_settings(&self.settings);

        loop {
            self.set_state(ConnectionState::Connecting);
            let connected = self.connect(&shutdown).await;
            match connected {
                Ok(Some(stream)) => {
                    backoff.reset();
                    let served = self.serve(stream, &shutdown).await;
                    self.set_state(ConnectionState::Disconnected);
                    if let Err(e) = served {
                        tracing::warn!(agent, "Connection lost: {e}");
                    }
                }
                Ok(None) => {
                    self.set_state(ConnectionState::Disconnected);
                    break;
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    tracing::warn!(agent, attempt = backoff.attempts(), "Connect failed: {e}");
                }
            }
            if shutdown.is_cancelled() {
                break;
            }

            let attempt = backoff.attempts();
            let delay = backoff.next_delay();
            tracing::info!(
                agent,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting"
            );
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        tracing::info!(agent, "Connection manager stopped");
    }

    /// Open the WebSocket. `Ok(None)` means shutdown interrupted it.
    async fn connect(&self, shutdown: &CancellationToken) -> Result<Option<WsStream>, ConnectionError> {
        let mut request = self
            .identity
            .url
            .as_str()
            .into_client_request()
            .map_err(ConnectionError::InvalidUrl)?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.identity.token))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let limit = self.settings.connect_timeout();
        tracing::debug!(agent = self.identity.display_name(), url = %self.identity.url, "Connecting");
        tokio::select! {
            () = shutdown.cancelled() => Ok(None),
            result = tokio::time::timeout(limit, connect_async(request)) => {
                let (stream, response) = result.map_err(|_| ConnectionError::Timeout(limit))??;
                tracing::debug!(status = %response.status(), "WebSocket upgrade accepted");
                Ok(Some(stream))
            }
        }
    }

    /// Run one established connection until it fails or shutdown.
    async fn serve(&self, stream: WsStream, shutdown: &CancellationToken) -> Result<(), ConnectionError> {
        let connection_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "connection",
            agent = self.identity.display_name(),
            %connection_id
        );
        self.serve_connection(stream, shutdown).instrument(span).await
    }

    async fn serve_connection(
        &self,
        stream: WsStream,
        shutdown: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Connected);
        let connection = shutdown.child_token();
        let (sink, mut source) = stream.split();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        // Subscribe before the handshake so nothing published after it is missed.
        let events = self.bus.stream();
        let _ = reply_tx.send(self.handshake().await);
        tracing::info!("Connected");

        let mut writer = tokio::spawn(write_loop(sink, reply_rx, events, connection.clone()));
        let heartbeat = tokio::spawn(run_heartbeat(
            self.settings.heartbeat_interval(),
            self.settings.heartbeat_max_missed,
            reply_tx.clone(),
            ack_rx,
            connection.clone(),
        ));

        let mut session = Session {
            replies: reply_tx,
            acks: ack_tx,
            uploads: FileWrites::new(&self.identity.working_dir),
        };

        let ended = loop {
            let frame = tokio::select! {
                () = connection.cancelled() => break Err(ConnectionError::Aborted),
                frame = source.next() => frame,
            };
            match frame {
                None => break Err(ConnectionError::Closed),
                Some(Err(e)) => break Err(e.into()),
                Some(Ok(Message::Text(text))) => self.handle_text(text.as_str(), &mut session).await,
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.handle_text(text, &mut session).await,
                    Err(e) => tracing::warn!("Dropping non-UTF-8 binary frame: {e}"),
                },
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(?frame, "Server closed the connection");
                    break Err(ConnectionError::Closed);
                }
                Some(Ok(_)) => {}
            }
        };

        self.set_state(ConnectionState::Closing);
        connection.cancel();
        let heartbeat = heartbeat.await.unwrap_or_else(|e| {
            tracing::error!("Heartbeat task failed: {e}");
            HeartbeatOutcome::Stopped
        });
        if session.uploads.pending_count() > 0 {
            tracing::debug!(pending = session.uploads.pending_count(), "Discarding unfinished file writes");
        }

        if shutdown.is_cancelled() {
            // A writer wedged on a peer that stopped reading is abandoned.
            match tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await {
                Ok(Ok(sink)) => close_gracefully(sink).await,
                Ok(Err(e)) => tracing::debug!("Writer task failed: {e}"),
                Err(_) => {
                    tracing::debug!("Writer did not finish, dropping socket");
                    writer.abort();
                }
            }
            tracing::info!("Disconnected for shutdown");
            return Ok(());
        }
        writer.abort();
        if heartbeat == HeartbeatOutcome::TimedOut {
            return Err(ConnectionError::HeartbeatTimeout);
        }
        ended
    }

    async fn handshake(&self) -> OutboundMessage {
        let available = available_shells().await;
        OutboundMessage::AgentConnected {
            agent_id: self.identity.agent_id.clone(),
            workspace_id: self.identity.workspace_id.clone(),
            name: self.identity.display_name().to_string(),
            capabilities: self.identity.capabilities.clone(),
            default_shell: self.default_shell.as_str().to_string(),
            available_shells: available.iter().map(|shell| shell.as_str().to_string()).collect(),
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    async fn handle_text(&self, text: &str, session: &mut Session) {
        match decode_inbound(text) {
            Ok(message) => self.route(message, session).await,
            Err(DecodeError::UnknownType(kind)) => {
                tracing::debug!(kind, "Ignoring unknown message type");
            }
            Err(e) => tracing::warn!("Dropping malformed message: {e}"),
        }
    }

    async fn route(&self, message: InboundMessage, session: &mut Session) {
        match message {
            InboundMessage::CommandExecute {
                command_id,
                command,
                shell,
            } => {
                tracing::info!(%command_id, "Command requested");
                let request = CommandRequest {
                    command_id,
                    command,
                    shell,
                };
                self.dispatcher.submit(request, &self.bus);
            }
            InboundMessage::PtyStart {
                shell,
                cwd,
                cols,
                rows,
            } => {
                let request = StartRequest {
                    shell: self.terminal_program(shell.as_deref()),
                    cwd: self.resolve_cwd(cwd.as_deref()),
                    cols: cols.unwrap_or(DEFAULT_COLS),
                    rows: rows.unwrap_or(DEFAULT_ROWS),
                };
                // Starting waits on the helper; keep the receive loop free.
                let terminal = Arc::clone(&self.terminal);
                tokio::spawn(
                    async move {
                        if let Err(e) = terminal.start(request).await {
                            tracing::warn!("Terminal start failed: {e}");
                        }
                    }
                    .in_current_span(),
                );
            }
            InboundMessage::PtyInput { data } => {
                if let Err(e) = self.terminal.input(&data).await {
                    tracing::debug!("Terminal input dropped: {e}");
                }
            }
            InboundMessage::PtyResize { cols, rows } => {
                if let Err(e) = self.terminal.resize(cols, rows).await {
                    tracing::debug!("Terminal resize dropped: {e}");
                }
            }
            InboundMessage::PtyStop => {
                let terminal = Arc::clone(&self.terminal);
                tokio::spawn(
                    async move {
                        if let Err(e) = terminal.stop().await {
                            tracing::warn!("Terminal stop failed: {e}");
                        }
                    }
                    .in_current_span(),
                );
            }
            InboundMessage::PtyHistoryRequest { request_id } => {
                let history = self.terminal.history().await;
                let _ = session.replies.send(OutboundMessage::PtyHistory {
                    data: history.data,
                    buffer_size: history.size,
                    request_id,
                });
            }
            InboundMessage::FileWriteStart { id, path } => session.uploads.begin(&id, &path),
            InboundMessage::FileWriteChunk { id, data } => {
                if let Err(e) = session.uploads.append(&id, &data) {
                    tracing::warn!("File write chunk rejected: {e}");
                }
            }
            InboundMessage::FileWriteEnd { id } => {
                if let Err(e) = session.uploads.finish(&id).await {
                    tracing::warn!("File write failed: {e}");
                }
            }
            InboundMessage::HeartbeatAck => {
                let _ = session.acks.send(());
            }
        }
    }

    /// Program the helper should run for a requested shell name.
    fn terminal_program(&self, shell: Option<&str>) -> String {
        match shell.map(str::trim).filter(|name| !name.is_empty()) {
            None => self.default_shell.program().to_string(),
            Some(name) => name
                .parse::<ShellKind>()
                .map_or_else(|_| name.to_string(), |kind| kind.program().to_string()),
        }
    }

    fn resolve_cwd(&self, cwd: Option<&Path>) -> PathBuf {
        match cwd {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => self.identity.working_dir.join(path),
            None => self.identity.working_dir.clone(),
        }
    }
}

/// Default shell for `identity`: its configured shell, else the platform's.
#[must_use]
pub fn configured_shell(identity: &AgentIdentity) -> ShellKind {
    match identity.default_shell.as_deref().map(str::parse::<ShellKind>) {
        Some(Ok(shell)) => shell,
        Some(Err(e)) => {
            tracing::warn!(agent = identity.display_name(), "{e}, using platform default");
            default_shell()
        }
        None => default_shell(),
    }
}

/// Forward direct replies and bus events to the socket until cancelled.
///
/// Returns the sink so the caller can close it.
async fn write_loop(
    mut sink: WsSink,
    mut replies: mpsc::UnboundedReceiver<OutboundMessage>,
    mut events: BoxStream<'static, AgentEvent>,
    connection: CancellationToken,
) -> WsSink {
    loop {
        let message = tokio::select! {
            biased;
            () = connection.cancelled() => break,
            Some(reply) = replies.recv() => reply,
            Some(event) = events.next() => OutboundMessage::from(event),
            else => break,
        };
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to serialize message: {e}");
                continue;
            }
        };
        let sent = tokio::select! {
            () = connection.cancelled() => break,
            sent = sink.send(Message::text(text)) => sent,
        };
        if let Err(e) = sent {
            tracing::warn!("Send failed: {e}");
            connection.cancel();
            break;
        }
    }
    sink
}

async fn close_gracefully(mut sink: WsSink) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "agent shutting down".into(),
    };
    let close = async {
        sink.send(Message::Close(Some(frame))).await?;
        sink.close().await
    };
    match tokio::time::timeout(CLOSE_TIMEOUT, close).await {
        Ok(Ok(())) => tracing::debug!("Close frame sent"),
        Ok(Err(e)) => tracing::debug!("Close failed: {e}"),
        Err(_) => tracing::debug!("Close timed out"),
    }
}
