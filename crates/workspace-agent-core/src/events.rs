//! Agent events and the per-identity broadcast bus.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

/// Default bus capacity before slow subscribers start lagging.
const BUS_CAPACITY: usize = 10_000;

/// Which standard stream a command output line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Lifecycle and output of a dispatched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    Output {
        command_id: String,
        stream: OutputStream,
        data: String,
    },
    Completed {
        command_id: String,
        exit_code: i32,
    },
    Failed {
        command_id: String,
        exit_code: i32,
        error: String,
    },
    Busy {
        command_id: String,
    },
}

/// Lifecycle and output of the interactive terminal session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Started { shell: String },
    Output { data: String },
    Exited { exit_code: i32 },
    Error { message: String },
}

/// Anything the agent reports back to the control server unprompted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Command(CommandEvent),
    Terminal(TerminalEvent),
}

impl From<CommandEvent> for AgentEvent {
    fn from(event: CommandEvent) -> Self {
        Self::Command(event)
    }
}

impl From<TerminalEvent> for AgentEvent {
    fn from(event: TerminalEvent) -> Self {
        Self::Terminal(event)
    }
}

/// Broadcast bus carrying events from producers to the live connection.
///
/// Events published while nobody is subscribed (between connections) are
/// dropped; terminal output survives in the session history instead.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AgentEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(BUS_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to current subscribers.
    pub fn publish(&self, event: impl Into<AgentEvent>) {
        let _ = self.sender.send(event.into());
    }

    /// Get a receiver for live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Live events as a stream; lagged gaps are logged and skipped.
    #[must_use]
    pub fn stream(&self) -> futures::stream::BoxStream<'static, AgentEvent> {
        BroadcastStream::new(self.subscribe())
            .filter_map(|res| async move {
                match res {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event subscriber lagged, events dropped");
                        None
                    }
                }
            })
            .boxed()
    }
}
