//! Control-server transport for the workspace agent.
//!
//! Provides:
//! - Wire protocol (JSON envelopes with a `type` discriminator)
//! - Reconnect backoff and heartbeat supervision
//! - Chunked file-write reassembly
//! - `ConnectionManager` - WebSocket client and message routing

pub mod backoff;
pub mod connection;
pub mod heartbeat;
pub mod protocol;
pub mod uploads;

pub use backoff::Backoff;
pub use connection::{ConnectionError, ConnectionManager, ConnectionState, configured_shell};
pub use heartbeat::{HeartbeatOutcome, HeartbeatTracker, run_heartbeat};
pub use protocol::{DecodeError, InboundMessage, OutboundMessage, decode_inbound};
pub use uploads::{FileWrites, MAX_UPLOAD_BYTES, UploadError};
