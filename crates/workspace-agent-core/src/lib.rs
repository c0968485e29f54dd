//! Core building blocks for the workspace agent.
//!
//! This crate provides:
//! - `OutputRingBuffer` - Bounded, text-safe terminal history
//! - `AgentIdentity` / `AgentConfig` - Identity and settings records
//! - `EventBus` - Broadcast of command and terminal events

pub mod events;
pub mod identity;
pub mod ring_buffer;

pub use events::{AgentEvent, CommandEvent, EventBus, OutputStream, TerminalEvent};
pub use identity::{AgentConfig, AgentIdentity, AgentSettings, ConfigError};
pub use ring_buffer::OutputRingBuffer;
