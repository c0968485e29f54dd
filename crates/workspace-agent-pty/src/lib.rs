//! Interactive terminal sessions for the workspace agent.
//!
//! Provides:
//! - `TerminalController` - One PTY session at a time via a helper process
//! - The helper line protocol and its `portable-pty` implementation
//! - Shell detection utilities for Unix and Windows

pub mod controller;
pub mod helper;
pub mod host;
pub mod shell;

pub use controller::{
    DEFAULT_COLS, DEFAULT_ROWS, HelperLaunch, History, PtyError, SessionPhase, StartOutcome,
    StartRequest, TerminalController,
};
pub use helper::{HelperCommand, HelperEvent};
pub use shell::{ShellKind, UnknownShell, available_shells, default_shell, resolve_executable_path};
