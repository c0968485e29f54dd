//! Shell command execution for the workspace agent.
//!
//! Provides:
//! - Shell invocation building
//! - Process-group spawning with tree kill
//! - The single-flight command dispatcher

pub mod command;
pub mod dispatcher;
pub mod runner;

pub use command::{CommandBuildError, CommandParts};
pub use dispatcher::{
    CommandDispatcher, CommandOutcome, CommandRequest, DEFAULT_COMMAND_TIMEOUT, DispatchError,
    ExecutionPermit, FAILURE_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
pub use runner::{ProcessRunner, RunnerError, SpawnedProcess, exit_code};
