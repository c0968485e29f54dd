//! Composition root for the workspace agent.
//!
//! Provides:
//! - Config discovery (CLI argument or environment) and token override
//! - `AgentRunner` - One connection manager per configured identity

pub mod config;
pub mod runner;

pub use config::{CONFIG_ENV, LaunchError, TOKEN_ENV};
pub use runner::{AgentHandle, AgentRunner};
