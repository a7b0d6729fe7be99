//! Ownership of the one agent subprocess behind a chat session.

pub mod decode;
pub mod launch;
pub mod process;

pub use launch::LaunchSpec;
pub use process::{
    AgentProcess, BoxFuture, ExitInfo, ProcessError, ProcessEvent, ProcessManager,
    DEFAULT_GRACE_PERIOD, DEFAULT_STOP_TIMEOUT,
};
