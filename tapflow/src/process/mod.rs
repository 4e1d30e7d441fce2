//! Supervision of connector child processes.

pub mod command;
pub mod failure;
pub mod supervisor;

pub use failure::FailureSummary;
pub use supervisor::{
    ConnectorRole, ProcessExit, ProcessHandle, ProcessSignaller, ProcessSpec, Signal, StdioMode,
    start,
};
