/// Core types shared across the telepilot system
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle state of a job.
///
/// Transitions are one-way: `Running` moves to exactly one of the terminal
/// states and never back. `Stopped` wins over `Exited` when an operator stop
/// lands before the reaper observes the exit.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    /// Child process is alive.
    Running,
    /// Child exited or died on its own.
    Exited,
    /// An operator issued a stop while the job was running.
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Exited => write!(f, "EXITED"),
            JobStatus::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Custom error types for telepilot
#[derive(Error, Debug)]
pub enum TelePilotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("job not found")]
    JobNotFound,

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Block device error: {0}")]
    BlockDevice(String),

    #[error("Start failed: {0}")]
    StartFailed(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Namespace isolation error: {0}")]
    Namespace(String),

    #[error("Broadcast error: {0}")]
    Broadcast(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Failure reported by the supervisor over the wire.
    #[error("{0}")]
    Remote(String),
}

impl From<nix::errno::Errno> for TelePilotError {
    fn from(err: nix::errno::Errno) -> Self {
        TelePilotError::Process(err.to_string())
    }
}

/// Result type alias for telepilot operations
pub type Result<T> = std::result::Result<T, TelePilotError>;
