//! Error types for task scheduling.

use thiserror::Error;

/// Result type alias for scheduling operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Scheduling failures. None of these are fatal to the caller.
#[derive(Debug, Error)]
pub enum SchedError {
    /// No runner is registered under the tag.
    #[error("Unknown task runner: {0}")]
    UnknownRunner(u64),

    /// The runner or timer has been shut down.
    #[error("Scheduler is shut down")]
    ShutDown,

    /// The task was dropped before it produced a result.
    #[error("Task dropped before completion")]
    TaskDropped,

    /// Spawning a worker thread failed.
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
