//! Error types for the durable sink.

use shiplog_core::CoreError;
use shiplog_sched::SchedError;
use thiserror::Error;

/// Result type alias for sink operations.
pub type SinkResult<T> = Result<T, SinkError>;

/// Errors surfaced by sink construction, flush and configuration.
///
/// The per-record logging path never returns these; it logs and counts drops.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Buffer, codec or crypto failure.
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Scheduler failure.
    #[error("Scheduler error: {0}")]
    Sched(#[from] SchedError),

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration is unusable.
    #[error("Invalid configuration: {0}")]
    Config(String),
}
