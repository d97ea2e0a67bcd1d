//! Error types for offline decoding.

use shiplog_core::CoreError;
use thiserror::Error;

/// Result type alias for decode operations.
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Failures that stop decoding a file.
///
/// Item-level damage never surfaces here; it is logged and counted instead.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Key parsing or another core failure.
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Reading the input or writing the output failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The bytes at `offset` are not a chunk header.
    #[error("Bad chunk magic at offset {offset}: found {found:#x}")]
    BadChunkMagic {
        /// File offset of the damaged header.
        offset: usize,
        /// Value found where the magic should be.
        found: u64,
    },

    /// The file ends inside the chunk starting at `offset`.
    #[error("Truncated chunk at offset {offset}: need {needed} bytes, {available} available")]
    TruncatedChunk {
        /// File offset of the chunk header.
        offset: usize,
        /// Bytes the chunk claims.
        needed: usize,
        /// Bytes left in the file.
        available: usize,
    },
}
