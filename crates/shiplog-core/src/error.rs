//! Error types for the shiplog core.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error variants for buffering, codec and crypto operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Mapping the backing file into memory failed.
    #[error("Failed to map {path}: {reason}")]
    MapFailed {
        /// The backing file.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// The buffer has no valid mapping or its header magic is wrong.
    #[error("Mapped buffer is not valid")]
    InvalidMapping,

    /// A push would exceed the 32-bit logical size of a buffer.
    #[error("Buffer overflow: {requested} bytes requested, limit {limit}")]
    BufferOverflow {
        /// Logical size that would result from the push.
        requested: u64,
        /// Largest representable logical size.
        limit: u64,
    },

    /// Compression operation failed.
    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    /// Decompression operation failed.
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    /// Encryption operation failed.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed, usually a wrong key or a damaged payload.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// A key could not be parsed or is not on the curve.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Record serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A frame header carried the wrong sentinel.
    #[error("Bad {unit} magic: expected {expected:#x}, found {found:#x}")]
    BadMagic {
        /// Which frame kind was being parsed.
        unit: &'static str,
        /// The sentinel that should have been present.
        expected: u64,
        /// The value actually read.
        found: u64,
    },

    /// Not enough bytes left to parse a frame.
    #[error("Truncated {unit}: need {needed} bytes, {available} available")]
    Truncated {
        /// Which frame kind was being parsed.
        unit: &'static str,
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },
}
