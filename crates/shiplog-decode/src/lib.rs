#![warn(missing_docs)]

//! Shiplog offline decoder.
//!
//! Reads the `.log` chunk files a durable sink produced and renders every
//! record it can recover as one line of text. Only the receiver's private key
//! is needed: each chunk carries the sender public key it was encrypted under.

pub mod decoder;
pub mod error;
pub mod pattern;

pub use decoder::{DecodeStats, OfflineDecoder};
pub use error::{DecodeError, DecodeResult};
pub use pattern::{Pattern, DEFAULT_PATTERN};
