#![warn(missing_docs)]

//! Shiplog core: the building blocks of the durable, encrypted log write path.
//!
//! Write path: Record → Format (bincode) → Compress (zstd stream) → Encrypt (AES-256-CBC)
//!             → Item → MappedBuffer → Chunk → log file
//! Read path:  Chunk → ECDH key from header → Item → Decrypt → Decompress → Record

pub mod buffer;
pub mod compression;
pub mod encryption;
pub mod error;
pub mod formatter;
pub mod frame;
pub mod record;

pub use buffer::{MappedBuffer, DEFAULT_BUFFER_CAPACITY};
pub use compression::{Compress, Decompress, ZstdCompressor, ZstdDecompressor, DEFAULT_COMPRESSION_LEVEL};
pub use encryption::{AesCbcCrypt, Decrypt, Encrypt, SessionKeys, SharedSecret};
pub use error::{CoreError, CoreResult};
pub use formatter::{decode_record, BinaryFormatter, Format};
pub use frame::{encode_item, ChunkHeader, ItemHeader, ItemIter, CHUNK_MAGIC, ITEM_MAGIC};
pub use record::{Level, Location, LogRecord};
