//! Streaming zstd compression for the item stream of a chunk.
//!
//! Every record is compressed into the same zstd frame and flushed, so a single
//! item does not need the bytes of later items to decode. Resetting the stream
//! starts a new frame; the decoder notices the frame magic at the head of an item
//! and resets its own state to match.

use std::io;

use tracing::warn;
use zstd::stream::raw::{Decoder, Encoder, InBuffer, Operation, OutBuffer};

use crate::error::{CoreError, CoreResult};

/// Default zstd level for the hot path.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 5;

/// Little-endian zstd frame magic (0xFD2FB528).
pub const ZSTD_FRAME_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

const FRAME_OVERHEAD: usize = 32;
const MIN_DECOMPRESS_CAPACITY: usize = 10 * 1024;

/// Whether `input` begins a new compressed stream.
pub fn starts_new_stream(input: &[u8]) -> bool {
    input.len() >= ZSTD_FRAME_MAGIC.len() && input[..ZSTD_FRAME_MAGIC.len()] == ZSTD_FRAME_MAGIC
}

/// Stateful compressor used by the write path.
pub trait Compress: Send {
    /// Starts a new independently decodable stream.
    fn reset_stream(&mut self);

    /// Compresses `input` into `output` (replacing its contents), returning the
    /// number of bytes written. Returns 0 on failure; never panics.
    fn compress(&mut self, input: &[u8], output: &mut Vec<u8>) -> usize;

    /// Upper bound on the compressed size of `input_len` bytes.
    fn compressed_bound(&self, input_len: usize) -> usize;
}

/// Stateful decompressor used by the offline decoder.
pub trait Decompress: Send {
    /// Decodes the next item of the stream. Returns an empty vector on failure.
    fn decompress(&mut self, input: &[u8]) -> Vec<u8>;
}

/// zstd streaming compressor.
pub struct ZstdCompressor {
    encoder: Encoder<'static>,
    level: i32,
}

impl std::fmt::Debug for ZstdCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZstdCompressor")
            .field("level", &self.level)
            .finish()
    }
}

impl ZstdCompressor {
    /// Creates a compressor at the given zstd level.
    pub fn new(level: i32) -> CoreResult<Self> {
        let encoder =
            Encoder::new(level).map_err(|e| CoreError::CompressionFailed(e.to_string()))?;
        Ok(Self { encoder, level })
    }

    fn compress_into(&mut self, input: &[u8], output: &mut [u8]) -> io::Result<usize> {
        let mut src = InBuffer::around(input);
        let mut dst = OutBuffer::around(output);

        while src.pos() < input.len() {
            self.encoder.run(&mut src, &mut dst)?;
            if src.pos() < input.len() && dst.pos() == dst.capacity() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "compressed output exceeds bound",
                ));
            }
        }
        while self.encoder.flush(&mut dst)? > 0 {
            if dst.pos() == dst.capacity() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "compressed output exceeds bound",
                ));
            }
        }
        Ok(dst.pos())
    }
}

impl Compress for ZstdCompressor {
    fn reset_stream(&mut self) {
        if let Err(e) = self.encoder.reinit() {
            warn!(error = %e, "zstd stream reset failed");
        }
    }

    fn compress(&mut self, input: &[u8], output: &mut Vec<u8>) -> usize {
        output.clear();
        if input.is_empty() {
            return 0;
        }
        output.resize(self.compressed_bound(input.len()), 0);
        match self.compress_into(input, output.as_mut_slice()) {
            Ok(written) => {
                output.truncate(written);
                written
            }
            Err(e) => {
                warn!(error = %e, input_len = input.len(), "zstd compression failed");
                output.clear();
                // The frame is now in an unknown state; the next item starts a fresh one.
                self.reset_stream();
                0
            }
        }
    }

    fn compressed_bound(&self, input_len: usize) -> usize {
        zstd::zstd_safe::compress_bound(input_len) + FRAME_OVERHEAD
    }
}

/// zstd streaming decompressor.
pub struct ZstdDecompressor {
    decoder: Decoder<'static>,
}

impl std::fmt::Debug for ZstdDecompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZstdDecompressor").finish()
    }
}

impl ZstdDecompressor {
    /// Creates a decompressor with fresh stream state.
    pub fn new() -> CoreResult<Self> {
        let decoder = Decoder::new().map_err(|e| CoreError::DecompressionFailed(e.to_string()))?;
        Ok(Self { decoder })
    }

    fn decompress_into(&mut self, input: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = vec![0u8; input.len().saturating_mul(4).max(MIN_DECOMPRESS_CAPACITY)];
        let mut filled = 0usize;
        let mut src = InBuffer::around(input);

        loop {
            let consumed_before = src.pos();
            let written = {
                let mut dst = OutBuffer::around(&mut out[filled..]);
                self.decoder.run(&mut src, &mut dst)?;
                dst.pos()
            };
            filled += written;

            if src.pos() == input.len() && filled < out.len() {
                break;
            }
            if filled == out.len() {
                let grown = out.len() * 2;
                out.resize(grown, 0);
            } else if written == 0 && src.pos() == consumed_before {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "zstd decoder made no progress",
                ));
            }
        }

        out.truncate(filled);
        Ok(out)
    }
}

impl Decompress for ZstdDecompressor {
    fn decompress(&mut self, input: &[u8]) -> Vec<u8> {
        if input.is_empty() {
            return Vec::new();
        }
        if starts_new_stream(input) {
            if let Err(e) = self.decoder.reinit() {
                warn!(error = %e, "zstd decoder reset failed");
                return Vec::new();
            }
        }
        match self.decompress_into(input) {
            Ok(out) => out,
            Err(e) => {
                warn!(error = %e, input_len = input.len(), "zstd decompression failed");
                Vec::new()
            }
        }
    }
}
