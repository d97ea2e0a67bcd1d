//! On-disk framing: items inside a buffer, chunks inside a log file.
//!
//! ```text
//! ChunkHeader: magic:u64 | size:u64 | sender_public_key:[u8; 128]
//! ItemHeader:  magic:u32 | size:u32
//! File:        (ChunkHeader Item*)*
//! ```
//!
//! All integers are little-endian. A chunk's `size` is the exact byte length of
//! the item stream that follows it, so a reader can skip whole chunks.

use crate::encryption::PUBLIC_KEY_SLOT_LEN;
use crate::error::{CoreError, CoreResult};

/// Sentinel opening every item.
pub const ITEM_MAGIC: u32 = 0xbe5f_ba11;

/// Sentinel opening every chunk.
pub const CHUNK_MAGIC: u64 = 0xdead_beef_dada_1100;

/// Header preceding one encrypted, compressed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemHeader {
    /// Always [`ITEM_MAGIC`] for a well-formed item.
    pub magic: u32,
    /// Length of the payload that follows.
    pub size: u32,
}

impl ItemHeader {
    /// Encoded length in bytes.
    pub const LEN: usize = 8;

    /// Header for a payload of `size` bytes.
    pub fn new(size: u32) -> Self {
        Self {
            magic: ITEM_MAGIC,
            size,
        }
    }

    /// Little-endian encoding.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    /// Parses a header at the start of `bytes`, checking the magic.
    pub fn parse(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() < Self::LEN {
            return Err(CoreError::Truncated {
                unit: "item header",
                needed: Self::LEN,
                available: bytes.len(),
            });
        }
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != ITEM_MAGIC {
            return Err(CoreError::BadMagic {
                unit: "item",
                expected: ITEM_MAGIC as u64,
                found: magic as u64,
            });
        }
        let size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self { magic, size })
    }
}

/// Appends a framed item (header followed by `payload`) to `out`.
pub fn encode_item(payload: &[u8], out: &mut Vec<u8>) -> CoreResult<()> {
    let size = u32::try_from(payload.len()).map_err(|_| CoreError::BufferOverflow {
        requested: payload.len() as u64,
        limit: u32::MAX as u64,
    })?;
    out.reserve(ItemHeader::LEN + payload.len());
    out.extend_from_slice(&ItemHeader::new(size).to_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Header preceding one drained buffer in a log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Always [`CHUNK_MAGIC`] for a well-formed chunk.
    pub magic: u64,
    /// Length of the item stream that follows.
    pub size: u64,
    /// Writer's session public key, zero-padded.
    pub sender_public_key: [u8; PUBLIC_KEY_SLOT_LEN],
}

impl ChunkHeader {
    /// Encoded length in bytes.
    pub const LEN: usize = 8 + 8 + PUBLIC_KEY_SLOT_LEN;

    /// Header for an item stream of `size` bytes written under `sender_public_key`.
    pub fn new(size: u64, sender_public_key: [u8; PUBLIC_KEY_SLOT_LEN]) -> Self {
        Self {
            magic: CHUNK_MAGIC,
            size,
            sender_public_key,
        }
    }

    /// Little-endian encoding.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..8].copy_from_slice(&self.magic.to_le_bytes());
        out[8..16].copy_from_slice(&self.size.to_le_bytes());
        out[16..].copy_from_slice(&self.sender_public_key);
        out
    }

    /// Parses a header at the start of `bytes`, checking the magic.
    pub fn parse(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() < Self::LEN {
            return Err(CoreError::Truncated {
                unit: "chunk header",
                needed: Self::LEN,
                available: bytes.len(),
            });
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[0..8]);
        let magic = u64::from_le_bytes(word);
        if magic != CHUNK_MAGIC {
            return Err(CoreError::BadMagic {
                unit: "chunk",
                expected: CHUNK_MAGIC,
                found: magic,
            });
        }
        word.copy_from_slice(&bytes[8..16]);
        let size = u64::from_le_bytes(word);
        let mut sender_public_key = [0u8; PUBLIC_KEY_SLOT_LEN];
        sender_public_key.copy_from_slice(&bytes[16..Self::LEN]);
        Ok(Self {
            magic,
            size,
            sender_public_key,
        })
    }
}

/// Iterates the items of one chunk's item stream.
///
/// Yields `Ok(payload)` per item. A bad magic or a payload running past the end
/// of the stream yields one error and ends the iteration.
#[derive(Debug)]
pub struct ItemIter<'a> {
    stream: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> ItemIter<'a> {
    /// Iterates `stream`, which must be exactly one chunk's item bytes.
    pub fn new(stream: &'a [u8]) -> Self {
        Self {
            stream,
            offset: 0,
            done: false,
        }
    }

    /// Byte offset of the next unread item.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for ItemIter<'a> {
    type Item = CoreResult<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.stream.len() {
            return None;
        }
        let rest = &self.stream[self.offset..];
        let header = match ItemHeader::parse(rest) {
            Ok(h) => h,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        let end = ItemHeader::LEN + header.size as usize;
        if rest.len() < end {
            self.done = true;
            return Some(Err(CoreError::Truncated {
                unit: "item payload",
                needed: end,
                available: rest.len(),
            }));
        }
        self.offset += end;
        Some(Ok(&rest[ItemHeader::LEN..end]))
    }
}
