//! Offline decoding of chunk files back into text.
//!
//! Each chunk is decoded independently: the shared secret is re-derived from the
//! sender key in its header and a fresh decompressor is used. Damage is
//! contained to the smallest unit possible. An item that fails to decrypt,
//! decompress or deserialize is skipped. A bad item header abandons the rest
//! of its chunk. A bad chunk header stops the file, since chunk boundaries can
//! no longer be trusted.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use shiplog_core::encryption::public_key_from_slot;
use shiplog_core::frame::ItemIter;
use shiplog_core::{
    decode_record, AesCbcCrypt, ChunkHeader, CoreError, Decompress, Decrypt, LogRecord,
    SessionKeys, ZstdDecompressor,
};
use tracing::{debug, info, warn};

use crate::error::{DecodeError, DecodeResult};
use crate::pattern::Pattern;

/// Counters for one decode run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Chunks whose header parsed.
    pub chunks: usize,
    /// Lines rendered.
    pub lines: usize,
    /// Items that could not be decrypted, decompressed or deserialized.
    pub skipped_items: usize,
    /// Chunks cut short by a bad item header or an unusable sender key.
    pub abandoned_chunks: usize,
}

/// Decodes chunk files with the receiver's private key.
#[derive(Debug, Clone)]
pub struct OfflineDecoder {
    receiver: SessionKeys,
    pattern: Pattern,
}

impl OfflineDecoder {
    /// Decoder for `receiver` using the default pattern.
    pub fn new(receiver: SessionKeys) -> Self {
        Self {
            receiver,
            pattern: Pattern::default(),
        }
    }

    /// Decoder for a hex-encoded receiver private key.
    pub fn from_secret_hex(secret_hex: &str) -> DecodeResult<Self> {
        Ok(Self::new(SessionKeys::from_secret_hex(secret_hex)?))
    }

    /// Replaces the line pattern.
    pub fn with_pattern(mut self, pattern: Pattern) -> Self {
        self.pattern = pattern;
        self
    }

    fn decode_item(
        &self,
        crypt: &AesCbcCrypt,
        decompressor: &mut ZstdDecompressor,
        payload: &[u8],
    ) -> Result<LogRecord, CoreError> {
        let compressed = crypt.decrypt(payload)?;
        let plain = decompressor.decompress(&compressed);
        if plain.is_empty() {
            return Err(CoreError::DecompressionFailed("item produced no output".into()));
        }
        decode_record(&plain)
    }

    /// Renders the items of one chunk into `out`.
    pub fn decode_chunk(&self, header: &ChunkHeader, items: &[u8], out: &mut String, stats: &mut DecodeStats) {
        let sender = match public_key_from_slot(&header.sender_public_key) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "unusable sender key, skipping chunk");
                stats.abandoned_chunks += 1;
                return;
            }
        };
        let crypt = AesCbcCrypt::new(self.receiver.agree(&sender));
        let mut decompressor = match ZstdDecompressor::new() {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "cannot create decompressor, skipping chunk");
                stats.abandoned_chunks += 1;
                return;
            }
        };

        let mut iter = ItemIter::new(items);
        while let Some(item) = iter.next() {
            match item {
                Ok(payload) => match self.decode_item(&crypt, &mut decompressor, payload) {
                    Ok(record) => {
                        self.pattern.render(&record, out);
                        stats.lines += 1;
                    }
                    Err(e) => {
                        debug!(error = %e, "skipping undecodable item");
                        stats.skipped_items += 1;
                    }
                },
                Err(e) => {
                    warn!(offset = iter.offset(), error = %e, "damaged item, abandoning rest of chunk");
                    stats.abandoned_chunks += 1;
                    break;
                }
            }
        }
    }

    /// Decodes a whole file image, handing each chunk's text to `sink`.
    ///
    /// Chunks decoded before a fatal error have already been passed to `sink`.
    pub fn decode_bytes<F>(&self, bytes: &[u8], mut sink: F) -> DecodeResult<DecodeStats>
    where
        F: FnMut(&str) -> DecodeResult<()>,
    {
        let mut stats = DecodeStats::default();
        let mut offset = 0usize;
        let mut text = String::new();

        while offset < bytes.len() {
            let rest = &bytes[offset..];
            let header = match ChunkHeader::parse(rest) {
                Ok(header) => header,
                Err(CoreError::BadMagic { found, .. }) => {
                    return Err(DecodeError::BadChunkMagic { offset, found });
                }
                Err(CoreError::Truncated { needed, available, .. }) => {
                    return Err(DecodeError::TruncatedChunk { offset, needed, available });
                }
                Err(e) => return Err(e.into()),
            };
            stats.chunks += 1;

            let start = ChunkHeader::LEN;
            let needed = start.saturating_add(header.size as usize);
            let end = needed.min(rest.len());
            text.clear();
            self.decode_chunk(&header, &rest[start..end], &mut text, &mut stats);
            sink(&text)?;

            if needed > rest.len() {
                return Err(DecodeError::TruncatedChunk {
                    offset,
                    needed,
                    available: rest.len(),
                });
            }
            offset += needed;
        }
        Ok(stats)
    }

    /// Decodes `input` and appends the text to `output`, one write per chunk.
    pub fn decode_file(&self, input: &Path, output: &Path) -> DecodeResult<DecodeStats> {
        let bytes = fs::read(input)?;
        let mut out = OpenOptions::new().create(true).append(true).open(output)?;
        let stats = self.decode_bytes(&bytes, |text| {
            out.write_all(text.as_bytes())?;
            Ok(())
        })?;
        info!(
            input = %input.display(),
            chunks = stats.chunks,
            lines = stats.lines,
            skipped = stats.skipped_items,
            "decode finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shiplog_core::{
        encode_item, BinaryFormatter, Compress, Encrypt, Format, Level, Location, ZstdCompressor,
    };

    struct Writer {
        sender: SessionKeys,
        crypt: AesCbcCrypt,
        compressor: ZstdCompressor,
    }

    impl Writer {
        fn new(receiver: &SessionKeys) -> Self {
            let sender = SessionKeys::generate();
            let peer = shiplog_core::encryption::parse_public_key(&receiver.public_key_bytes()).unwrap();
            let crypt = AesCbcCrypt::new(sender.agree(&peer));
            Self {
                sender,
                crypt,
                compressor: ZstdCompressor::new(3).unwrap(),
            }
        }

        fn chunk(&mut self, messages: &[&str]) -> Vec<u8> {
            self.compressor.reset_stream();
            let mut items = Vec::new();
            for msg in messages {
                let record = LogRecord::new(Level::Info, Location::new("w.rs", 1, "w"), *msg);
                let mut formatted = Vec::new();
                BinaryFormatter.format(&record, &mut formatted).unwrap();
                let mut compressed = Vec::new();
                self.compressor.compress(&formatted, &mut compressed);
                let mut encrypted = Vec::new();
                self.crypt.encrypt(&compressed, &mut encrypted).unwrap();
                encode_item(&encrypted, &mut items).unwrap();
            }
            let mut out = ChunkHeader::new(items.len() as u64, self.sender.public_key_slot())
                .to_bytes()
                .to_vec();
            out.extend_from_slice(&items);
            out
        }
    }

    fn messages_of(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    fn decode_all(decoder: &OfflineDecoder, bytes: &[u8]) -> (DecodeResult<DecodeStats>, String) {
        let mut all = String::new();
        let result = decoder.decode_bytes(bytes, |text| {
            all.push_str(text);
            Ok(())
        });
        (result, all)
    }

    #[test]
    fn test_two_chunks_decode() {
        let receiver = SessionKeys::generate();
        let mut writer = Writer::new(&receiver);
        let mut file = writer.chunk(&["one", "two"]);
        file.extend(writer.chunk(&["three"]));

        let decoder = OfflineDecoder::new(receiver).with_pattern(Pattern::compile("%v"));
        let (result, text) = decode_all(&decoder, &file);
        let stats = result.unwrap();
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.lines, 3);
        assert_eq!(messages_of(&text), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_bad_item_magic_abandons_only_that_chunk() {
        let receiver = SessionKeys::generate();
        let mut writer = Writer::new(&receiver);
        let mut file = writer.chunk(&["a1", "a2", "a3"]);
        // Corrupt the second item header of the first chunk.
        let first_item_len = {
            let h = shiplog_core::ItemHeader::parse(&file[ChunkHeader::LEN..]).unwrap();
            shiplog_core::ItemHeader::LEN + h.size as usize
        };
        file[ChunkHeader::LEN + first_item_len] ^= 0xff;
        file.extend(writer.chunk(&["b1"]));

        let decoder = OfflineDecoder::new(receiver).with_pattern(Pattern::compile("%v"));
        let (result, text) = decode_all(&decoder, &file);
        let stats = result.unwrap();
        assert_eq!(messages_of(&text), vec!["a1", "b1"]);
        assert_eq!(stats.abandoned_chunks, 1);
        assert_eq!(stats.chunks, 2);
    }

    #[test]
    fn test_bad_chunk_magic_stops_file() {
        let receiver = SessionKeys::generate();
        let mut writer = Writer::new(&receiver);
        let mut file = writer.chunk(&["kept"]);
        let second = file.len();
        file.extend(writer.chunk(&["lost"]));
        file[second] ^= 0xff;

        let decoder = OfflineDecoder::new(receiver).with_pattern(Pattern::compile("%v"));
        let (result, text) = decode_all(&decoder, &file);
        assert!(matches!(result, Err(DecodeError::BadChunkMagic { offset, .. }) if offset == second));
        assert_eq!(messages_of(&text), vec!["kept"]);
    }

    #[test]
    fn test_wrong_receiver_skips_items() {
        let receiver = SessionKeys::generate();
        let mut writer = Writer::new(&receiver);
        let file = writer.chunk(&["secret"; 4]);

        let decoder = OfflineDecoder::new(SessionKeys::generate());
        let (result, text) = decode_all(&decoder, &file);
        let stats = result.unwrap();
        assert_eq!(stats.lines, 0);
        assert_eq!(stats.skipped_items, 4);
        assert!(text.is_empty());
    }

    #[test]
    fn test_truncated_tail_keeps_complete_items() {
        let receiver = SessionKeys::generate();
        let mut writer = Writer::new(&receiver);
        let mut file = writer.chunk(&["whole", "cut"]);
        file.truncate(file.len() - 3);

        let decoder = OfflineDecoder::new(receiver).with_pattern(Pattern::compile("%v"));
        let (result, text) = decode_all(&decoder, &file);
        assert!(matches!(result, Err(DecodeError::TruncatedChunk { offset: 0, .. })));
        assert_eq!(messages_of(&text), vec!["whole"]);
    }

    #[test]
    fn test_garbage_sender_key_skips_chunk() {
        let receiver = SessionKeys::generate();
        let mut writer = Writer::new(&receiver);
        let mut file = writer.chunk(&["x"]);
        file[16] = 0x07;
        file.extend(writer.chunk(&["y"]));

        let decoder = OfflineDecoder::new(receiver).with_pattern(Pattern::compile("%v"));
        let (result, text) = decode_all(&decoder, &file);
        assert_eq!(result.unwrap().abandoned_chunks, 1);
        assert_eq!(messages_of(&text), vec!["y"]);
    }

    #[test]
    fn test_empty_input() {
        let decoder = OfflineDecoder::new(SessionKeys::generate());
        let (result, text) = decode_all(&decoder, &[]);
        assert_eq!(result.unwrap(), DecodeStats::default());
        assert!(text.is_empty());
    }
}
