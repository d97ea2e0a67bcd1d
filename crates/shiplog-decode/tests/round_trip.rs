//! Sink output decoded back to text through the public decoder API.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use shiplog_core::{ChunkHeader, SessionKeys};
use shiplog_decode::{DecodeError, OfflineDecoder, Pattern};
use shiplog_sched::Scheduler;
use shiplog_sink::{DurableSink, Level, Location, LogRecord, SinkConfig};
use tempfile::TempDir;

fn log_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("log"))
        .collect();
    files.sort();
    files
}

fn sink_in(dir: &Path, receiver: &SessionKeys, capacity: usize) -> DurableSink {
    let mut config = SinkConfig::new(dir.join("out"), receiver.public_key_hex());
    config.buffer_capacity = capacity;
    DurableSink::new(config, Arc::new(Scheduler::new().unwrap())).unwrap()
}

fn message_decoder(receiver: &SessionKeys) -> OfflineDecoder {
    OfflineDecoder::from_secret_hex(&receiver.secret_key_hex())
        .unwrap()
        .with_pattern(Pattern::compile("%l %v"))
}

#[test]
fn test_sink_output_decodes_to_lines() {
    let dir = TempDir::new().unwrap();
    let receiver = SessionKeys::generate();
    let sink = sink_in(dir.path(), &receiver, 32 * 1024);
    for i in 0..300 {
        sink.log(&LogRecord::new(Level::Debug, Location::new("t.rs", 1, "t"), format!("line {}", i)));
    }
    sink.flush().unwrap();

    let files = log_files(&dir.path().join("out"));
    assert_eq!(files.len(), 1);
    let text_path = dir.path().join("decoded.txt");
    let stats = message_decoder(&receiver).decode_file(&files[0], &text_path).unwrap();
    assert_eq!(stats.lines, 300);
    assert_eq!(stats.skipped_items, 0);
    assert_eq!(stats.chunks as u64, sink.stats().chunks_written);

    let text = fs::read_to_string(&text_path).unwrap();
    let expected: Vec<String> = (0..300).map(|i| format!("Debug line {}", i)).collect();
    assert_eq!(text.lines().collect::<Vec<_>>(), expected);
}

#[test]
fn test_output_is_appended() {
    let dir = TempDir::new().unwrap();
    let receiver = SessionKeys::generate();
    let sink = sink_in(dir.path(), &receiver, 32 * 1024);
    sink.log(&LogRecord::new(Level::Info, Location::default(), "only"));
    sink.flush().unwrap();

    let files = log_files(&dir.path().join("out"));
    let text_path = dir.path().join("decoded.txt");
    fs::write(&text_path, "existing\n").unwrap();
    message_decoder(&receiver).decode_file(&files[0], &text_path).unwrap();
    message_decoder(&receiver).decode_file(&files[0], &text_path).unwrap();
    assert_eq!(fs::read_to_string(&text_path).unwrap(), "existing\nInfo only\nInfo only\n");
}

#[test]
fn test_concurrent_writers_decode_completely() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 400;

    let dir = TempDir::new().unwrap();
    let receiver = SessionKeys::generate();
    let sink = Arc::new(sink_in(dir.path(), &receiver, 16 * 1024));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let sink = sink.clone();
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    sink.log(&LogRecord::new(Level::Info, Location::default(), format!("{}:{}", t, i)));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    sink.flush().unwrap();

    let decoder = message_decoder(&receiver);
    let mut lines = Vec::new();
    for file in log_files(&dir.path().join("out")) {
        let bytes = fs::read(&file).unwrap();
        decoder
            .decode_bytes(&bytes, |text| {
                lines.extend(text.lines().map(str::to_string));
                Ok(())
            })
            .unwrap();
    }
    assert_eq!(lines.len(), THREADS * PER_THREAD);

    // Lines from one thread keep their relative order.
    for t in 0..THREADS {
        let prefix = format!("Info {}:", t);
        let seq: Vec<usize> = lines
            .iter()
            .filter_map(|l| l.strip_prefix(&prefix))
            .map(|n| n.parse().unwrap())
            .collect();
        assert_eq!(seq, (0..PER_THREAD).collect::<Vec<_>>());
    }
}

#[test]
fn test_damaged_second_chunk_keeps_first() {
    let dir = TempDir::new().unwrap();
    let receiver = SessionKeys::generate();
    let sink = sink_in(dir.path(), &receiver, 32 * 1024);
    sink.log(&LogRecord::new(Level::Info, Location::default(), "first"));
    sink.flush().unwrap();
    sink.log(&LogRecord::new(Level::Info, Location::default(), "second"));
    sink.flush().unwrap();

    let files = log_files(&dir.path().join("out"));
    assert_eq!(files.len(), 1);
    let mut bytes = fs::read(&files[0]).unwrap();
    let first_len = ChunkHeader::LEN + ChunkHeader::parse(&bytes).unwrap().size as usize;
    bytes[first_len] ^= 0x5a;
    let damaged = dir.path().join("damaged.log");
    fs::write(&damaged, &bytes).unwrap();

    let text_path = dir.path().join("decoded.txt");
    let err = message_decoder(&receiver).decode_file(&damaged, &text_path).unwrap_err();
    assert!(matches!(err, DecodeError::BadChunkMagic { offset, .. } if offset == first_len));
    assert_eq!(fs::read_to_string(&text_path).unwrap(), "Info first\n");
}

#[test]
fn test_wrong_private_key_recovers_nothing() {
    let dir = TempDir::new().unwrap();
    let receiver = SessionKeys::generate();
    let sink = sink_in(dir.path(), &receiver, 32 * 1024);
    for _ in 0..10 {
        sink.log(&LogRecord::new(Level::Error, Location::default(), "hidden"));
    }
    sink.flush().unwrap();

    let files = log_files(&dir.path().join("out"));
    let text_path = dir.path().join("decoded.txt");
    let stats = message_decoder(&SessionKeys::generate())
        .decode_file(&files[0], &text_path)
        .unwrap();
    assert_eq!(stats.lines, 0);
    assert_eq!(stats.skipped_items, 10);
    assert!(!fs::read_to_string(&text_path).unwrap().contains("hidden"));
}

#[test]
fn test_bad_private_key_is_rejected() {
    assert!(matches!(
        OfflineDecoder::from_secret_hex("not hex"),
        Err(DecodeError::Core(_))
    ));
}
