//! Double-buffered, encrypted, memory-mapped log sink.
//!
//! Records are formatted, compressed into a per-chunk zstd stream, encrypted
//! and framed as items into the active mapped buffer. Once the active buffer
//! passes the fill ratio it is swapped with the draining buffer, and the sink's
//! dedicated runner appends the drained bytes to the current log file as one
//! chunk. Mapped buffers survive a crash; data left in them is written out the
//! next time a sink opens the same directory.
//!
//! Locking: the `active` mutex covers compress, encrypt and push. The
//! `draining` mutex guards the draining slot and is never held across file
//! I/O: a drain takes the buffer out of the slot, writes it unlocked and puts
//! it back. The `draining_free` flag only changes while `draining` is held, and
//! a swap never touches a slot that is not free.

use std::cell::RefCell;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shiplog_core::encryption::{parse_public_key, parse_public_key_hex, PUBLIC_KEY_SLOT_LEN};
use shiplog_core::{
    encode_item, AesCbcCrypt, BinaryFormatter, ChunkHeader, Compress, Encrypt, Format, LogRecord,
    MappedBuffer, SessionKeys, ZstdCompressor,
};
use shiplog_sched::{Repeat, RepeatedTaskId, RunnerTag, SchedError, Scheduler};
use tracing::{debug, error, info, warn};

use crate::config::SinkConfig;
use crate::error::SinkResult;
use crate::logger::Sink;
use crate::retention::{self, EvictionReport};
use crate::rotation::FileRotator;

/// Backing file of the buffer that starts out active.
pub const BUFFER_FILE_A: &str = "cache_a.mmap";
/// Backing file of the buffer that starts out draining.
pub const BUFFER_FILE_B: &str = "cache_b.mmap";
/// Hex public key of the session whose data may sit in the buffers.
pub const SESSION_KEY_FILE: &str = "session.pub";
/// Runner tag a sink asks for; a fresh one is assigned if it is taken.
pub const SINK_RUNNER_TAG: RunnerTag = 20_010_305;

thread_local! {
    static FORMAT_BUF: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

/// Counters describing a sink's activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkStats {
    /// Records appended to a buffer.
    pub records_logged: u64,
    /// Records lost to format, compress, encrypt or buffer failures.
    pub records_dropped: u64,
    /// Active/draining swaps.
    pub swaps: u64,
    /// Chunks appended to log files, recovered ones included.
    pub chunks_written: u64,
    /// Chunk bytes written, headers included.
    pub bytes_written: u64,
    /// Log files removed by retention.
    pub files_evicted: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    records_logged: AtomicU64,
    records_dropped: AtomicU64,
    swaps: AtomicU64,
    chunks_written: AtomicU64,
    bytes_written: AtomicU64,
    files_evicted: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> SinkStats {
        SinkStats {
            records_logged: self.records_logged.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            swaps: self.swaps.load(Ordering::Relaxed),
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            files_evicted: self.files_evicted.load(Ordering::Relaxed),
        }
    }

    fn chunk(&self, bytes: u64) {
        self.chunks_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }
}

struct ActiveState {
    buffer: MappedBuffer,
    compressor: ZstdCompressor,
    compressed: Vec<u8>,
    encrypted: Vec<u8>,
    framed: Vec<u8>,
}

struct SinkShared {
    config: SinkConfig,
    formatter: BinaryFormatter,
    crypt: AesCbcCrypt,
    key_slot: [u8; PUBLIC_KEY_SLOT_LEN],
    public_key_hex: String,
    active: Mutex<ActiveState>,
    // Empty while a drain is writing the buffer out.
    draining: Mutex<Option<MappedBuffer>>,
    draining_free: AtomicBool,
    rotator: Mutex<FileRotator>,
    stats: StatsCounters,
}

/// Appends `buffer` to the rotator's current file as one chunk.
///
/// A failed append is rolled back to the previous file length so the file never
/// ends in a partial chunk.
fn write_chunk(
    rotator: &mut FileRotator,
    buffer: &MappedBuffer,
    key_slot: &[u8; PUBLIC_KEY_SLOT_LEN],
) -> io::Result<(PathBuf, u64)> {
    let path = rotator.next_path();
    let data = buffer.data();
    let header = ChunkHeader::new(data.len() as u64, *key_slot);

    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    let start = file.metadata()?.len();
    let written = file
        .write_all(&header.to_bytes())
        .and_then(|()| file.write_all(data));
    if let Err(e) = written {
        if let Err(trunc) = file.set_len(start) {
            error!(path = %path.display(), error = %trunc, "failed to roll back partial chunk");
        }
        return Err(e);
    }
    Ok((path, (ChunkHeader::LEN + data.len()) as u64))
}

fn read_session_slot(dir: &Path) -> Option<[u8; PUBLIC_KEY_SLOT_LEN]> {
    let path = dir.join(SESSION_KEY_FILE);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read previous session key");
            return None;
        }
    };
    let bytes = match hex::decode(text.trim()) {
        Ok(bytes) if bytes.len() <= PUBLIC_KEY_SLOT_LEN => bytes,
        _ => {
            warn!(path = %path.display(), "previous session key is malformed");
            return None;
        }
    };
    if let Err(e) = parse_public_key(&bytes) {
        warn!(path = %path.display(), error = %e, "previous session key is not a P-256 point");
        return None;
    }
    let mut slot = [0u8; PUBLIC_KEY_SLOT_LEN];
    slot[..bytes.len()].copy_from_slice(&bytes);
    Some(slot)
}

fn write_session_key(dir: &Path, public_key_hex: &str) -> io::Result<()> {
    let tmp = dir.join(format!("{}.tmp", SESSION_KEY_FILE));
    fs::write(&tmp, public_key_hex)?;
    fs::rename(&tmp, dir.join(SESSION_KEY_FILE))
}

/// Writes out data a previous process left in the mapped buffers.
///
/// The chunks carry the previous session's key, since that is what encrypted
/// them. Without that key the data is unreadable and is discarded.
fn recover_buffers(
    dir: &Path,
    rotator: &mut FileRotator,
    buffers: [&mut MappedBuffer; 2],
    stats: &StatsCounters,
) -> SinkResult<()> {
    if buffers.iter().all(|b| b.is_empty()) {
        return Ok(());
    }
    let slot = read_session_slot(dir);
    for buffer in buffers {
        if buffer.is_empty() {
            continue;
        }
        match &slot {
            Some(slot) => {
                let (path, bytes) = write_chunk(rotator, buffer, slot)?;
                info!(
                    buffer = %buffer.path().display(),
                    path = %path.display(),
                    bytes,
                    "recovered buffered log data"
                );
                stats.chunk(bytes);
            }
            None => {
                warn!(
                    buffer = %buffer.path().display(),
                    bytes = buffer.len(),
                    "discarding buffered data without a session key"
                );
            }
        }
        buffer.clear();
    }
    Ok(())
}

impl SinkShared {
    /// Compresses, encrypts and pushes one formatted record. Returns the fill
    /// ratio afterwards, or `None` if the record was dropped.
    fn append(&self, formatted: &[u8]) -> Option<f64> {
        let mut guard = self.active.lock();
        let active = &mut *guard;

        if active.buffer.is_empty() {
            active.compressor.reset_stream();
        }
        if active.compressor.compress(formatted, &mut active.compressed) == 0 {
            error!(bytes = formatted.len(), "compression failed, record dropped");
            return None;
        }
        // Past this point the compressor has advanced; any failure must restart
        // the stream so the next item does not depend on one that was dropped.
        if let Err(e) = self.crypt.encrypt(&active.compressed, &mut active.encrypted) {
            error!(error = %e, "encryption failed, record dropped");
            active.compressor.reset_stream();
            return None;
        }
        active.framed.clear();
        let pushed = encode_item(&active.encrypted, &mut active.framed)
            .and_then(|()| active.buffer.push(&active.framed));
        if let Err(e) = pushed {
            error!(error = %e, "buffer append failed, record dropped");
            active.compressor.reset_stream();
            return None;
        }
        Some(active.buffer.ratio())
    }

    /// Moves the active buffer into the draining slot if that slot is free.
    ///
    /// With `wait == false` a drain in progress makes this return at once.
    fn swap_buffers(&self, wait: bool) -> bool {
        if !self.draining_free.load(Ordering::Acquire) {
            return false;
        }
        let mut draining = if wait {
            self.draining.lock()
        } else {
            match self.draining.try_lock() {
                Some(guard) => guard,
                None => return false,
            }
        };
        if !self.draining_free.load(Ordering::Acquire) {
            return false;
        }
        let Some(slot) = draining.as_mut() else {
            return false;
        };
        let mut active = self.active.lock();
        std::mem::swap(&mut active.buffer, slot);
        self.draining_free.store(false, Ordering::Release);
        drop(active);
        drop(draining);
        self.stats.swaps.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Writes the draining buffer out as one chunk and frees it.
    ///
    /// On failure the buffer stays busy and intact; the next drain retries.
    fn drain(&self) -> io::Result<()> {
        if self.draining_free.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut buffer = {
            let mut slot = self.draining.lock();
            if self.draining_free.load(Ordering::Acquire) {
                return Ok(());
            }
            match slot.take() {
                Some(buffer) => buffer,
                // Another drain is already writing it.
                None => return Ok(()),
            }
        };
        if buffer.is_empty() {
            self.restore_draining(buffer, true);
            return Ok(());
        }

        let written = {
            let mut rotator = self.rotator.lock();
            write_chunk(&mut rotator, &buffer, &self.key_slot)
        };
        match written {
            Ok((path, bytes)) => {
                buffer.clear();
                self.restore_draining(buffer, true);
                self.stats.chunk(bytes);
                debug!(path = %path.display(), bytes, "chunk written");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, bytes = buffer.len(), "chunk write failed, will retry");
                self.restore_draining(buffer, false);
                Err(e)
            }
        }
    }

    /// Puts a drained buffer back into its slot, marking it free if `free`.
    fn restore_draining(&self, buffer: MappedBuffer, free: bool) {
        let mut slot = self.draining.lock();
        *slot = Some(buffer);
        if free {
            self.draining_free.store(true, Ordering::Release);
        }
    }

    fn evict(&self) -> io::Result<EvictionReport> {
        let report = retention::evict(&self.config.dir, self.config.max_total_bytes)?;
        self.stats
            .files_evicted
            .fetch_add(report.evicted.len() as u64, Ordering::Relaxed);
        Ok(report)
    }
}

/// Durable log sink writing encrypted chunk files.
pub struct DurableSink {
    shared: Arc<SinkShared>,
    scheduler: Arc<Scheduler>,
    tag: RunnerTag,
    eviction_task: Option<RepeatedTaskId>,
}

impl std::fmt::Debug for DurableSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableSink")
            .field("dir", &self.shared.config.dir)
            .field("prefix", &self.shared.config.prefix)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

impl DurableSink {
    /// Opens the sink, recovering any data a previous process left buffered.
    ///
    /// Fails without side effects on the scheduler if the configuration, the
    /// mapped buffers or recovery cannot be set up.
    pub fn new(config: SinkConfig, scheduler: Arc<Scheduler>) -> SinkResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;

        let peer = parse_public_key_hex(&config.peer_public_key)?;
        let keys = SessionKeys::generate();
        let crypt = AesCbcCrypt::new(keys.agree(&peer));

        let mut active = MappedBuffer::open_with_capacity(config.dir.join(BUFFER_FILE_A), config.buffer_capacity)?;
        let mut draining = MappedBuffer::open_with_capacity(config.dir.join(BUFFER_FILE_B), config.buffer_capacity)?;
        let mut rotator = FileRotator::new(&config.dir, &config.prefix, config.max_file_bytes);
        let stats = StatsCounters::default();

        recover_buffers(&config.dir, &mut rotator, [&mut draining, &mut active], &stats)?;
        write_session_key(&config.dir, &keys.public_key_hex())?;

        let compressor = ZstdCompressor::new(config.compression_level)?;
        let shared = Arc::new(SinkShared {
            formatter: BinaryFormatter,
            crypt,
            key_slot: keys.public_key_slot(),
            public_key_hex: keys.public_key_hex(),
            active: Mutex::new(ActiveState {
                buffer: active,
                compressor,
                compressed: Vec::new(),
                encrypted: Vec::new(),
                framed: Vec::new(),
            }),
            draining: Mutex::new(Some(draining)),
            draining_free: AtomicBool::new(true),
            rotator: Mutex::new(rotator),
            stats,
            config,
        });

        let tag = scheduler.add_task_runner(SINK_RUNNER_TAG)?;
        let eviction_task = match Self::schedule_eviction(&scheduler, &shared, tag) {
            Ok(id) => id,
            Err(e) => {
                scheduler.remove_task_runner(tag);
                return Err(e.into());
            }
        };

        info!(
            dir = %shared.config.dir.display(),
            prefix = %shared.config.prefix,
            tag,
            "durable sink opened"
        );
        Ok(Self {
            shared,
            scheduler,
            tag,
            eviction_task: Some(eviction_task),
        })
    }

    // The timer holds only weak references so a forgotten sink or scheduler
    // is not kept alive by its own sweep.
    fn schedule_eviction(
        scheduler: &Arc<Scheduler>,
        shared: &Arc<SinkShared>,
        tag: RunnerTag,
    ) -> Result<RepeatedTaskId, SchedError> {
        let weak_sched: Weak<Scheduler> = Arc::downgrade(scheduler);
        let weak_shared: Weak<SinkShared> = Arc::downgrade(shared);
        scheduler.post_repeated_task(
            move || {
                let (Some(sched), Some(shared)) = (weak_sched.upgrade(), weak_shared.upgrade()) else {
                    return;
                };
                sched.post_task(tag, move || {
                    if let Err(e) = shared.evict() {
                        warn!(error = %e, "retention sweep failed");
                    }
                });
            },
            shared.config.eviction_interval(),
            Repeat::Forever,
        )
    }

    /// Appends one record. Never blocks on file I/O and never fails; problems
    /// are logged and counted in [`SinkStats::records_dropped`].
    pub fn log(&self, record: &LogRecord) {
        let shared = &self.shared;
        // The scratch buffer is gone during thread teardown or busy on reentry.
        let ratio = FORMAT_BUF
            .try_with(|cell| match cell.try_borrow_mut() {
                Ok(mut buf) => self.encode(record, &mut buf),
                Err(_) => self.encode(record, &mut Vec::new()),
            })
            .unwrap_or_else(|_| self.encode(record, &mut Vec::new()));
        let Some(ratio) = ratio else {
            shared.stats.records_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        shared.stats.records_logged.fetch_add(1, Ordering::Relaxed);

        if ratio > shared.config.flush_ratio {
            shared.swap_buffers(false);
            self.post_drain();
        }
    }

    fn encode(&self, record: &LogRecord, buf: &mut Vec<u8>) -> Option<f64> {
        if let Err(e) = self.shared.formatter.format(record, buf) {
            error!(error = %e, "format failed, record dropped");
            return None;
        }
        self.shared.append(buf)
    }

    fn post_drain(&self) {
        let shared = self.shared.clone();
        // Errors are logged inside drain; the buffer stays queued for the next one.
        self.scheduler.post_task(self.tag, move || {
            let _ = shared.drain();
        });
    }

    fn drain_and_wait(&self) -> SinkResult<()> {
        let shared = self.shared.clone();
        match self
            .scheduler
            .post_task_and_get_result(self.tag, move || shared.drain())
        {
            Ok(handle) => Ok(handle.wait()??),
            Err(SchedError::ShutDown) | Err(SchedError::UnknownRunner(_)) => {
                debug!(tag = self.tag, "runner gone, draining inline");
                Ok(self.shared.drain()?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Writes both buffers to disk and returns once they are on file.
    pub fn flush(&self) -> SinkResult<()> {
        self.drain_and_wait()?;
        self.shared.swap_buffers(true);
        self.drain_and_wait()
    }

    /// Runs a retention sweep now, on the sink's runner.
    pub fn evict_now(&self) -> SinkResult<EvictionReport> {
        let shared = self.shared.clone();
        let report = self
            .scheduler
            .post_task_and_get_result(self.tag, move || shared.evict())?
            .wait()??;
        Ok(report)
    }

    /// Activity counters.
    pub fn stats(&self) -> SinkStats {
        self.shared.stats.snapshot()
    }

    /// Hex public key of this session, as embedded in every chunk header.
    pub fn public_key_hex(&self) -> &str {
        &self.shared.public_key_hex
    }

    /// Bytes waiting in the active buffer.
    pub fn buffered_bytes(&self) -> usize {
        self.shared.active.lock().buffer.len()
    }

    /// The log file chunks are currently appended to.
    pub fn current_file(&self) -> Option<PathBuf> {
        self.shared.rotator.lock().current().map(Path::to_path_buf)
    }

    /// Settings the sink was opened with.
    pub fn config(&self) -> &SinkConfig {
        &self.shared.config
    }

    /// Tag of the sink's runner.
    pub fn runner_tag(&self) -> RunnerTag {
        self.tag
    }
}

impl Sink for DurableSink {
    fn log(&self, record: &LogRecord) {
        DurableSink::log(self, record);
    }

    fn flush(&self) {
        if let Err(e) = DurableSink::flush(self) {
            warn!(error = %e, "sink flush failed");
        }
    }
}

impl Drop for DurableSink {
    fn drop(&mut self) {
        if let Some(id) = self.eviction_task.take() {
            self.scheduler.cancel_repeated_task(id);
        }
        if let Err(e) = DurableSink::flush(self) {
            warn!(error = %e, "flush on close failed, data stays in the mapped buffers");
        }
        self.scheduler.remove_task_runner(self.tag);
        debug!(tag = self.tag, "durable sink closed");
    }
}
