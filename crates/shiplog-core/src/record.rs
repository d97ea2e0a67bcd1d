//! Log records as produced by the front-end and consumed by formatters.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Severity of a log record, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Level {
    /// Fine-grained tracing output.
    Trace,
    /// Debugging output.
    Debug,
    /// Normal operational messages.
    #[default]
    Info,
    /// Something unexpected that does not stop the program.
    Warn,
    /// An operation failed.
    Error,
    /// The program cannot continue.
    Fatal,
}

impl Level {
    /// Display name used by text renderers.
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Trace => "Trace",
            Level::Debug => "Debug",
            Level::Info => "Info",
            Level::Warn => "Warn",
            Level::Error => "Error",
            Level::Fatal => "Fatal",
        }
    }

    /// Inverse of the `u8` representation used for atomic storage.
    pub fn from_u8(value: u8) -> Option<Level> {
        match value {
            0 => Some(Level::Trace),
            1 => Some(Level::Debug),
            2 => Some(Level::Info),
            3 => Some(Level::Warn),
            4 => Some(Level::Error),
            5 => Some(Level::Fatal),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call site of a log statement.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Location {
    /// Source file.
    pub file: String,
    /// Line within `file`.
    pub line: u32,
    /// Enclosing function or module path.
    pub function: String,
}

impl Location {
    /// Creates a location from its parts.
    pub fn new(file: impl Into<String>, line: u32, function: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line,
            function: function.into(),
        }
    }
}

/// One log event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Severity.
    pub level: Level,
    /// Microseconds since the Unix epoch.
    pub timestamp_us: u64,
    /// Process id of the emitter.
    pub pid: u32,
    /// OS thread id of the emitter.
    pub tid: u64,
    /// Call site.
    pub location: Location,
    /// Message text.
    pub message: String,
}

impl LogRecord {
    /// Builds a record stamped with the current time, process and thread.
    pub fn new(level: Level, location: Location, message: impl Into<String>) -> Self {
        Self {
            level,
            timestamp_us: now_micros(),
            pid: std::process::id(),
            tid: current_thread_id(),
            location,
            message: message.into(),
        }
    }
}

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// OS-level id of the calling thread.
#[cfg(target_os = "linux")]
pub fn current_thread_id() -> u64 {
    // SAFETY: gettid takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// OS-level id of the calling thread.
#[cfg(not(target_os = "linux"))]
pub fn current_thread_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_order() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Error < Level::Fatal);
        assert_eq!(Level::default(), Level::Info);
    }

    #[test]
    fn test_level_u8_roundtrip() {
        for level in [
            Level::Trace,
            Level::Debug,
            Level::Info,
            Level::Warn,
            Level::Error,
            Level::Fatal,
        ] {
            assert_eq!(Level::from_u8(level as u8), Some(level));
        }
        assert_eq!(Level::from_u8(42), None);
    }

    #[test]
    fn test_new_record_is_stamped() {
        let before = now_micros();
        let record = LogRecord::new(Level::Warn, Location::new("a.rs", 7, "main"), "msg");
        assert!(record.timestamp_us >= before);
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.tid, current_thread_id());
        assert_eq!(record.location.line, 7);
    }

    #[test]
    fn test_thread_ids_differ_across_threads() {
        let here = current_thread_id();
        let there = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, there);
    }
}
