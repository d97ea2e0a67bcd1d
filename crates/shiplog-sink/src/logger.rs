//! Front-end: level filtering and fan-out to sinks.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use shiplog_core::{Level, LogRecord};

/// Destination for log records.
pub trait Sink: Send + Sync {
    /// Accepts one record. Must not fail or block on I/O.
    fn log(&self, record: &LogRecord);

    /// Pushes buffered records to their destination.
    fn flush(&self);
}

/// Filters records by level and forwards them to every sink.
pub struct Logger {
    level: AtomicU8,
    sinks: Vec<Arc<dyn Sink>>,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("level", &self.level())
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(Level::default())
    }
}

impl Logger {
    /// A logger with no sinks passing records at `level` and above.
    pub fn new(level: Level) -> Self {
        Self {
            level: AtomicU8::new(level as u8),
            sinks: Vec::new(),
        }
    }

    /// Adds a sink, builder style.
    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Adds a sink.
    pub fn add_sink(&mut self, sink: Arc<dyn Sink>) {
        self.sinks.push(sink);
    }

    /// Minimum level that is forwarded.
    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Relaxed)).unwrap_or_default()
    }

    /// Changes the minimum level.
    pub fn set_level(&self, level: Level) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    /// Whether a record at `level` would be forwarded.
    pub fn enabled(&self, level: Level) -> bool {
        level >= self.level()
    }

    /// Forwards `record` to every sink if its level passes.
    pub fn log(&self, record: &LogRecord) {
        if !self.enabled(record.level) {
            return;
        }
        for sink in &self.sinks {
            sink.log(record);
        }
    }

    /// Flushes every sink.
    pub fn flush(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }
}

/// Logs a formatted message with the call site's file, line and module.
///
/// ```ignore
/// shiplog!(logger, Level::Warn, "disk {} at {}%", name, pct);
/// ```
#[macro_export]
macro_rules! shiplog {
    ($logger:expr, $level:expr, $($arg:tt)+) => {{
        let logger = &$logger;
        let level = $level;
        if logger.enabled(level) {
            let record = $crate::LogRecord::new(
                level,
                $crate::Location::new(file!(), line!(), module_path!()),
                format!($($arg)+),
            );
            logger.log(&record);
        }
    }};
}
