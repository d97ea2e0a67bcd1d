//! Dated log file naming and size-based rotation.
//!
//! Files are named `{prefix}_{YYYYMMDDHHMMSS}.log` in local time. When the
//! current file grows past the cap a new dated name is chosen; if that name is
//! taken (two rotations within one second) a `_{n}` suffix is appended, where
//! `n` starts at the number of directory entries sharing the dated stem.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use tracing::{debug, info};

/// Extension of chunk files, also used by retention to find them.
pub const LOG_EXTENSION: &str = "log";

/// Tracks the current output file of one sink.
#[derive(Debug)]
pub struct FileRotator {
    dir: PathBuf,
    prefix: String,
    max_file_bytes: u64,
    current: Option<PathBuf>,
}

impl FileRotator {
    /// Creates a rotator with no current file.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, max_file_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            max_file_bytes,
            current: None,
        }
    }

    /// The file chunks are currently appended to, if one was chosen.
    pub fn current(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    /// Destination for the next chunk, rotating on the local clock.
    pub fn next_path(&mut self) -> PathBuf {
        self.next_path_at(Local::now().naive_local())
    }

    /// Destination for the next chunk given the current local time.
    pub fn next_path_at(&mut self, now: NaiveDateTime) -> PathBuf {
        let path = match self.current.take() {
            None => self.dated_path(now, None),
            Some(current) => {
                let size = fs::metadata(&current).map(|m| m.len()).unwrap_or(0);
                if size > self.max_file_bytes {
                    let next = self.rotated_path(now);
                    info!(
                        from = %current.display(),
                        to = %next.display(),
                        size,
                        "rotating log file"
                    );
                    next
                } else {
                    current
                }
            }
        };
        self.current = Some(path.clone());
        path
    }

    fn stem(&self, now: NaiveDateTime) -> String {
        format!("{}_{}", self.prefix, now.format("%Y%m%d%H%M%S"))
    }

    fn dated_path(&self, now: NaiveDateTime, index: Option<usize>) -> PathBuf {
        let stem = self.stem(now);
        let name = match index {
            Some(idx) => format!("{}_{}.{}", stem, idx, LOG_EXTENSION),
            None => format!("{}.{}", stem, LOG_EXTENSION),
        };
        self.dir.join(name)
    }

    fn rotated_path(&self, now: NaiveDateTime) -> PathBuf {
        let plain = self.dated_path(now, None);
        if !plain.exists() {
            return plain;
        }
        let stem = self.stem(now);
        let mut idx = fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|e| e.file_name().to_string_lossy().contains(&stem))
                    .count()
            })
            .unwrap_or(1);
        loop {
            let candidate = self.dated_path(now, Some(idx));
            if !candidate.exists() {
                debug!(path = %candidate.display(), "same-second rotation, using suffix");
                return candidate;
            }
            idx += 1;
        }
    }
}
