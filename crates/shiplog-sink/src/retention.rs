//! Size-budgeted eviction of old log files.
//!
//! Newest files (by modification time) are kept while their cumulative size
//! stays within the budget; every older file is deleted. This is advisory: a
//! file being appended to concurrently is not protected.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::rotation::LOG_EXTENSION;

/// Outcome of one eviction sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Log files found.
    pub scanned: usize,
    /// Bytes in the files that were kept.
    pub retained_bytes: u64,
    /// Files deleted, newest first.
    pub evicted: Vec<PathBuf>,
}

#[derive(Debug)]
struct LogFile {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

fn list_log_files(dir: &Path) -> io::Result<Vec<LogFile>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        files.push(LogFile {
            path,
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: meta.len(),
        });
    }
    Ok(files)
}

/// Deletes the oldest `.log` files in `dir` until the rest fit in `budget` bytes.
pub fn evict(dir: &Path, budget: u64) -> io::Result<EvictionReport> {
    let mut files = list_log_files(dir)?;
    // Newest first; names carry the timestamp and break mtime ties.
    files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));

    let mut report = EvictionReport {
        scanned: files.len(),
        ..EvictionReport::default()
    };
    let mut used: u64 = 0;
    for file in files {
        used = used.saturating_add(file.size);
        if used <= budget {
            report.retained_bytes += file.size;
            continue;
        }
        match fs::remove_file(&file.path) {
            Ok(()) => {
                info!(path = %file.path.display(), size = file.size, "evicted log file");
                report.evicted.push(file.path);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %file.path.display(), error = %e, "failed to evict log file");
                report.retained_bytes += file.size;
            }
        }
    }
    debug!(
        scanned = report.scanned,
        evicted = report.evicted.len(),
        retained_bytes = report.retained_bytes,
        "eviction sweep done"
    );
    Ok(report)
}
