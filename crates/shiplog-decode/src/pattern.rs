//! Text rendering of decoded records.
//!
//! | placeholder | field                                   |
//! |-------------|-----------------------------------------|
//! | `%l`        | level                                   |
//! | `%D`        | local date, `YYYY-MM-DD HH:MM:SS`       |
//! | `%S`        | seconds since the epoch                 |
//! | `%M`        | milliseconds since the epoch            |
//! | `%p` / `%t` | process id / thread id                  |
//! | `%#`        | line                                    |
//! | `%F` / `%f` | file / function                         |
//! | `%v`        | message                                 |
//!
//! Any other `%x` is copied through as `%x`. A trailing lone `%` is dropped.

use std::fmt::Write;

use chrono::{Local, TimeZone};
use shiplog_core::LogRecord;

/// Pattern used when none is given.
pub const DEFAULT_PATTERN: &str = "[%l][%D:%S][%p:%t][%F:%f:%#]%v";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(String),
    Level,
    Date,
    Seconds,
    Millis,
    Pid,
    Tid,
    Line,
    File,
    Function,
    Message,
}

/// A compiled line pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pieces: Vec<Piece>,
}

impl Default for Pattern {
    fn default() -> Self {
        Self::compile(DEFAULT_PATTERN)
    }
}

fn push_literal(pieces: &mut Vec<Piece>, text: &str) {
    if let Some(Piece::Literal(last)) = pieces.last_mut() {
        last.push_str(text);
    } else {
        pieces.push(Piece::Literal(text.to_string()));
    }
}

impl Pattern {
    /// Parses `pattern`. An empty pattern renders the fixed fallback layout.
    pub fn compile(pattern: &str) -> Self {
        let mut pieces = Vec::new();
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                let mut buf = [0u8; 4];
                push_literal(&mut pieces, c.encode_utf8(&mut buf));
                continue;
            }
            let Some(flag) = chars.next() else {
                break;
            };
            let piece = match flag {
                'l' => Piece::Level,
                'D' => Piece::Date,
                'S' => Piece::Seconds,
                'M' => Piece::Millis,
                'p' => Piece::Pid,
                't' => Piece::Tid,
                '#' => Piece::Line,
                'F' => Piece::File,
                'f' => Piece::Function,
                'v' => Piece::Message,
                other => {
                    push_literal(&mut pieces, &format!("%{}", other));
                    continue;
                }
            };
            pieces.push(piece);
        }
        Self { pieces }
    }

    /// Appends the rendered line, newline included, to `out`.
    pub fn render(&self, record: &LogRecord, out: &mut String) {
        if self.pieces.is_empty() {
            let _ = write!(
                out,
                "[{}][{}][{}:{}][{}:{}:{}]{}",
                record.level,
                record.timestamp_us / 1000,
                record.pid,
                record.tid,
                record.location.file,
                record.location.function,
                record.location.line,
                record.message
            );
            out.push('\n');
            return;
        }
        for piece in &self.pieces {
            // Writing to a String cannot fail.
            let _ = match piece {
                Piece::Literal(text) => out.write_str(text),
                Piece::Level => out.write_str(record.level.as_str()),
                Piece::Date => out.write_str(&local_date(record.timestamp_us)),
                Piece::Seconds => write!(out, "{}", record.timestamp_us / 1_000_000),
                Piece::Millis => write!(out, "{}", record.timestamp_us / 1000),
                Piece::Pid => write!(out, "{}", record.pid),
                Piece::Tid => write!(out, "{}", record.tid),
                Piece::Line => write!(out, "{}", record.location.line),
                Piece::File => out.write_str(&record.location.file),
                Piece::Function => out.write_str(&record.location.function),
                Piece::Message => out.write_str(&record.message),
            };
        }
        out.push('\n');
    }

    /// Renders one record to a new string.
    pub fn render_to_string(&self, record: &LogRecord) -> String {
        let mut out = String::new();
        self.render(record, &mut out);
        out
    }
}

fn local_date(timestamp_us: u64) -> String {
    let secs = (timestamp_us / 1_000_000) as i64;
    match Local.timestamp_opt(secs, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => secs.to_string(),
    }
}
