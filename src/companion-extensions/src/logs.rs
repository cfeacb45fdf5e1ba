//! Per-extension log book.
//!
//! Each extension gets a bounded in-memory ring of recent entries, mirrored
//! append-only to `<data>/extensions/<id>/extension.log`. The ring answers
//! "recent" queries; the file is the durable record and is read back when the
//! ring is cold.

use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log file name inside each extension's data directory.
pub const LOG_FILE: &str = "extension.log";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Tracing target package log entries are mirrored to.
pub const PACKAGE_TARGET: &str = "companion_extensions::package";

/// Log level for extension logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Lowercase name as written to the log file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Parse a level name; unknown names map to `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One extension log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: NaiveDateTime,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    /// Create an entry stamped with the current local time.
    pub fn now(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now().naive_local(),
            level,
            message: message.into(),
        }
    }

    /// Render as a single log file line (without the trailing newline).
    pub fn to_line(&self) -> String {
        format!(
            "[{}] [{}] {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.level,
            self.message.replace(['\r', '\n'], " ")
        )
    }

    /// Parse a line written by [`LogEntry::to_line`].
    ///
    /// Lines in any other shape are kept verbatim as `info` entries.
    pub fn from_line(line: &str) -> Self {
        Self::parse_line(line).unwrap_or_else(|| Self {
            timestamp: NaiveDateTime::default(),
            level: LogLevel::Info,
            message: line.to_string(),
        })
    }

    fn parse_line(line: &str) -> Option<Self> {
        let rest = line.strip_prefix('[')?;
        let (stamp, rest) = rest.split_once("] [")?;
        let (level, message) = rest.split_once("] ").or_else(|| {
            rest.strip_suffix(']').map(|level| (level, ""))
        })?;
        Some(Self {
            timestamp: NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?,
            level: LogLevel::parse(level)?,
            message: message.to_string(),
        })
    }
}

/// Bounded per-extension log storage.
pub struct LogBook {
    data_dir: PathBuf,
    capacity: usize,
    entries: Mutex<HashMap<String, VecDeque<LogEntry>>>,
}

impl LogBook {
    /// Create a log book writing under `<data_dir>/extensions/`.
    pub fn new(data_dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            data_dir: data_dir.into(),
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Log file path for one extension.
    pub fn log_path(&self, extension_id: &str) -> PathBuf {
        self.data_dir
            .join(crate::EXTENSION_DIR)
            .join(extension_id)
            .join(LOG_FILE)
    }

    /// Append an entry to memory and to the extension's log file.
    pub fn append(&self, extension_id: &str, level: LogLevel, message: &str) {
        let Some(extension_id) = checked_id(extension_id) else {
            return;
        };
        let entry = LogEntry::now(level, message);
        match level {
            LogLevel::Info => {
                tracing::info!(target: PACKAGE_TARGET, extension = %extension_id, "{}", message)
            }
            LogLevel::Warn => {
                tracing::warn!(target: PACKAGE_TARGET, extension = %extension_id, "{}", message)
            }
            LogLevel::Error => {
                tracing::error!(target: PACKAGE_TARGET, extension = %extension_id, "{}", message)
            }
        }

        let line = entry.to_line();
        {
            let mut entries = self.entries.lock();
            let ring = entries.entry(extension_id.to_string()).or_default();
            ring.push_back(entry);
            while ring.len() > self.capacity {
                ring.pop_front();
            }
        }

        if let Err(e) = append_line(&self.log_path(extension_id), &line) {
            tracing::warn!(extension = %extension_id, "Failed to write extension log: {}", e);
        }
    }

    /// Most recent entries, oldest first.
    ///
    /// Falls back to the log file when nothing is held in memory, and warms the
    /// ring from it.
    pub fn recent(&self, extension_id: &str, limit: usize) -> Vec<LogEntry> {
        let Some(extension_id) = checked_id(extension_id) else {
            return Vec::new();
        };
        if limit == 0 {
            return Vec::new();
        }

        let mut entries = self.entries.lock();
        if let Some(ring) = entries.get(extension_id).filter(|ring| !ring.is_empty()) {
            return tail(ring.iter(), ring.len(), limit);
        }

        let path = self.log_path(extension_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(extension = %extension_id, "Failed to read extension log: {}", e);
                return Vec::new();
            }
        };

        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let skip = lines.len().saturating_sub(self.capacity);
        let ring: VecDeque<LogEntry> = lines[skip..]
            .iter()
            .map(|line| LogEntry::from_line(line))
            .collect();
        let result = tail(ring.iter(), ring.len(), limit);
        entries.insert(extension_id.to_string(), ring);
        result
    }

    /// Clear one extension's logs (memory and file).
    pub fn clear(&self, extension_id: &str) {
        let Some(extension_id) = checked_id(extension_id) else {
            return;
        };
        self.entries.lock().remove(extension_id);
        let path = self.log_path(extension_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(extension = %extension_id, "Failed to clear extension log: {}", e);
            }
        }
    }

    /// Clear every extension's logs, including files of extensions that are
    /// no longer installed.
    pub fn clear_all(&self) {
        self.entries.lock().clear();
        let root = self.data_dir.join(crate::EXTENSION_DIR);
        if !root.is_dir() {
            return;
        }
        for entry in walkdir::WalkDir::new(&root).into_iter().flatten() {
            if entry.file_type().is_file() && entry.file_name() == LOG_FILE {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    tracing::warn!("Failed to clear extension log {:?}: {}", entry.path(), e);
                }
            }
        }
    }
}

/// Trimmed id, or `None` when it cannot name a log directory.
fn checked_id(extension_id: &str) -> Option<&str> {
    let extension_id = extension_id.trim();
    match crate::manifest::validate_id(extension_id) {
        Ok(()) => Some(extension_id),
        Err(reason) => {
            if !extension_id.is_empty() {
                tracing::debug!("Ignoring log access for invalid id: {}", reason);
            }
            None
        }
    }
}

fn tail<'a>(iter: impl Iterator<Item = &'a LogEntry>, len: usize, limit: usize) -> Vec<LogEntry> {
    iter.skip(len.saturating_sub(limit)).cloned().collect()
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}
