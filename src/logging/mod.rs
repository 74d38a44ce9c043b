//! Per-session audit trail
//!
//! The `SessionLogger` owns `session.log` inside the session directory and is
//! its only writer. Components hold cheap clones (optionally re-scoped to
//! their own category) and emit `LogEvent`s; writes are serialized behind a
//! mutex, buffered, and flushed on session boundaries and errors. Every event
//! is mirrored to `tracing` so the console shows the same trail.

mod event;
mod rotation;

pub use event::{Level, LogEvent};
pub use rotation::{backup_path, Rollover, RotatingFile, RotationPolicy};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::RecorderResult;

pub const LOG_FILE_NAME: &str = "session.log";

/// Logging configuration snapshot taken at session start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Minimum level written to the file
    pub level: Level,
    pub rotation: RotationPolicy,
    /// Level for encoder diagnostic lines that match no known vocabulary
    pub encoder_output_level: Level,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::Info,
            rotation: RotationPolicy::default(),
            encoder_output_level: Level::Debug,
        }
    }
}

/// Rotation strategy name as it appears in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationKind {
    Size,
    Time,
    Off,
}

struct Sink {
    file: Option<RotatingFile>,
    broken: bool,
}

struct LoggerShared {
    path: Option<PathBuf>,
    min_level: Level,
    sink: Mutex<Sink>,
}

/// Rotating, leveled, structured event sink for one session
#[derive(Clone)]
pub struct SessionLogger {
    shared: Arc<LoggerShared>,
    category: Arc<str>,
}

impl SessionLogger {
    /// Open (or append to) `session.log` in `dir`
    pub fn open(dir: &Path, category: &str, settings: &LogSettings) -> RecorderResult<Self> {
        let path = dir.join(LOG_FILE_NAME);
        let file = RotatingFile::open(&path, settings.rotation.clone(), Utc::now())?;

        Ok(Self {
            shared: Arc::new(LoggerShared {
                path: Some(path),
                min_level: settings.level,
                sink: Mutex::new(Sink {
                    file: Some(file),
                    broken: false,
                }),
            }),
            category: Arc::from(category),
        })
    }

    /// Logger without a file: events only reach `tracing`.
    ///
    /// Used when the log file cannot be created so that recording continues.
    pub fn detached(category: &str, level: Level) -> Self {
        Self {
            shared: Arc::new(LoggerShared {
                path: None,
                min_level: level,
                sink: Mutex::new(Sink {
                    file: None,
                    broken: false,
                }),
            }),
            category: Arc::from(category),
        }
    }

    /// Open the file logger, falling back to a detached one on failure
    pub fn open_or_detached(dir: &Path, category: &str, settings: &LogSettings) -> Self {
        match Self::open(dir, category, settings) {
            Ok(logger) => logger,
            Err(e) => {
                let path = dir.join(LOG_FILE_NAME);
                eprintln!(
                    "echolog: could not open session log {}: {e}; continuing without it",
                    path.display()
                );
                tracing::warn!(path = %path.display(), error = %e, "Session log unavailable");
                Self::detached(category, settings.level)
            }
        }
    }

    /// Same sink, different category
    pub fn scoped(&self, category: &str) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            category: Arc::from(category),
        }
    }

    /// Path of the log file, if one is open
    pub fn path(&self) -> Option<&Path> {
        self.shared.path.as_deref()
    }

    pub fn emit(&self, event: LogEvent) {
        let category = event.category.as_deref().unwrap_or(&self.category);
        mirror_to_tracing(&event, category);

        // Session boundaries are written whatever the configured level
        let boundary = event.message == "session_start" || event.message == "session_stop";
        if event.level < self.shared.min_level && !boundary {
            return;
        }

        let line = event.format_line(&self.category);
        let force_flush = boundary || event.level >= Level::Error;

        let Ok(mut sink) = self.shared.sink.lock() else {
            return;
        };
        if sink.broken {
            return;
        }
        let Some(file) = sink.file.as_mut() else {
            return;
        };

        let mut result = file.write_line(&line, event.timestamp);
        if result.is_ok() && force_flush {
            result = file.flush();
        }
        if let Err(e) = result {
            let path = file.path().display().to_string();
            sink.broken = true;
            sink.file = None;
            eprintln!("echolog: writing session log {path} failed: {e}; recording continues");
            tracing::error!(path = %path, error = %e, "Session log write failed");
        }
    }

    /// Force buffered lines to disk
    pub fn flush(&self) {
        if let Ok(mut sink) = self.shared.sink.lock() {
            if let Some(file) = sink.file.as_mut() {
                if let Err(e) = file.flush() {
                    tracing::warn!(error = %e, "Session log flush failed");
                }
            }
        }
    }
}

fn mirror_to_tracing(event: &LogEvent, category: &str) {
    let fields = event
        .fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ");

    match event.level {
        Level::Debug => tracing::debug!(target: "echolog::session", category, "{} {}", event.message, fields),
        Level::Info => tracing::info!(target: "echolog::session", category, "{} {}", event.message, fields),
        Level::Warning => tracing::warn!(target: "echolog::session", category, "{} {}", event.message, fields),
        Level::Error => tracing::error!(target: "echolog::session", category, "{} {}", event.message, fields),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn filters_below_level_and_writes_categories() {
        let dir = TempDir::new().unwrap();
        let logger = SessionLogger::open(dir.path(), "session", &LogSettings::default()).unwrap();
        let encoder = logger.scoped("encoder");

        logger.emit(LogEvent::info("session_start").field("session_id", "s_1"));
        encoder.emit(LogEvent::debug("ffmpeg noise"));
        encoder.emit(LogEvent::warning("ffmpeg warn line"));
        logger.flush();

        let text = fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2, "{text}");
        assert!(lines[0].contains("INFO session: session_start session_id=s_1"));
        assert!(lines[1].contains("WARNING encoder: ffmpeg warn line"));
    }

    #[test]
    fn session_boundaries_are_flushed_without_explicit_flush() {
        let dir = TempDir::new().unwrap();
        let logger = SessionLogger::open(dir.path(), "session", &LogSettings::default()).unwrap();

        logger.emit(LogEvent::info("session_stop").field("reason", "signal"));

        let text = fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
        assert!(text.contains("session_stop reason=signal"));
    }

    #[test]
    fn session_boundaries_bypass_the_level_filter() {
        let dir = TempDir::new().unwrap();
        let settings = LogSettings {
            level: Level::Warning,
            ..LogSettings::default()
        };
        let logger = SessionLogger::open(dir.path(), "session", &settings).unwrap();

        logger.emit(LogEvent::info("session_start").field("session_id", "s_1"));
        logger.emit(LogEvent::info("chunk_created").field("sequence", 0));
        logger.emit(LogEvent::debug("poll"));
        logger.emit(LogEvent::info("session_stop").field("reason", "user_request"));

        let text = fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2, "{text}");
        assert!(lines[0].contains("INFO session: session_start session_id=s_1"));
        assert!(lines[1].contains("INFO session: session_stop reason=user_request"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn write_failure_after_open_stops_file_logging_quietly() {
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink("/dev/full", dir.path().join(LOG_FILE_NAME)).unwrap();
        let logger = SessionLogger::open(dir.path(), "session", &LogSettings::default()).unwrap();
        assert!(logger.path().is_some());

        // Errors force a flush, which hits ENOSPC
        logger.emit(LogEvent::error("encoder failed"));
        assert!(logger.shared.sink.lock().unwrap().broken);

        logger.emit(LogEvent::info("session_stop").field("reason", "disk_full"));
        logger.scoped("chunks").emit(LogEvent::warning("chunk_gap"));
        logger.flush();
        assert!(logger.shared.sink.lock().unwrap().file.is_none());
    }

    #[test]
    fn unopenable_directory_degrades_to_detached_logger() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"file").unwrap();

        let logger = SessionLogger::open_or_detached(&blocker, "session", &LogSettings::default());
        assert!(logger.path().is_none());
        logger.emit(LogEvent::error("still fine"));
    }
}
