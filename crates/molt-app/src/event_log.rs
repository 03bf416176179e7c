//! Structured event log
//!
//! The event log is the operator-facing record of what the monitor decided:
//! failures with their source line, versions found and installed, and
//! process group activity. Each line starts with the time since the log was
//! opened in centiseconds. Events are appended to a file (if one was opened),
//! kept in a bounded in-memory ring, and mirrored to the `log` facade.
//!
//! Writing never fails the caller: a broken log file is reported once via
//! `log::warn!` and then ignored.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::panic::Location;
use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::Mutex;

use molt_core::{GroupEvent, Version};

use crate::failure::{HardFailure, HardFailureKind, SoftFailure};

/// Maximum number of events kept in memory
const MAX_EVENTS: usize = 4096;

/// Something worth recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    SoftFail { what: SoftFailure, line: u32 },
    HardFail { what: HardFailureKind, line: u32 },
    Installing(Version),
    NewerFound(Version),
    Group(GroupEvent),
}

/// A recorded event with its timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Centiseconds since the log was opened
    pub stamp: u64,
    pub event: Event,
}

impl LogEntry {
    /// Format as a log file line (without the trailing newline)
    pub fn format(&self) -> String {
        match &self.event {
            Event::SoftFail { what, line } => {
                format!("{} soft_fail line {} issue {}", self.stamp, line, what)
            }
            Event::HardFail { what, line } => {
                format!("{} hard_fail line {} issue {}", self.stamp, line, what)
            }
            Event::Installing(v) => format!("{} installing ver {}", self.stamp, v),
            Event::NewerFound(v) => format!("{} newer_found ver {}", self.stamp, v),
            Event::Group(e) => format!("{} group {:?}", self.stamp, e),
        }
    }
}

/// Process-scoped event sink
pub struct EventLog {
    start: Instant,
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl EventLog {
    /// Open (or create) an append-only log file
    pub fn open(path: &Path) -> Result<Self, HardFailure> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| HardFailure::with_source(HardFailureKind::FileIo, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| HardFailure::with_source(HardFailureKind::FileIo, e))?;

        let log = Self {
            path: Some(path.to_path_buf()),
            file: Mutex::new(Some(file)),
            ..Self::in_memory()
        };
        log.write_line(&format!(
            "\n@ molt log [{}] pid {}",
            env!("CARGO_PKG_VERSION"),
            std::process::id()
        ));
        Ok(log)
    }

    /// A log that only keeps events in memory
    pub fn in_memory() -> Self {
        Self {
            start: Instant::now(),
            path: None,
            file: Mutex::new(None),
            entries: Mutex::new(VecDeque::with_capacity(64)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Centiseconds since the log was opened
    pub fn stamp(&self) -> u64 {
        (self.start.elapsed().as_millis() / 10) as u64
    }

    /// Record a soft failure at the caller's line
    #[track_caller]
    pub fn soft_fail(&self, what: SoftFailure) {
        let line = Location::caller().line();
        log::warn!("Upgrade attempt abandoned: {} (line {})", what, line);
        self.record(Event::SoftFail { what, line });
    }

    pub fn hard_fail(&self, failure: &HardFailure) {
        log::error!("Hard failure: {}", failure);
        self.record(Event::HardFail {
            what: failure.kind,
            line: failure.line,
        });
    }

    pub fn installing(&self, version: &Version) {
        log::info!("Installing version {}", version);
        self.record(Event::Installing(*version));
    }

    pub fn newer_found(&self, version: &Version) {
        log::info!("Newer version found: {}", version);
        self.record(Event::NewerFound(*version));
    }

    pub fn group_event(&self, event: &GroupEvent) {
        log::debug!("Process group: {:?}", event);
        self.record(Event::Group(*event));
    }

    /// Snapshot of the events kept in memory
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// How many times `what` was recorded
    pub fn soft_failures(&self, what: SoftFailure) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| matches!(e.event, Event::SoftFail { what: w, .. } if w == what))
            .count()
    }

    /// Write the trailer and stop writing to the file
    pub fn close(&self) {
        self.write_line(&format!(
            "{} endlog pid {}\n@ log end",
            self.stamp(),
            std::process::id()
        ));
        self.file.lock().take();
    }

    fn record(&self, event: Event) {
        let entry = LogEntry {
            stamp: self.stamp(),
            event,
        };
        self.write_line(&entry.format());

        let mut entries = self.entries.lock();
        if entries.len() >= MAX_EVENTS {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    fn write_line(&self, line: &str) {
        let mut guard = self.file.lock();
        let Some(file) = guard.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(file, "{}", line) {
            log::warn!("Event log write failed, disabling file output: {}", e);
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_records() {
        let log = EventLog::in_memory();
        log.newer_found(&Version::new(1, 5, 0, 0));
        log.soft_fail(SoftFailure::InvalidFile);
        log.soft_fail(SoftFailure::InvalidFile);
        log.soft_fail(SoftFailure::TimedOut);

        let entries = log.entries();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].event, Event::NewerFound(Version::new(1, 5, 0, 0)));
        assert_eq!(log.soft_failures(SoftFailure::InvalidFile), 2);
        assert_eq!(log.soft_failures(SoftFailure::TimedOut), 1);
        assert_eq!(log.soft_failures(SoftFailure::CopyFailed), 0);
    }

    #[test]
    fn test_soft_fail_records_caller_line() {
        let log = EventLog::in_memory();
        log.soft_fail(SoftFailure::CreateFailed);
        let expected = line!() - 1;

        match log.entries()[0].event {
            Event::SoftFail { what, line } => {
                assert_eq!(what, SoftFailure::CreateFailed);
                assert_eq!(line, expected);
            }
            ref other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_line_format() {
        let entry = LogEntry {
            stamp: 152,
            event: Event::SoftFail {
                what: SoftFailure::InvalidDir,
                line: 40,
            },
        };
        assert_eq!(entry.format(), "152 soft_fail line 40 issue [invalid dir]");

        let entry = LogEntry {
            stamp: 7,
            event: Event::Installing(Version::new(2, 0, 0, 1)),
        };
        assert_eq!(entry.format(), "7 installing ver 2.0.0.1");
    }

    #[test]
    fn test_file_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("molt.log");

        let log = EventLog::open(&path).unwrap();
        log.installing(&Version::new(1, 2, 3, 4));
        log.hard_fail(&HardFailure::new(HardFailureKind::Upgrade));
        log.close();
        // Writes after close only reach memory
        log.newer_found(&Version::new(9, 9, 9, 9));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("@ molt log"));
        assert!(text.contains("installing ver 1.2.3.4"));
        assert!(text.contains("hard_fail line"));
        assert!(text.contains("issue [upgrade]"));
        assert!(text.contains("endlog pid"));
        assert!(!text.contains("9.9.9.9"));
        assert_eq!(log.entries().len(), 3);
    }

    #[test]
    fn test_open_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("molt.log");

        EventLog::open(&path).unwrap().close();
        EventLog::open(&path).unwrap().close();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("@ molt log").count(), 2);
    }
}
