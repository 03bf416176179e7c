//! Log capture for failure reports
//!
//! Captures log messages in a ring buffer while forwarding to env_logger, so a
//! hard failure can print the records that led up to it.

use std::collections::VecDeque;
use std::time::SystemTime;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use parking_lot::Mutex;

/// Maximum number of log records to keep
const MAX_LOG_ENTRIES: usize = 1000;

/// A captured log record
#[derive(Clone, Debug)]
pub struct CapturedRecord {
    pub level: Level,
    pub target: String,
    pub message: String,
    pub timestamp: SystemTime,
}

impl CapturedRecord {
    /// Format the record for display
    pub fn format(&self) -> String {
        use std::time::UNIX_EPOCH;

        let duration = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let secs = duration.as_secs() % 86400; // Time of day in seconds
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;
        let millis = duration.subsec_millis();

        format!(
            "{:02}:{:02}:{:02}.{:03} {:<5} [{}] {}",
            hours, mins, secs, millis, self.level, self.target, self.message
        )
    }
}

/// Global record buffer; `None` until `init` runs
static LOG_BUFFER: Mutex<Option<VecDeque<CapturedRecord>>> = Mutex::new(None);

/// Logger that captures to the ring buffer and forwards to env_logger
struct CapturingLogger {
    env_logger: env_logger::Logger,
}

impl Log for CapturingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.env_logger.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            capture(CapturedRecord {
                level: record.level(),
                target: record.target().to_string(),
                message: format!("{}", record.args()),
                timestamp: SystemTime::now(),
            });
        }

        self.env_logger.log(record);
    }

    fn flush(&self) {
        self.env_logger.flush();
    }
}

fn capture(record: CapturedRecord) {
    let mut guard = LOG_BUFFER.lock();
    if let Some(buffer) = guard.as_mut() {
        if buffer.len() >= MAX_LOG_ENTRIES {
            buffer.pop_front();
        }
        buffer.push_back(record);
    }
}

/// Install the capturing logger
///
/// `level` overrides the `RUST_LOG` filter when given. Call this instead of
/// `env_logger::init()`.
pub fn init(level: Option<LevelFilter>) -> Result<(), SetLoggerError> {
    *LOG_BUFFER.lock() = Some(VecDeque::with_capacity(64));

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = level {
        builder.filter_level(level);
    }
    let env_logger = builder.build();
    let max_level = env_logger.filter();

    log::set_boxed_logger(Box::new(CapturingLogger { env_logger }))?;
    log::set_max_level(max_level);
    Ok(())
}

/// The most recent `count` captured records, oldest first
pub fn recent(count: usize) -> Vec<CapturedRecord> {
    let guard = LOG_BUFFER.lock();
    match guard.as_ref() {
        Some(buffer) => {
            let skip = buffer.len().saturating_sub(count);
            buffer.iter().skip(skip).cloned().collect()
        }
        None => Vec::new(),
    }
}

/// Recent records formatted one per line
pub fn recent_formatted(count: usize) -> String {
    recent(count)
        .iter()
        .map(|r| r.format())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format() {
        let record = CapturedRecord {
            level: Level::Warn,
            target: "molt_app::upgrade".into(),
            message: "Upgrade attempt abandoned".into(),
            timestamp: SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(3_723_004),
        };
        assert_eq!(
            record.format(),
            "01:02:03.004 WARN  [molt_app::upgrade] Upgrade attempt abandoned"
        );
    }
}
