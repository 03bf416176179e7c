//! molt-app: Application logic for molt
//!
//! This crate contains everything above the core building blocks: settings,
//! the event log, the failure taxonomy, self-upgrade and process group
//! supervision.

pub mod config;
pub mod event_log;
pub mod failure;
pub mod log_capture;
#[cfg(unix)]
pub mod supervisor;
#[cfg(unix)]
pub mod upgrade;

pub use config::{load_settings_from, save_settings, ConfigError, Settings};
pub use event_log::EventLog;
pub use failure::{HardFailure, HardFailureKind, SoftFailure};
#[cfg(unix)]
pub use supervisor::{EventRecord, Supervisor};
#[cfg(unix)]
pub use upgrade::{ProcessLauncher, Upgrader};
