//! Process group supervision
//!
//! Worker processes started from the settings file run in one process group
//! watched by a [`Supervisor`] thread, which records their lifecycle.

mod record;
mod watchdog;

pub use record::EventRecord;
pub use watchdog::{Supervisor, SupervisorError};
