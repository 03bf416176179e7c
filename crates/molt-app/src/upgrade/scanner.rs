//! Release discovery on the distribution root

use std::path::Path;

use molt_core::{CodecError, Version};

use crate::event_log::EventLog;
use crate::failure::SoftFailure;

/// Whether a directory name may name a release
///
/// Empty names, hidden names and names starting with a letter (build
/// configuration folders such as `Debug`) are skipped. Only the first
/// character is inspected.
pub fn is_candidate_release_name(name: &str) -> bool {
    match name.chars().next() {
        None => false,
        Some('.') => false,
        Some(c) => !c.is_alphabetic(),
    }
}

/// Find the highest release published under `root`
///
/// An unreadable root is a soft failure and yields `Ok(None)`. A candidate
/// directory whose name does not parse as a version is a configuration
/// defect and is returned as an error.
pub fn find_highest(root: &Path, log: &EventLog) -> Result<Option<Version>, CodecError> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            log::debug!("Cannot read distribution root {}: {}", root.display(), e);
            log.soft_fail(SoftFailure::InvalidDir);
            return Ok(None);
        }
    };

    let mut highest: Option<Version> = None;
    for entry in entries.flatten() {
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }

        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !is_candidate_release_name(&name) {
            continue;
        }

        let version = Version::parse(&name)?;
        highest = highest.max(Some(version));
    }

    Ok(highest)
}
