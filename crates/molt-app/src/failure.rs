//! Failure taxonomies
//!
//! A [`SoftFailure`] ends the current upgrade attempt and nothing else; the
//! running version keeps going. A [`HardFailure`] means the process can no
//! longer trust its own state and must stop with a kind-specific exit code.
//! The two never convert into each other.

use std::error::Error as StdError;
use std::fmt;
use std::panic::Location;

use molt_core::CodecError;
use thiserror::Error;

/// Recoverable conditions that abort one upgrade attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoftFailure {
    InvalidDir,
    InvalidFile,
    CreateFailed,
    CopyFailed,
    LaunchFailed,
    TimedOut,
    WrappedError,
}

impl SoftFailure {
    /// Stable numeric code, as written to the event log
    pub fn code(self) -> u32 {
        match self {
            SoftFailure::InvalidDir => 16,
            SoftFailure::InvalidFile => 17,
            SoftFailure::CreateFailed => 18,
            SoftFailure::CopyFailed => 19,
            SoftFailure::LaunchFailed => 20,
            SoftFailure::TimedOut => 21,
            SoftFailure::WrappedError => 22,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SoftFailure::InvalidDir => "[invalid dir]",
            SoftFailure::InvalidFile => "[invalid file]",
            SoftFailure::CreateFailed => "[create failed]",
            SoftFailure::CopyFailed => "[copy failed]",
            SoftFailure::LaunchFailed => "[launch failed]",
            SoftFailure::TimedOut => "[timed out]",
            SoftFailure::WrappedError => "[wrapped error]",
        }
    }
}

impl fmt::Display for SoftFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Kinds of unrecoverable failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardFailureKind {
    /// Settings could not be located, read or parsed
    BadConfig,
    /// A low-level error reached the top level
    Unexpected,
    /// The upgrade channel is in an inconsistent state
    Upgrade,
    /// Files or endpoints needed to run could not be set up
    FileIo,
}

impl HardFailureKind {
    /// Process exit code for this kind
    pub fn exit_code(self) -> i32 {
        match self {
            HardFailureKind::Unexpected => 2,
            HardFailureKind::BadConfig => 3,
            HardFailureKind::Upgrade => 4,
            HardFailureKind::FileIo => 5,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            HardFailureKind::BadConfig => "[bad config]",
            HardFailureKind::Unexpected => "[unexpected]",
            HardFailureKind::Upgrade => "[upgrade]",
            HardFailureKind::FileIo => "[file io]",
        }
    }
}

impl fmt::Display for HardFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An unrecoverable failure and where it was raised
#[derive(Error, Debug)]
#[error("{kind} at {file}:{line}")]
pub struct HardFailure {
    pub kind: HardFailureKind,
    pub file: &'static str,
    pub line: u32,
    #[source]
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

impl HardFailure {
    #[track_caller]
    pub fn new(kind: HardFailureKind) -> Self {
        let location = Location::caller();
        Self {
            kind,
            file: location.file(),
            line: location.line(),
            source: None,
        }
    }

    #[track_caller]
    pub fn with_source<E>(kind: HardFailureKind, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self {
            source: Some(source.into()),
            ..Self::new(kind)
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }
}

/// Codec errors escaping to the top level keep the line they were detected on
impl From<CodecError> for HardFailure {
    fn from(err: CodecError) -> Self {
        Self {
            kind: HardFailureKind::Unexpected,
            file: err.file,
            line: err.line,
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use molt_core::Version;

    #[test]
    fn test_exit_codes_are_distinct() {
        let kinds = [
            HardFailureKind::BadConfig,
            HardFailureKind::Unexpected,
            HardFailureKind::Upgrade,
            HardFailureKind::FileIo,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn test_hard_failure_records_caller() {
        let failure = HardFailure::new(HardFailureKind::Upgrade);
        assert_eq!(failure.line, line!() - 1);
        assert!(failure.file.ends_with("failure.rs"));
        assert_eq!(failure.exit_code(), 4);
    }

    #[test]
    fn test_codec_error_maps_to_unexpected() {
        let err = Version::parse("1.2").unwrap_err();
        let line = err.line;
        let failure = HardFailure::from(err);
        assert_eq!(failure.kind, HardFailureKind::Unexpected);
        assert_eq!(failure.line, line);
        assert!(failure.file.ends_with("version.rs"));
        assert!(failure.source.is_some());
    }

    #[test]
    fn test_soft_failure_codes() {
        assert_eq!(SoftFailure::InvalidDir.code(), 16);
        assert_eq!(SoftFailure::WrappedError.code(), 22);
        assert_eq!(SoftFailure::TimedOut.to_string(), "[timed out]");
    }
}
