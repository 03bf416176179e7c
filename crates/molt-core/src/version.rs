//! Four-part release versions
//!
//! Releases are identified by `major.minor.revision.build`, each part an
//! unsigned 16-bit decimal. The same string form names release directories
//! on the distribution root and in the local install tree.

use std::fmt;
use std::panic::Location;
use std::str::FromStr;

use thiserror::Error;

/// Errors produced while decoding a version string
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} in {input:?} (line {line})")]
pub struct CodecError {
    /// What went wrong
    pub kind: CodecErrorKind,
    /// The text that failed to decode
    pub input: String,
    /// Source file where the failure was detected
    pub file: &'static str,
    /// Source line where the failure was detected
    pub line: u32,
}

/// Reason a version string was rejected
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecErrorKind {
    #[error("missing component {0}")]
    MissingComponent(usize),

    #[error("non-numeric component {0}")]
    NotNumeric(usize),

    #[error("component {0} exceeds 65535")]
    Overflow(usize),

    #[error("unexpected trailing input")]
    TrailingInput,
}

impl CodecError {
    #[track_caller]
    fn new(kind: CodecErrorKind, input: &str) -> Self {
        let location = Location::caller();
        Self {
            kind,
            input: input.to_string(),
            file: location.file(),
            line: location.line(),
        }
    }
}

/// A release version
///
/// Ordering compares fields left to right; the derived `Ord` relies on the
/// field declaration order below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub revision: u16,
    pub build: u16,
}

impl Version {
    /// Version reported by non-versioned development builds
    pub const DEVELOPMENT: Version = Version::new(0, 0, 0, 10);

    pub const fn new(major: u16, minor: u16, revision: u16, build: u16) -> Self {
        Self {
            major,
            minor,
            revision,
            build,
        }
    }

    /// Parse a dot-separated version with exactly four numeric components
    pub fn parse(text: &str) -> Result<Self, CodecError> {
        let mut parts = [0u16; 4];
        let mut rest = text.split('.');

        for (index, slot) in parts.iter_mut().enumerate() {
            let component = rest
                .next()
                .ok_or_else(|| CodecError::new(CodecErrorKind::MissingComponent(index), text))?;
            *slot = parse_component(component, index, text)?;
        }

        if rest.next().is_some() {
            return Err(CodecError::new(CodecErrorKind::TrailingInput, text));
        }

        let [major, minor, revision, build] = parts;
        Ok(Self::new(major, minor, revision, build))
    }

    /// The four components in order
    pub fn components(&self) -> [u16; 4] {
        [self.major, self.minor, self.revision, self.build]
    }
}

fn parse_component(component: &str, index: usize, text: &str) -> Result<u16, CodecError> {
    if component.is_empty() {
        return Err(CodecError::new(CodecErrorKind::MissingComponent(index), text));
    }

    // The fourth component is the last thing in the string; anything that is
    // not a digit there is trailing garbage rather than a bad number.
    if let Some(pos) = component.find(|c: char| !c.is_ascii_digit()) {
        let kind = if index == 3 && pos > 0 {
            CodecErrorKind::TrailingInput
        } else {
            CodecErrorKind::NotNumeric(index)
        };
        return Err(CodecError::new(kind, text));
    }

    component
        .parse::<u16>()
        .map_err(|_| CodecError::new(CodecErrorKind::Overflow(index), text))
}

impl FromStr for Version {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.revision, self.build
        )
    }
}
