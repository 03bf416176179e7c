//! molt-core: Building blocks for the molt monitor
//!
//! This crate provides the pieces that do not depend on configuration or
//! logging policy:
//! - Four-part release versions
//! - A completion reactor over Unix descriptors
//! - Process groups with lifecycle notifications

pub mod version;

#[cfg(unix)]
pub mod process_group;
#[cfg(unix)]
pub mod reactor;

pub use version::{CodecError, CodecErrorKind, Version};

#[cfg(unix)]
pub use process_group::{
    adopt_orphans, classify_exit, ExitState, GroupError, GroupEvent, GroupLimits, ProcessGroup,
};
#[cfg(unix)]
pub use reactor::{Completion, CompletionHandler, Operation, Reactor, ReactorError, RunStatus};
