//! Self-upgrade for molt
//!
//! A running instance periodically looks for a newer release under the
//! distribution root, stages it next to its own install directory, launches
//! it with `--install` and waits for it to confirm over a local socket:
//!
//! - `scanner` finds the highest published release
//! - `handshake` runs both halves of the confirmation protocol
//! - `upgrader` orders the steps and decides success or failure

mod handshake;
mod scanner;
mod upgrader;

pub use handshake::{
    send_payload, start_new, HandshakeAction, HandshakeEvent, HandshakeMachine, HandshakeMessage,
    HandshakeServer, HandshakeState, MESSAGE_LEN,
};
pub use scanner::{find_highest, is_candidate_release_name};
pub use upgrader::{file_sha256, Launcher, ProcessLauncher, Upgrader};
