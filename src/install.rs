//! Install mode - confirms the hand-off from the old instance
//!
//! This module is used when molt is started with the --install flag by an
//! instance that staged this executable. It:
//! 1. Loads the settings, rewriting an older layout in place
//! 2. Writes the confirmation token to the old instance's endpoint
//! 3. Waits for the old instance to exit
//! 4. Starts this executable again as the monitoring daemon
//!
//! A delivered token does not mean the old instance accepted it: its
//! attempt may already have timed out. Only its exit shows that it let go,
//! so the daemon is not started before that.

use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use molt_app::config::load_and_upgrade_file;
use molt_app::upgrade::start_new;
use molt_app::{HardFailure, HardFailureKind};

/// Exit code when the old instance could not be reached or did not let go
pub const CLIENT_FAILURE: i32 = 1;

/// Time the old instance gets to shut down after its attempt resolved
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Interval between checks on the old instance
const EXIT_POLL: Duration = Duration::from_millis(20);

/// The parts of a hand-off that involve other processes
pub trait Handoff {
    /// Wait up to `timeout` for the instance that launched us to exit
    fn predecessor_exited(&self, timeout: Duration) -> bool;

    /// Start the monitoring daemon and return its pid
    fn respawn(&self, config_override: Option<&Path>) -> io::Result<u32>;
}

/// Hand-off from the parent process to a detached daemon
pub struct DetachedRespawn {
    parent: u32,
}

impl DetachedRespawn {
    /// Remember the current parent; call before the token is sent
    pub fn capture() -> Self {
        Self {
            parent: std::os::unix::process::parent_id(),
        }
    }
}

impl Handoff for DetachedRespawn {
    fn predecessor_exited(&self, timeout: Duration) -> bool {
        // Orphans are reparented, so a new parent id means the old one exited
        wait_until(timeout, || std::os::unix::process::parent_id() != self.parent)
    }

    fn respawn(&self, config_override: Option<&Path>) -> io::Result<u32> {
        use std::os::unix::process::CommandExt;

        let exe = std::env::current_exe()?;
        let mut command = Command::new(&exe);
        if let Some(config) = config_override {
            command.arg("--config").arg(config);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);

        let child = command.spawn()?;
        Ok(child.id())
    }
}

/// Run the installer and return the process exit code
pub fn run_install<H: Handoff>(
    config_path: &Path,
    config_override: Option<&Path>,
    handoff: &H,
) -> i32 {
    let settings = match load_and_upgrade_file(config_path) {
        Ok(settings) => settings,
        Err(e) => {
            let failure = HardFailure::with_source(HardFailureKind::BadConfig, e);
            crate::report_hard_failure(&failure, None);
            return failure.exit_code();
        }
    };

    let endpoint = settings.upgrade.endpoint_path();
    log::info!("Confirming hand-off on {}", endpoint.display());
    if let Err(e) = start_new(&endpoint) {
        log::error!("Hand-off to {} failed: {}", endpoint.display(), e);
        return CLIENT_FAILURE;
    }

    let deadline = settings.upgrade.handshake_timeout() + EXIT_GRACE;
    if !handoff.predecessor_exited(deadline) {
        log::error!(
            "Previous instance still running after {} ms; not starting a second monitor",
            deadline.as_millis()
        );
        return CLIENT_FAILURE;
    }

    match handoff.respawn(config_override) {
        Ok(pid) => {
            log::info!("Monitoring continues in pid {}", pid);
            0
        }
        Err(e) => {
            log::error!("Failed to start the monitoring daemon: {}", e);
            CLIENT_FAILURE
        }
    }
}

/// Poll `done` until it holds or `timeout` passes
fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(EXIT_POLL.min(deadline - now));
    }
}
