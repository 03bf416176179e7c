//! Supervisory loop of a running instance

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use signal_hook::consts::{SIGINT, SIGTERM};

use molt_app::{
    EventLog, HardFailure, HardFailureKind, ProcessLauncher, Settings, Supervisor, Upgrader,
};

/// Granularity of the wait between upgrade checks
const SLICE: Duration = Duration::from_millis(250);

/// How the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    HandedOff,
    Stopped,
}

/// Check for an upgrade, then supervise until stopped or replaced
pub fn run_monitor(
    settings: &Settings,
    log: &Arc<EventLog>,
    config_override: Option<PathBuf>,
) -> Result<Outcome, HardFailure> {
    let upgrader = Upgrader::new(settings, log, ProcessLauncher::new(config_override))?;
    match upgrader.current_version() {
        Some(version) => log::info!("Running version {}", version),
        None => log::warn!("Running from an unversioned install directory"),
    }

    if upgrader.try_upgrade()? {
        return Ok(Outcome::HandedOff);
    }

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop))
            .map_err(|e| HardFailure::with_source(HardFailureKind::FileIo, e))?;
    }

    supervise(settings, log, settings.upgrade.check_interval(), &stop, || {
        upgrader.try_upgrade()
    })
}

/// Run the workers, checking for an upgrade every `interval`
///
/// The workers are stopped however the loop ends, including on a hard
/// failure; the new instance starts its own from the same settings.
fn supervise<F>(
    settings: &Settings,
    log: &Arc<EventLog>,
    interval: Duration,
    stop: &AtomicBool,
    mut check: F,
) -> Result<Outcome, HardFailure>
where
    F: FnMut() -> Result<bool, HardFailure>,
{
    let supervisor = Supervisor::start(
        &settings.supervisor.group_name,
        settings.supervisor.limits(),
        Arc::clone(log),
    )
    .map_err(|e| HardFailure::with_source(HardFailureKind::FileIo, e))?;

    for process in &settings.processes {
        if let Err(e) = supervisor.spawn(&mut process.build_command()) {
            log::error!("Failed to start {}: {}", process.command, e);
        }
    }

    let outcome = loop {
        if wait_or_stop(interval, stop) {
            log::info!("Stop requested");
            break Ok(Outcome::Stopped);
        }
        match check() {
            Ok(true) => break Ok(Outcome::HandedOff),
            Ok(false) => {}
            Err(failure) => break Err(failure),
        }
    };

    if let Err(e) = supervisor.terminate_all() {
        log::warn!("Failed to signal workers: {}", e);
    }
    match supervisor.shutdown() {
        Ok(record) => log::info!(
            "Supervised {} process(es): {} normal exit(s), {} abnormal",
            record.new_processes.len(),
            record.normal_exits.len(),
            record.abnormal_exits.len()
        ),
        Err(e) => log::warn!("Supervisor did not stop cleanly: {}", e),
    }

    outcome
}

/// Sleep for `interval`; returns true as soon as `stop` is set
fn wait_or_stop(interval: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + interval;
    loop {
        if stop.load(Ordering::Relaxed) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(SLICE.min(deadline - now));
    }
}
