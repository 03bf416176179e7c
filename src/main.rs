//! molt - A self-upgrading process monitor
//!
//! This is the main entry point. Without flags it checks for a newer release,
//! then supervises the configured processes. With `--install` it only
//! confirms a hand-off started by the previous instance.

mod cli;
mod install;
mod monitor;

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use molt_app::config::{self, load_settings_from};
use molt_app::{log_capture, EventLog, HardFailure, HardFailureKind, Settings};

use cli::Cli;
use monitor::Outcome;

/// Records shown after a hard failure
const REPORT_RECORDS: usize = 20;

fn main() {
    let cli = Cli::parse_args();

    if let Err(e) = log_capture::init(cli.log_level) {
        eprintln!("molt: failed to initialise logging: {}", e);
    }

    let config_path = match resolve_config_path(&cli) {
        Ok(path) => path,
        Err(failure) => {
            report_hard_failure(&failure, None);
            std::process::exit(failure.exit_code());
        }
    };

    if cli.install {
        log::info!("Starting molt {} in install mode", env!("CARGO_PKG_VERSION"));
        let handoff = install::DetachedRespawn::capture();
        let code = install::run_install(&config_path, cli.config.as_deref(), &handoff);
        std::process::exit(code);
    }

    log::info!("Starting molt {}", env!("CARGO_PKG_VERSION"));
    std::process::exit(run(&cli, &config_path));
}

fn run(cli: &Cli, config_path: &Path) -> i32 {
    let settings = match load_settings(config_path) {
        Ok(settings) => settings,
        Err(failure) => {
            report_hard_failure(&failure, None);
            return failure.exit_code();
        }
    };

    let log = match open_event_log(cli) {
        Ok(log) => Arc::new(log),
        Err(failure) => {
            report_hard_failure(&failure, None);
            return failure.exit_code();
        }
    };

    let code = match monitor::run_monitor(&settings, &log, cli.config.clone()) {
        Ok(Outcome::HandedOff) => {
            log::info!("Hand-off complete, exiting");
            0
        }
        Ok(Outcome::Stopped) => 0,
        Err(failure) => {
            report_hard_failure(&failure, Some(&log));
            failure.exit_code()
        }
    };

    log.close();
    code
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf, HardFailure> {
    match cli.config.clone().or_else(config::config_path) {
        Some(path) => Ok(path),
        None => Err(HardFailure::with_source(
            HardFailureKind::BadConfig,
            config::ConfigError::NoConfigDir,
        )),
    }
}

fn load_settings(path: &Path) -> Result<Settings, HardFailure> {
    log::info!("Loading settings from {}", path.display());
    let settings = load_settings_from(path)
        .map_err(|e| HardFailure::with_source(HardFailureKind::BadConfig, e))?;
    settings
        .validate()
        .map_err(|e| HardFailure::with_source(HardFailureKind::BadConfig, e))?;
    Ok(settings)
}

fn open_event_log(cli: &Cli) -> Result<EventLog, HardFailure> {
    match cli.event_log.clone().or_else(config::event_log_path) {
        Some(path) => EventLog::open(&path),
        None => {
            log::warn!("No data directory; event log kept in memory only");
            Ok(EventLog::in_memory())
        }
    }
}

/// Tell the operator why the process is about to stop
pub(crate) fn report_hard_failure(failure: &HardFailure, log: Option<&EventLog>) {
    log::error!("{}", failure);
    if let Some(log) = log {
        log.hard_fail(failure);
    }

    eprintln!("molt: fatal error {}", failure);
    let mut source = failure.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {}", cause);
        source = cause.source();
    }

    let recent = log_capture::recent_formatted(REPORT_RECORDS);
    if !recent.is_empty() {
        eprintln!("recent log records:\n{}", recent);
    }
}
