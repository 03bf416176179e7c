//! CLI argument parsing for molt

use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

/// molt - Self-upgrading process monitor
#[derive(Parser, Debug)]
#[command(name = "molt")]
#[command(about = "Self-upgrading process monitor")]
#[command(version)]
pub struct Cli {
    /// Confirm the hand-off to the running instance, then exit
    #[arg(long = "install")]
    pub install: bool,

    /// Settings file (default: platform config directory)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Log level, overriding RUST_LOG
    #[arg(long = "log-level")]
    pub log_level: Option<LevelFilter>,

    /// Event log file (default: platform data directory)
    #[arg(long = "event-log")]
    pub event_log: Option<PathBuf>,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
