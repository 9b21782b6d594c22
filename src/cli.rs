//! Command-line interface.

use crate::config::BackendKind;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Coordinate a looping alert tone across processes.
///
/// Run one singlebell per terminal (or let other programs run it). However
/// many are running, at most one sounds the alert, and any of them can
/// silence all of them.
#[derive(Parser, Debug, Clone)]
#[command(name = "singlebell")]
#[command(author = "Thomas Vincent")]
#[command(version)]
#[command(about = "One alert tone across many processes", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "SINGLEBELL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Audio output to use (overrides the config file)
    #[arg(short = 'B', long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Time between bursts, e.g. "2s" or "1500ms"
    #[arg(short = 'i', long, value_parser = parse_interval)]
    pub interval: Option<Duration>,

    /// Directory of the shared lease store
    #[arg(long, env = "SINGLEBELL_STORE_DIR")]
    pub store_dir: Option<PathBuf>,

    /// Do not use the broadcast bus; rely on store change events only
    #[arg(long)]
    pub no_bus: bool,

    /// Silence the alert in every process, then exit
    #[arg(long, conflicts_with = "status")]
    pub stop: bool,

    /// Print who holds the leases, then exit
    #[arg(long)]
    pub status: bool,

    /// Print status as JSON
    #[arg(long, requires = "status")]
    pub json: bool,

    /// Print a sample configuration file, then exit
    #[arg(long)]
    pub sample_config: bool,

    /// Verbose logging
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// A humantime duration that is not zero.
fn parse_interval(value: &str) -> Result<Duration, String> {
    let interval = humantime::parse_duration(value).map_err(|e| e.to_string())?;
    if interval.is_zero() {
        return Err("interval must be greater than zero".to_string());
    }
    Ok(interval)
}

impl Args {
    /// Parse command line arguments.
    pub fn parse_args() -> Self {
        Args::parse()
    }

    /// Whether this run drives an interactive terminal session.
    pub fn is_interactive(&self) -> bool {
        !(self.stop || self.status || self.sample_config)
    }
}
