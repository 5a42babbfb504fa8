use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use config::{Config, WatchMode};
use std::path::{Path, PathBuf};

/// Most worker threads accepted on the command line.
const MAX_WORKERS: usize = 256;

/// fsentinel: removable storage surveillance
///
/// fsentinel watches USB mass-storage devices as they are mounted and reports
/// every file written, deleted or re-permissioned on them, flagging known
/// malware and writers running from outside the trusted system directories.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about, version)]
pub struct Cli {
    /// Path to configuration file.
    ///
    /// If not provided, the default locations are checked. They are
    /// `/etc/fsentinel/config.toml` and `/etc/fsentinel/config.d/*.toml`,
    /// where the latter being a glob pattern. If they don't exist, the default
    /// configuration is used.
    #[arg(short, long, value_parser = validate_file)]
    pub config: Option<PathBuf>,

    /// Number of classifier worker threads. Overrides the configuration.
    #[arg(short, long, value_parser = validate_workers)]
    pub workers: Option<usize>,

    /// How watches are armed on a mount: `recursive` or `mount_wide`.
    /// Overrides the configuration.
    #[arg(long)]
    pub watch_mode: Option<WatchMode>,

    /// Print the resolved configuration and exit.
    #[arg(long)]
    pub check_config: bool,

    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,
}

impl Cli {
    /// Apply command line overrides on top of a loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(workers) = self.workers {
            config.monitor.workers = workers;
        }
        if let Some(mode) = self.watch_mode {
            config.monitor.watch_mode = mode;
        }
    }
}

/// Check if the file exists.
#[inline(always)]
fn validate_file(file: &str) -> Result<PathBuf, String> {
    let path = Path::new(file);
    if path.exists() {
        Ok(path.to_owned())
    } else {
        Err(format!("File not found: {:?}", path))
    }
}

/// Validate the worker count.
#[inline(always)]
fn validate_workers(workers: &str) -> Result<usize, String> {
    let workers: usize = workers
        .parse()
        .map_err(|_| format!("`{workers}` is not a valid worker count"))?;
    if (1..=MAX_WORKERS).contains(&workers) {
        Ok(workers)
    } else {
        Err(format!("Worker count must be between 1 and {MAX_WORKERS}"))
    }
}
