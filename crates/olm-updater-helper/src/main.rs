//! Update helper for the local model manager.
//!
//! Started by the application after it downloads an update and writes
//! `temp/update_info.json`. Installs the package while the application is
//! not running, then starts it again.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use olm_updater_helper::launch::DetachedLauncher;
use olm_updater_helper::log::{init_logging, logs_dir_for};
use olm_updater_helper::{Orchestrator, SystemProcesses, WaitPolicy};
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "olm-updater-helper", version, about = "Install a downloaded olm update")]
struct Args {
    /// Handoff document written by the application.
    #[arg(long, visible_alias = "update-info", value_name = "FILE")]
    handoff: PathBuf,

    /// Seconds to wait for the application before terminating it.
    #[arg(long, default_value_t = 30, value_name = "SECS")]
    wait_timeout: u64,

    /// Milliseconds to pause after the application exits.
    #[arg(long, default_value_t = 2000, value_name = "MS")]
    settle_ms: u64,
}

fn run(args: &Args) -> Result<()> {
    let log_file = match init_logging(&logs_dir_for(&args.handoff)) {
        Ok(path) => Some(path),
        Err(e) => {
            eprintln!("[olm-updater-helper] file logging unavailable: {e}");
            None
        }
    };

    let policy = WaitPolicy {
        timeout: Duration::from_secs(args.wait_timeout),
        settle: Duration::from_millis(args.settle_ms),
        ..WaitPolicy::default()
    };
    let mut orchestrator = Orchestrator::new(SystemProcesses, DetachedLauncher, policy);
    if let Some(path) = log_file {
        orchestrator = orchestrator.with_log_file(path);
    }

    let status = orchestrator
        .run(&args.handoff, &mut |_| {})
        .with_context(|| format!("update from {} failed", args.handoff.display()))?;
    tracing::info!("Installed version {}", status.version);
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
