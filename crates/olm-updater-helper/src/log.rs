//! Logging to stderr and a per-run file.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// `<logs_dir>/update-helper-<timestamp>.log`
#[must_use]
pub fn log_file_path(logs_dir: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    logs_dir.join(format!("update-helper-{timestamp}.log"))
}

/// Install the global subscriber. Returns the log file path.
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_logging(logs_dir: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(logs_dir)?;
    let path = log_file_path(logs_dir);
    let file = File::create(&path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,olm_updater_helper=info,olm_core=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(false),
        )
        .init();

    tracing::info!(
        "=== olm update helper {} started {} ===",
        env!("CARGO_PKG_VERSION"),
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    Ok(path)
}

/// Logs directory for a handoff file at `<root>/temp/update_info.json`.
#[must_use]
pub fn logs_dir_for(handoff: &Path) -> PathBuf {
    handoff
        .parent()
        .and_then(Path::parent)
        .map_or_else(std::env::temp_dir, |root| root.join("logs"))
}
