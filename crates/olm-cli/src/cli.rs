//! CLI argument definitions.

use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{Args, ColorChoice, Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use colorchoice_clap::Color;
use olm_core::Bump;
use tracing::level_filters::LevelFilter;

use crate::logging::{LogConfig, LogFormat};

#[derive(Parser)]
#[command(
    name = "olm",
    version,
    about = "Manage local models: resumable pulls and self-update",
    long_about = "Pull, pause and resume models on a local model server, and keep this\n\
                  installation up to date with backed-up, restorable updates."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Application root (default: $OLM_HOME, then the executable's directory).
    #[arg(long, value_name = "DIR", global = true)]
    pub root: Option<PathBuf>,

    /// Adjust log verbosity (-v for info, -vv for debug, -q for errors only).
    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,

    /// Control ANSI color output (auto, always, never).
    #[command(flatten)]
    pub color: Color,

    /// Explicit log level (overrides -v/-q flags).
    #[arg(long = "log-level", value_enum, global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Log output format.
    #[arg(long = "log-format", value_enum, default_value = "pretty", global = true)]
    pub log_format: LogFormatArg,

    /// Write logs to a file instead of stderr.
    #[arg(long = "log-file", value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Inspect and manage models on the server.
    #[command(subcommand)]
    Models(ModelsCommand),

    /// Pull a model in the foreground. Ctrl-C pauses it.
    Pull(PullArgs),

    /// Inspect and control download tasks.
    #[command(subcommand)]
    Tasks(TasksCommand),

    /// Check for, download and install application updates.
    #[command(subcommand)]
    Update(UpdateCommand),

    /// Version string utilities.
    #[command(subcommand)]
    Version(VersionCommand),
}

#[derive(Subcommand)]
pub enum ModelsCommand {
    /// List installed models.
    List,
    /// List models loaded in memory.
    Ps,
    /// Delete an installed model.
    Delete(NameArg),
    /// Unload a model from memory.
    Unload(NameArg),
}

#[derive(Args)]
pub struct NameArg {
    /// Model name, e.g. `llama3` or `llama3:8b`.
    pub name: String,
}

#[derive(Args)]
pub struct PullArgs {
    /// Model name.
    pub name: String,
}

#[derive(Subcommand)]
pub enum TasksCommand {
    /// List tasks on record.
    List,
    /// Resume a paused or failed task and follow it.
    Resume(TaskArg),
    /// Pause a queued task.
    Pause(TaskArg),
    /// Cancel a task and discard its partial file.
    Cancel(TaskArg),
}

#[derive(Args)]
pub struct TaskArg {
    /// Task name.
    pub name: String,
}

#[derive(Subcommand)]
pub enum UpdateCommand {
    /// Ask the configured source for a newer version.
    Check(CheckArgs),
    /// Download the available update into `temp/update.zip`.
    Download(CheckArgs),
    /// Hand the downloaded update to the helper and exit.
    Apply,
    /// List backups taken before earlier updates.
    Backups,
    /// Restore a backup (default: the newest).
    Rollback(RollbackArgs),
    /// Delete old backups.
    Prune(PruneArgs),
    /// Skip a version in future automatic checks.
    Skip(SkipArgs),
}

#[derive(Args)]
pub struct CheckArgs {
    /// Offer the latest version even when it was skipped.
    #[arg(long)]
    pub force: bool,
}

#[derive(Args)]
pub struct RollbackArgs {
    /// Backup directory to restore.
    #[arg(value_name = "PATH")]
    pub path: Option<PathBuf>,
}

#[derive(Args)]
pub struct PruneArgs {
    /// Backups to keep (default: the configured `backup_keep`).
    #[arg(long)]
    pub keep: Option<usize>,
}

#[derive(Args)]
pub struct SkipArgs {
    /// Version to skip.
    pub version: String,
}

#[derive(Subcommand)]
pub enum VersionCommand {
    /// Compare two versions.
    Compare {
        /// Current version.
        current: String,
        /// Candidate version.
        remote: String,
    },
    /// Print the next version for a bump.
    Next {
        /// Starting version.
        version: String,
        /// Component to increment.
        #[arg(long, value_enum, default_value = "patch")]
        bump: BumpArg,
    },
    /// Strictly validate a version string.
    Validate {
        /// Version to check.
        version: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BumpArg {
    Major,
    Minor,
    Patch,
}

impl From<BumpArg> for Bump {
    fn from(value: BumpArg) -> Self {
        match value {
            BumpArg::Major => Self::Major,
            BumpArg::Minor => Self::Minor,
            BumpArg::Patch => Self::Patch,
        }
    }
}

/// CLI log level choices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// CLI log format choices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

impl Cli {
    /// Logging configuration from the flags.
    ///
    /// `--log-level` beats `-v/-q`, which beat `RUST_LOG`.
    #[must_use]
    pub fn log_config(&self) -> LogConfig {
        let mut config = LogConfig {
            level_filter: self.verbosity.tracing_level_filter(),
            use_env_filter: !(self.verbosity.is_present() || self.log_level.is_some()),
            ..LogConfig::default()
        };
        if let Some(level) = self.log_level {
            config.level_filter = match level {
                LogLevelArg::Error => LevelFilter::ERROR,
                LogLevelArg::Warn => LevelFilter::WARN,
                LogLevelArg::Info => LevelFilter::INFO,
                LogLevelArg::Debug => LevelFilter::DEBUG,
                LogLevelArg::Trace => LevelFilter::TRACE,
            };
        }
        config.format = match self.log_format {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        };
        config.log_file.clone_from(&self.log_file);
        config.with_ansi = match self.color.color {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => self.log_file.is_none() && io::stderr().is_terminal(),
        };
        config
    }
}
