//! `olm`: local model manager.

use std::process::ExitCode;

use clap::Parser;
use olm_cli::cli::{Cli, Command};
use olm_cli::logging::init_logging;
use tracing::{Instrument, info_span, warn};

mod commands;
mod summary;

use crate::commands::{Context, run_models, run_pull, run_tasks, run_update, run_version};

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Models(_) => "models",
        Command::Pull(_) => "pull",
        Command::Tasks(_) => "tasks",
        Command::Update(_) => "update",
        Command::Version(_) => "version",
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    if let Command::Version(command) = &cli.command {
        return run_version(command);
    }

    let mut ctx = Context::load(cli.root)?;
    if let Err(e) = ctx.report_last_update() {
        warn!("Could not read the last update status: {:#}", e);
    }

    match &cli.command {
        Command::Models(command) => run_models(&ctx, command).await,
        Command::Pull(args) => run_pull(&ctx, args).await,
        Command::Tasks(command) => run_tasks(&ctx, command).await,
        Command::Update(command) => run_update(&mut ctx, command).await,
        Command::Version(command) => run_version(command),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    cli.color.write_global();
    if let Err(error) = init_logging(&cli.log_config()) {
        eprintln!("error: failed to initialize logging: {error}");
        return ExitCode::FAILURE;
    }

    let span = info_span!("command", name = command_name(&cli.command));
    match run(cli).instrument(span).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
