use std::cmp::Ordering;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result, anyhow, bail};
use indicatif::{ProgressBar, ProgressStyle};
use olm_core::config::{AppPaths, Settings};
use olm_core::download::format_bytes;
use olm_core::install::{BackupStore, InstallOptions, Installer};
use olm_core::ollama::OllamaClient;
use olm_core::registry::TaskStatus;
use olm_core::tasks::{PullDisposition, TaskEvent, TaskManager, TaskOutcome};
use olm_core::update::{DownloadStart, Supervisor, UPDATE_TASK, UpdateCheck};
use olm_core::version;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use olm_cli::cli::{
    CheckArgs, ModelsCommand, PruneArgs, PullArgs, RollbackArgs, SkipArgs, TaskArg, TasksCommand,
    UpdateCommand, VersionCommand,
};
use crate::summary::{backups_table, models_table, running_table, tasks_table};

/// Resolved paths and loaded settings for one invocation.
pub struct Context {
    paths: AppPaths,
    settings: Settings,
}

impl Context {
    pub fn load(root: Option<PathBuf>) -> Result<Self> {
        let paths = AppPaths::resolve(root).context("failed to resolve application root")?;
        let settings_file = paths.settings_file();
        let settings = Settings::load_or_default(&settings_file)
            .with_context(|| format!("failed to load {}", settings_file.display()))?;
        info!("Application root: {}", paths.root().display());
        Ok(Self { paths, settings })
    }

    fn ollama(&self) -> Result<OllamaClient> {
        OllamaClient::new(&self.settings.server).context("invalid server settings")
    }

    fn task_manager(&self) -> Result<(TaskManager, UnboundedReceiver<TaskEvent>)> {
        let tasks_file = self.paths.tasks_file();
        TaskManager::open(&tasks_file, &self.settings.downloads, self.ollama()?)
            .with_context(|| format!("failed to open {}", tasks_file.display()))
    }

    fn supervisor(&self) -> Result<Supervisor> {
        Ok(Supervisor::new(
            self.paths.clone(),
            self.settings.update.clone(),
            olm_core::VERSION,
        )?)
    }

    fn backups(&self) -> BackupStore {
        BackupStore::new(self.paths.backup_dir())
    }

    fn save_update_settings(&mut self, supervisor: &Supervisor) -> Result<()> {
        self.settings.update = supervisor.settings().clone();
        let path = self.paths.settings_file();
        self.settings
            .save(&path)
            .with_context(|| format!("failed to save {}", path.display()))
    }

    /// Print the outcome of an update installed since the last run.
    pub fn report_last_update(&self) -> Result<()> {
        let supervisor = self.supervisor()?;
        if supervisor.is_check_due() {
            info!("An update check is due; run `olm update check`");
        }
        let Some(status) = supervisor.take_status()? else {
            return Ok(());
        };
        if status.success {
            eprintln!(
                "Updated to {} (from {}).",
                status.version,
                status.previous_version.as_deref().unwrap_or("unknown")
            );
        } else {
            eprintln!(
                "The update to {} failed and was rolled back: {}",
                status.version,
                status.error.as_deref().unwrap_or("unknown error")
            );
            if let Some(log) = &status.log_file {
                eprintln!("See {}", log.display());
            }
        }
        Ok(())
    }
}

pub async fn run_models(ctx: &Context, command: &ModelsCommand) -> Result<ExitCode> {
    let client = ctx.ollama()?;
    if !client.check_connection().await {
        bail!("model server at {} is not reachable", client.base_url());
    }

    match command {
        ModelsCommand::List => {
            let models = client.list_models().await?;
            println!("{}", models_table(&models));
        }
        ModelsCommand::Ps => {
            let running = client.running_models().await?;
            println!("{}", running_table(&running));
        }
        ModelsCommand::Delete(arg) => {
            client
                .delete_model(&arg.name)
                .await
                .with_context(|| format!("failed to delete {}", arg.name))?;
            println!("Deleted {}", arg.name);
            println!("Disk usage now {}", format_bytes(client.disk_usage().await?));
        }
        ModelsCommand::Unload(arg) => {
            client
                .unload_model(&arg.name)
                .await
                .with_context(|| format!("failed to unload {}", arg.name))?;
            println!("Unloaded {}", arg.name);
            println!("VRAM in use {}", format_bytes(client.vram_usage().await?));
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn run_pull(ctx: &Context, args: &PullArgs) -> Result<ExitCode> {
    let (manager, mut events) = ctx.task_manager()?;
    let disposition = manager.pull_model(&args.name)?;
    announce(&args.name, disposition);
    let followed = follow(&manager, &mut events, &args.name).await?;
    Ok(exit_code(&args.name, &followed))
}

pub async fn run_tasks(ctx: &Context, command: &TasksCommand) -> Result<ExitCode> {
    let (manager, mut events) = ctx.task_manager()?;
    match command {
        TasksCommand::List => {
            let tasks = manager.list()?;
            if tasks.is_empty() {
                println!("No tasks on record.");
            } else {
                println!("{}", tasks_table(&tasks));
            }
        }
        TasksCommand::Resume(TaskArg { name }) => {
            let disposition = manager.resume(name)?;
            announce(name, disposition);
            let followed = follow(&manager, &mut events, name).await?;
            return Ok(exit_code(name, &followed));
        }
        TasksCommand::Pause(TaskArg { name }) => {
            manager.pause(name)?;
            println!("Paused {name}");
        }
        TasksCommand::Cancel(TaskArg { name }) => {
            manager.cancel(name)?;
            println!("Cancelled {name} and discarded its partial download");
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn run_update(ctx: &mut Context, command: &UpdateCommand) -> Result<ExitCode> {
    match command {
        UpdateCommand::Check(CheckArgs { force }) => {
            let mut supervisor = ctx.supervisor()?;
            let check = supervisor.check(*force).await;
            ctx.save_update_settings(&supervisor)?;
            print_check(supervisor.current_version(), &check?);
        }
        UpdateCommand::Download(CheckArgs { force }) => {
            let mut supervisor = ctx.supervisor()?;
            let check = supervisor.check(*force).await;
            ctx.save_update_settings(&supervisor)?;
            let remote = match check? {
                UpdateCheck::Available(remote) => remote,
                other => {
                    print_check(supervisor.current_version(), &other);
                    return Ok(ExitCode::SUCCESS);
                }
            };

            let (manager, mut events) = ctx.task_manager()?;
            match supervisor.start_download(&manager, &remote)? {
                DownloadStart::Copied => {}
                DownloadStart::Queued(disposition) => {
                    announce(UPDATE_TASK, disposition);
                    let followed = follow(&manager, &mut events, UPDATE_TASK).await?;
                    if !matches!(followed, Followed::Finished(TaskOutcome::Completed)) {
                        return Ok(exit_code(UPDATE_TASK, &followed));
                    }
                }
            }
            println!("Version {} is ready. Run `olm update apply` to install it.", remote.version);
        }
        UpdateCommand::Apply => {
            let supervisor = ctx.supervisor()?;
            let remote = supervisor
                .pending()?
                .ok_or_else(|| anyhow!("no downloaded update; run `olm update download` first"))?;
            supervisor.prepare_handoff(&remote)?;
            let pid = supervisor
                .launch_orchestrator()
                .context("failed to start the update helper")?;
            println!(
                "Installing {} in the background (helper pid {pid}). olm will restart when it is done.",
                remote.version
            );
        }
        UpdateCommand::Backups => {
            let store = ctx.backups();
            let backups: Vec<_> = store
                .list()?
                .into_iter()
                .map(|record| {
                    let size = store.size(&record);
                    (record, size)
                })
                .collect();
            if backups.is_empty() {
                println!("No backups in {}", store.root().display());
            } else {
                println!("{}", backups_table(&backups));
            }
        }
        UpdateCommand::Rollback(RollbackArgs { path }) => {
            let store = ctx.backups();
            let record = match path {
                Some(path) => store.load(path)?,
                None => store.latest()?.ok_or_else(|| anyhow!("no backups to restore"))?,
            };
            let installer = Installer::new(
                ctx.paths.root(),
                ctx.paths.backup_dir(),
                InstallOptions::from_settings(&ctx.settings.update),
            );
            installer
                .restore(&record)
                .with_context(|| format!("failed to restore {}", record.backup_path.display()))?;
            println!(
                "Restored backup taken before {} from {}",
                record.version,
                record.backup_path.display()
            );
        }
        UpdateCommand::Prune(PruneArgs { keep }) => {
            let keep = keep.unwrap_or(ctx.settings.update.backup_keep);
            let removed = ctx.backups().cleanup_old(keep)?;
            println!("Removed {removed} backup(s), kept up to {keep}");
        }
        UpdateCommand::Skip(SkipArgs { version: skipped }) => {
            version::validate(skipped)?;
            ctx.settings.update.skip_version(skipped.as_str());
            let path = ctx.paths.settings_file();
            ctx.settings.save(&path)?;
            println!("Version {skipped} will be skipped by automatic checks");
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub fn run_version(command: &VersionCommand) -> Result<ExitCode> {
    match command {
        VersionCommand::Compare { current, remote } => {
            let symbol = match version::compare(current, remote) {
                Ordering::Less => "<",
                Ordering::Equal => "=",
                Ordering::Greater => ">",
            };
            println!("{current} {symbol} {remote} ({})", version::classify(current, remote));
        }
        VersionCommand::Next { version: from, bump } => {
            println!("{}", version::next_version(from, (*bump).into()));
        }
        VersionCommand::Validate { version: candidate } => {
            let parsed = version::validate(candidate)?;
            let kind = if parsed.is_pre_release() { "prerelease" } else { "release" };
            println!("{parsed} is a valid {kind} version");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_check(current: &str, check: &UpdateCheck) {
    match check {
        UpdateCheck::UpToDate { latest } => {
            println!("Up to date (current {current}, latest {latest})");
        }
        UpdateCheck::Available(remote) => {
            let kind = if remote.force_update && !version::is_newer(current, &remote.version) {
                "required update".to_string()
            } else {
                version::classify(current, &remote.version).to_string()
            };
            println!("Update available: {current} -> {} ({kind})", remote.version);
            if let Some(size) = remote.declared_size() {
                println!("Download size: {}", format_bytes(size));
            }
            if !remote.release_notes.trim().is_empty() {
                println!("\n{}", remote.release_notes.trim());
            }
        }
        UpdateCheck::Skipped(remote) => {
            println!(
                "Version {} is available but skipped. Use --force to offer it anyway.",
                remote.version
            );
        }
    }
}

fn announce(name: &str, disposition: PullDisposition) {
    match disposition {
        PullDisposition::Started => println!("Pulling {name}"),
        PullDisposition::Resumed => println!("Resuming {name}"),
    }
}

/// How following a task ended.
enum Followed {
    Finished(TaskOutcome),
    Paused,
}

fn exit_code(name: &str, followed: &Followed) -> ExitCode {
    match followed {
        Followed::Finished(TaskOutcome::Completed) => ExitCode::SUCCESS,
        Followed::Paused => {
            println!("Paused {name}. Run `olm tasks resume {name}` to continue.");
            ExitCode::SUCCESS
        }
        Followed::Finished(TaskOutcome::Failed { reason }) => {
            eprintln!("{name} failed: {reason}");
            eprintln!("Run `olm tasks resume {name}` to retry from where it stopped.");
            ExitCode::FAILURE
        }
        Followed::Finished(TaskOutcome::Cancelled) => ExitCode::FAILURE,
    }
}

fn progress_bar(name: &str) -> Result<ProgressBar> {
    let style = ProgressStyle::with_template(
        "{prefix:.bold} [{elapsed_precise}] {wide_bar:.cyan/blue} {percent:>3}% {msg}",
    )
    .context("invalid progress template")?
    .progress_chars("=> ");
    let bar = ProgressBar::new(1000).with_style(style);
    bar.set_prefix(name.to_string());
    Ok(bar)
}

fn bar_position(percent: f64) -> u64 {
    (percent.clamp(0.0, 100.0) * 10.0).round() as u64
}

/// Render events for `name` until it finishes or pauses. Ctrl-C pauses.
async fn follow(
    manager: &TaskManager,
    events: &mut UnboundedReceiver<TaskEvent>,
    name: &str,
) -> Result<Followed> {
    let bar = progress_bar(name)?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut pausing = false;

    loop {
        tokio::select! {
            signal = &mut ctrl_c, if !pausing => {
                if let Err(e) = signal {
                    warn!("Cannot listen for Ctrl-C: {}", e);
                }
                pausing = true;
                bar.set_message("pausing...");
                manager.pause(name)?;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    bar.abandon();
                    bail!("task manager stopped unexpectedly");
                };
                if event.name() != name {
                    continue;
                }
                match event {
                    TaskEvent::Progress { percent, speed, eta, .. } => {
                        bar.set_position(bar_position(percent));
                        bar.set_message(format!("{speed}  ETA {eta}"));
                    }
                    TaskEvent::Status { message, .. } => {
                        bar.set_message(message);
                    }
                    TaskEvent::TaskUpdated(task) if task.status == TaskStatus::Paused => {
                        bar.abandon_with_message("paused");
                        return Ok(Followed::Paused);
                    }
                    TaskEvent::TaskUpdated(task) => {
                        bar.set_position(bar_position(task.progress));
                    }
                    TaskEvent::Finished { outcome, .. } => {
                        match &outcome {
                            TaskOutcome::Completed => {
                                bar.set_position(1000);
                                bar.finish_with_message("done");
                            }
                            other => bar.abandon_with_message(other.to_string()),
                        }
                        return Ok(Followed::Finished(outcome));
                    }
                }
            }
        }
    }
}
