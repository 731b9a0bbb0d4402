//! The helper's state machine.
//!
//! `Init → WaitForMainExit → Backup → Extract → Verify → Install →
//! Relaunch → Done`, with `Failed` reachable from every step. Once a backup
//! exists, a failure restores it before the helper gives up.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use olm_core::config::AppPaths;
use olm_core::download::ContentHash;
use olm_core::install::{InstallPlan, InstallProgress, Installer};
use olm_core::system;
use olm_core::update::{UpdateHandoff, UpdateStatus};
use olm_core::{CoreError, Result};
use tracing::{debug, error, info, warn};

/// Orchestrator step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Read and validate the handoff.
    Init,
    /// Wait for the application to exit.
    WaitForMainExit,
    /// Back up the paths the package touches.
    Backup,
    /// Unpack the archive.
    Extract,
    /// Check the package digest.
    Verify,
    /// Copy files and check the version marker.
    Install,
    /// Start the updated application.
    Relaunch,
    /// Finished successfully.
    Done,
    /// Gave up.
    Failed,
}

impl Stage {
    /// Overall percent when the stage starts.
    #[must_use]
    pub fn percent(self) -> u8 {
        match self {
            Self::Init | Self::Failed => 0,
            Self::WaitForMainExit => 5,
            Self::Backup => 10,
            Self::Extract => 20,
            Self::Verify => 30,
            Self::Install => 40,
            Self::Relaunch => 98,
            Self::Done => 100,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::WaitForMainExit => "wait",
            Self::Backup => "backup",
            Self::Extract => "extract",
            Self::Verify => "verify",
            Self::Install => "install",
            Self::Relaunch => "relaunch",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Progress report for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    /// Current stage.
    pub stage: Stage,
    /// Overall percent, 0 to 100.
    pub percent: u8,
    /// Human-readable status.
    pub message: String,
}

/// Process table access, replaceable in tests.
pub trait ProcessControl {
    /// True while a process called `name`, or with `pid`, is alive.
    fn is_running(&self, name: &str, pid: Option<u32>) -> bool;

    /// Force-terminate those processes. Returns how many were signalled.
    fn terminate(&self, name: &str, pid: Option<u32>) -> usize;
}

/// [`ProcessControl`] over the real process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

impl ProcessControl for SystemProcesses {
    fn is_running(&self, name: &str, pid: Option<u32>) -> bool {
        pid.is_some_and(system::is_pid_alive) || (!name.is_empty() && system::is_process_running(name))
    }

    fn terminate(&self, name: &str, pid: Option<u32>) -> usize {
        let by_pid = usize::from(pid.is_some_and(system::kill_pid));
        let by_name = if name.is_empty() {
            0
        } else {
            system::kill_processes(name)
        };
        by_pid + by_name
    }
}

/// Starts the updated application.
pub trait Launcher {
    /// Start `exe`, returning the new PID.
    fn launch(&self, exe: &Path) -> io::Result<u32>;
}

/// Timing for [`Stage::WaitForMainExit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Time between process checks.
    pub poll_interval: Duration,
    /// How long to wait before terminating the application.
    pub timeout: Duration,
    /// How long to re-poll after terminating it.
    pub kill_grace: Duration,
    /// Pause after exit so file handles close.
    pub settle: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(5),
            settle: Duration::from_secs(2),
        }
    }
}

/// Runs one update from a handoff file.
#[derive(Debug)]
pub struct Orchestrator<P, L> {
    processes: P,
    launcher: L,
    policy: WaitPolicy,
    log_file: Option<PathBuf>,
}

type Reporter<'a> = &'a mut dyn FnMut(StageReport);

fn emit(reporter: &mut dyn FnMut(StageReport), stage: Stage, percent: u8, message: impl Into<String>) {
    let message = message.into();
    info!("[{:>3}%] {}: {}", percent, stage, message);
    reporter(StageReport {
        stage,
        percent,
        message,
    });
}

impl<P: ProcessControl, L: Launcher> Orchestrator<P, L> {
    /// Orchestrator with the given process access and launcher.
    pub fn new(processes: P, launcher: L, policy: WaitPolicy) -> Self {
        Self {
            processes,
            launcher,
            policy,
            log_file: None,
        }
    }

    /// Log file recorded in the status document.
    #[must_use]
    pub fn with_log_file(mut self, log_file: impl Into<PathBuf>) -> Self {
        self.log_file = Some(log_file.into());
        self
    }

    /// Install the update described by `handoff_file`.
    ///
    /// Writes `config/update_status.json` under the target directory
    /// whenever the handoff could be read and its target exists.
    pub fn run(&self, handoff_file: &Path, reporter: Reporter<'_>) -> Result<UpdateStatus> {
        emit(reporter, Stage::Init, Stage::Init.percent(), "Reading update information");
        let handoff = UpdateHandoff::read(handoff_file)?;
        info!(
            "Updating {} from {} to {}",
            handoff.target_dir.display(),
            handoff.previous_version.as_deref().unwrap_or("unknown"),
            handoff.version
        );

        let status_file = AppPaths::new(&handoff.target_dir).status_file();
        match self.install(&handoff, reporter) {
            Ok(()) => {
                let status = UpdateStatus::success(
                    &handoff.version,
                    handoff.previous_version.clone(),
                    self.log_file.clone(),
                );
                if let Err(e) = status.write(&status_file) {
                    warn!("Could not write {}: {}", status_file.display(), e);
                }
                self.relaunch(&handoff, reporter);
                emit(reporter, Stage::Done, Stage::Done.percent(), "Update complete");
                Ok(status)
            }
            Err(err) => {
                error!("Update failed: {}", err);
                emit(reporter, Stage::Failed, Stage::Failed.percent(), err.user_message());
                if handoff.target_dir.is_dir() {
                    let status = UpdateStatus::failure(
                        &handoff.version,
                        handoff.previous_version.clone(),
                        err.to_string(),
                        self.log_file.clone(),
                    );
                    if let Err(write_err) = status.write(&status_file) {
                        warn!("Could not write {}: {}", status_file.display(), write_err);
                    }
                }
                Err(err)
            }
        }
    }

    fn install(&self, handoff: &UpdateHandoff, reporter: Reporter<'_>) -> Result<()> {
        handoff.validate()?;

        emit(
            reporter,
            Stage::WaitForMainExit,
            Stage::WaitForMainExit.percent(),
            "Waiting for the application to exit",
        );
        self.wait_for_main_exit(&handoff.main_process_name(), handoff.parent_pid)?;

        let mut options = handoff.install_options();
        options.work_dir = handoff.update_file.parent().map(Path::to_path_buf);
        let installer = Installer::new(&handoff.target_dir, &handoff.backup_dir, options);

        let mut plan = installer.plan(&handoff.update_file)?;
        if plan.version.is_empty() {
            plan.version.clone_from(&handoff.version);
        } else if plan.version != handoff.version {
            warn!(
                "Package manifest says {} but {} was requested",
                plan.version, handoff.version
            );
        }

        emit(reporter, Stage::Backup, Stage::Backup.percent(), "Backing up current version");
        let backup = installer.backup(&plan, &mut |p| forward(reporter, Stage::Backup, &p))?;

        self.apply(handoff, &installer, &plan, reporter)
            .map_err(|err| installer.recover(backup.as_ref(), err))?;

        if let Err(e) = std::fs::remove_file(&handoff.update_file) {
            warn!("Failed to remove {}: {}", handoff.update_file.display(), e);
        }
        match installer.cleanup_old_backups(handoff.backup_keep) {
            Ok(pruned) if pruned > 0 => info!("Removed {} old backup(s)", pruned),
            Ok(_) => {}
            Err(e) => warn!("Backup cleanup failed: {}", e),
        }
        Ok(())
    }

    fn apply(
        &self,
        handoff: &UpdateHandoff,
        installer: &Installer,
        plan: &InstallPlan,
        reporter: Reporter<'_>,
    ) -> Result<()> {
        emit(reporter, Stage::Extract, Stage::Extract.percent(), "Extracting update package");
        let package = installer.extract(&handoff.update_file, &mut |p| forward(reporter, Stage::Extract, &p))?;

        emit(reporter, Stage::Verify, Stage::Verify.percent(), "Verifying update package");
        let expected = handoff
            .expected_hash
            .as_deref()
            .or(plan.expected_hash.as_deref());
        match ContentHash::parse_optional(expected)? {
            Some(hash) => hash.verify_file(&handoff.update_file)?,
            None => debug!("No expected hash, skipping package verification"),
        }

        emit(reporter, Stage::Install, Stage::Install.percent(), "Installing files");
        let mut sink = |p: InstallProgress| {
            emit(reporter, Stage::Install, p.percent.clamp(40, 95), p.status);
        };
        let (installed, deleted) = installer.apply(plan, &package, &mut sink)?;
        installer.verify_installed(plan, &mut sink)?;
        info!("Installed {} path(s), deleted {}", installed, deleted);
        Ok(())
    }

    /// Block until the application is gone, terminating it after the timeout.
    pub fn wait_for_main_exit(&self, name: &str, pid: Option<u32>) -> Result<()> {
        let label = if name.is_empty() {
            pid.map_or_else(String::new, |pid| format!("pid {pid}"))
        } else {
            name.to_string()
        };

        if self.poll_until_exit(name, pid, self.policy.timeout) {
            info!("{} has exited", label);
        } else {
            warn!(
                "{} still running after {:?}, terminating",
                label, self.policy.timeout
            );
            let signalled = self.processes.terminate(name, pid);
            debug!("Signalled {} process(es)", signalled);
            if !self.poll_until_exit(name, pid, self.policy.kill_grace) {
                return Err(CoreError::ProcessStillRunning { name: label });
            }
            info!("{} terminated", label);
        }

        if !self.policy.settle.is_zero() {
            thread::sleep(self.policy.settle);
        }
        Ok(())
    }

    fn poll_until_exit(&self, name: &str, pid: Option<u32>, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if !self.processes.is_running(name, pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(self.policy.poll_interval);
        }
    }

    fn relaunch(&self, handoff: &UpdateHandoff, reporter: Reporter<'_>) {
        emit(
            reporter,
            Stage::Relaunch,
            Stage::Relaunch.percent(),
            format!("Starting {}", handoff.main_exe.display()),
        );
        if let Err(e) = self.launcher.launch(&handoff.main_exe) {
            warn!(
                "Update installed but relaunching {} failed: {}",
                handoff.main_exe.display(),
                e
            );
        }
    }
}

fn forward(reporter: &mut dyn FnMut(StageReport), stage: Stage, progress: &InstallProgress) {
    debug!("{}: {}", stage, progress.status);
    reporter(StageReport {
        stage,
        percent: stage.percent(),
        message: progress.status.clone(),
    });
}
