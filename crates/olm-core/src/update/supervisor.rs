//! The application side of self-update.
//!
//! The supervisor checks the configured source, fetches the package through
//! the [`TaskManager`], writes the [`UpdateHandoff`] and starts the helper
//! process. Installation itself happens in the helper after this process
//! exits.

use std::path::{Path, PathBuf};
use std::process::Command;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, info, warn};

use super::github::GitHubClient;
use super::handoff::UpdateHandoff;
use super::source::{RemoteVersion, UpdateSource};
use super::status::UpdateStatus;
use crate::config::{AppPaths, UpdateSettings};
use crate::download::{ContentHash, USER_AGENT_VALUE, temp_path};
use crate::error::{CoreError, Result};
use crate::persist;
use crate::system;
use crate::tasks::{FileRequest, PullDisposition, TaskManager};
use crate::version;

/// Task name of the application package download.
pub const UPDATE_TASK: &str = "app-update";

/// File name of the updater helper binary.
#[cfg(windows)]
pub const HELPER_BINARY: &str = "olm-updater-helper.exe";

/// File name of the updater helper binary.
#[cfg(not(windows))]
pub const HELPER_BINARY: &str = "olm-updater-helper";

/// Remote version of the package in `temp/`, kept between download and apply.
const PENDING_FILE: &str = "update_pending.json";

/// Result of an update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheck {
    /// Already on the latest version.
    UpToDate {
        /// Version reported by the source.
        latest: String,
    },
    /// A newer (or forced) version is available.
    Available(RemoteVersion),
    /// A newer version exists but the user chose to skip it.
    Skipped(RemoteVersion),
}

/// How the package download was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStart {
    /// Copied from a local source. The package is ready.
    Copied,
    /// Queued on the task manager under [`UPDATE_TASK`].
    Queued(PullDisposition),
}

/// Drives update checks and the handoff to the helper.
#[derive(Debug)]
pub struct Supervisor {
    paths: AppPaths,
    settings: UpdateSettings,
    current_version: String,
    http: reqwest::Client,
    github: GitHubClient,
}

impl Supervisor {
    /// Create a supervisor for the running application.
    pub fn new(paths: AppPaths, settings: UpdateSettings, current_version: impl Into<String>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| CoreError::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            paths,
            settings,
            current_version: current_version.into(),
            http,
            github: GitHubClient::new()?,
        })
    }

    /// Use another GitHub API client.
    #[must_use]
    pub fn with_github(mut self, github: GitHubClient) -> Self {
        self.github = github;
        self
    }

    /// Update settings, including the recorded check time.
    #[must_use]
    pub fn settings(&self) -> &UpdateSettings {
        &self.settings
    }

    /// Version of the running application.
    #[must_use]
    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    /// True when an automatic check is due.
    #[must_use]
    pub fn is_check_due(&self) -> bool {
        self.settings.should_check_on_startup()
    }

    /// The configured source, refusing local directories outside developer mode.
    pub fn source(&self) -> Result<UpdateSource> {
        let source = UpdateSource::parse(&self.settings.source)?;
        if source.is_local() && !self.settings.developer_mode {
            return Err(CoreError::Config(
                "local update sources require developer_mode".to_string(),
            ));
        }
        Ok(source)
    }

    /// Ask the source for the latest version.
    ///
    /// `force` offers skipped versions as well. The check time is recorded
    /// in [`Self::settings`] whether or not an update is found.
    pub async fn check(&mut self, force: bool) -> Result<UpdateCheck> {
        let source = self.source()?;
        info!(
            "Checking for updates (current version: {})",
            self.current_version
        );

        let remote = source.fetch(&self.http, &self.github).await?;
        self.settings.record_check();
        version::validate(&remote.version)?;

        let forced = force || remote.force_update;
        if !version::should_update(&self.current_version, &remote.version, remote.force_update) {
            info!(
                "No update available (current: {}, latest: {})",
                self.current_version, remote.version
            );
            return Ok(UpdateCheck::UpToDate {
                latest: remote.version,
            });
        }

        if !forced && self.settings.should_skip_version(&remote.version) {
            info!("Skipping version {} (user preference)", remote.version);
            return Ok(UpdateCheck::Skipped(remote));
        }

        info!(
            "Update available: {} -> {}",
            self.current_version, remote.version
        );
        Ok(UpdateCheck::Available(remote))
    }

    /// Start fetching the package into `temp/update.zip`.
    ///
    /// Local sources are copied and verified in place. Everything else is
    /// queued on `manager` as [`UPDATE_TASK`], so pause and resume work the
    /// same as for models.
    pub fn start_download(&self, manager: &TaskManager, remote: &RemoteVersion) -> Result<DownloadStart> {
        let dest = self.paths.update_file();
        persist::write_json_atomic(&self.pending_file(), remote)?;

        if self.source()?.is_local() {
            self.copy_local(remote, &dest)?;
            return Ok(DownloadStart::Copied);
        }

        let request = FileRequest {
            url: remote.download_url.clone(),
            dest,
            expected_size: remote.declared_size(),
            expected_hash: remote.digest().map(str::to_string),
        };
        let disposition = manager.download_file(UPDATE_TASK, request)?;
        info!("Update download {:?} for {}", disposition, remote.version);
        Ok(DownloadStart::Queued(disposition))
    }

    fn copy_local(&self, remote: &RemoteVersion, dest: &Path) -> Result<()> {
        let source = PathBuf::from(&remote.download_url);
        info!("Copying update package from {}", source.display());

        let size = std::fs::metadata(&source)
            .map_err(|e| CoreError::io("read", &source, &e))?
            .len();
        if let Some(expected) = remote.declared_size().filter(|expected| *expected != size) {
            return Err(CoreError::SizeMismatch {
                expected,
                actual: size,
            });
        }
        system::ensure_free_space(dest, size)?;

        let staging = temp_path(dest);
        if let Some(parent) = staging.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::io("create directory", parent, &e))?;
        }
        std::fs::copy(&source, &staging).map_err(|e| CoreError::io("copy", &source, &e))?;

        if let Some(hash) = ContentHash::parse_optional(remote.digest())?
            && let Err(err) = hash.verify_file(&staging)
        {
            match std::fs::remove_file(&staging) {
                Ok(()) => debug!("Removed {}", staging.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", staging.display(), e),
            }
            return Err(err);
        }
        std::fs::rename(&staging, dest).map_err(|e| CoreError::io("replace", dest, &e))?;
        Ok(())
    }

    fn pending_file(&self) -> PathBuf {
        self.paths.temp_dir().join(PENDING_FILE)
    }

    /// The version whose package was last downloaded, if it is still there.
    pub fn pending(&self) -> Result<Option<RemoteVersion>> {
        if !self.paths.update_file().is_file() {
            return Ok(None);
        }
        persist::read_json(&self.pending_file())
    }

    /// Write the handoff for `remote` into `temp/update_info.json`.
    pub fn prepare_handoff(&self, remote: &RemoteVersion) -> Result<UpdateHandoff> {
        let update_file = self.paths.update_file();
        if !update_file.is_file() {
            return Err(CoreError::Config(format!(
                "update package not downloaded: {}",
                update_file.display()
            )));
        }

        let main_exe = std::env::current_exe()
            .map_err(|e| CoreError::Config(format!("cannot locate executable: {e}")))?;

        let mut handoff = UpdateHandoff {
            version: remote.version.clone(),
            update_file,
            target_dir: self.paths.root().to_path_buf(),
            main_exe,
            backup_dir: self.paths.backup_dir(),
            expected_hash: remote.digest().map(str::to_string),
            release_notes: remote.release_notes.clone(),
            previous_version: Some(self.current_version.clone()),
            parent_pid: Some(std::process::id()),
            backup_enabled: true,
            backup_keep: 3,
            default_paths: Vec::new(),
            version_file: None,
        };
        handoff.apply_settings(&self.settings);
        handoff.validate()?;

        let path = self.paths.handoff_file();
        handoff.write(&path)?;
        info!("Wrote update handoff to {}", path.display());
        Ok(handoff)
    }

    /// Path of the helper binary.
    ///
    /// Looked up next to the running executable first, then in the
    /// application root.
    #[must_use]
    pub fn helper_path(&self) -> PathBuf {
        let beside_exe = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(HELPER_BINARY)));
        match beside_exe {
            Some(path) if path.is_file() => path,
            _ => self.paths.root().join(HELPER_BINARY),
        }
    }

    /// Start the helper on the written handoff. Returns its PID.
    ///
    /// The caller is expected to exit promptly afterwards; the helper waits
    /// for this process before touching the installation.
    pub fn launch_orchestrator(&self) -> Result<u32> {
        let helper = self.helper_path();
        let handoff = self.paths.handoff_file();
        if !handoff.is_file() {
            return Err(CoreError::Config(format!(
                "handoff not written: {}",
                handoff.display()
            )));
        }

        info!("Launching {} --handoff {}", helper.display(), handoff.display());
        let mut command = Command::new(&helper);
        command.arg("--handoff").arg(&handoff);
        let child = system::detach(&mut command)
            .spawn()
            .map_err(|e| CoreError::io("launch", &helper, &e))?;
        Ok(child.id())
    }

    /// Read and delete the status left by the last helper run.
    pub fn take_status(&self) -> Result<Option<UpdateStatus>> {
        let status = UpdateStatus::take(&self.paths.status_file())?;
        match &status {
            Some(status) if status.success => info!(
                "Updated from {} to {}",
                status.previous_version.as_deref().unwrap_or("unknown"),
                status.version
            ),
            Some(status) => warn!(
                "Update to {} failed: {}",
                status.version,
                status.error.as_deref().unwrap_or("unknown error")
            ),
            None => debug!("No update status to report"),
        }
        Ok(status)
    }
}
