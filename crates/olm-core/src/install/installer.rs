//! Install an update archive with backup and automatic restore.
//!
//! [`Installer::install`] runs every step in one call. The step functions
//! ([`Installer::plan`], [`Installer::backup`], [`Installer::extract`],
//! [`Installer::apply`], [`Installer::verify_installed`],
//! [`Installer::restore`]) are public so the updater helper can sequence
//! them itself.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use super::backup::{BackupRecord, BackupStore};
use super::fsops::{copy_path, remove_path};
use super::manifest::{MANIFEST_FILE, UpdateManifest, check_relative_path};
use crate::config::UpdateSettings;
use crate::error::{CoreError, Result};
use crate::system;

/// Installer knobs, usually taken from [`UpdateSettings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    /// Take a backup before touching the installation.
    pub backup_enabled: bool,
    /// Backups kept after a successful install.
    pub backup_keep: usize,
    /// Paths installed when the manifest lists none.
    pub default_paths: Vec<String>,
    /// Version marker used when the manifest names none.
    pub version_file: Option<String>,
    /// Where the archive is extracted. System temp dir when unset.
    pub work_dir: Option<PathBuf>,
    /// Version currently installed, used to name the backup. Read from the
    /// version marker when unset.
    pub installed_version: Option<String>,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            backup_enabled: true,
            backup_keep: 3,
            default_paths: Vec::new(),
            version_file: None,
            work_dir: None,
            installed_version: None,
        }
    }
}

impl InstallOptions {
    /// Options from update settings.
    #[must_use]
    pub fn from_settings(settings: &UpdateSettings) -> Self {
        Self {
            backup_enabled: settings.backup_enabled,
            backup_keep: settings.backup_keep,
            default_paths: settings.default_paths.clone(),
            version_file: settings.version_file.clone(),
            work_dir: None,
            installed_version: None,
        }
    }
}

/// Step progress for a caller-supplied sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallProgress {
    /// Overall percent, 0 to 100.
    pub percent: u8,
    /// Human-readable step description.
    pub status: String,
}

/// What an archive will change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    /// Version being installed. Empty when the package does not say.
    pub version: String,
    /// Paths copied from the package.
    pub install_paths: Vec<String>,
    /// Paths removed after copying.
    pub delete_paths: Vec<String>,
    /// Marker checked after install.
    pub version_file: Option<String>,
    /// Package digest from the manifest.
    pub expected_hash: Option<String>,
}

impl InstallPlan {
    /// Every path the install touches, in a stable order without duplicates.
    #[must_use]
    pub fn backup_paths(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.install_paths
            .iter()
            .chain(&self.delete_paths)
            .chain(self.version_file.iter())
            .filter(|path| seen.insert(path.as_str()))
            .cloned()
            .collect()
    }
}

/// Summary of a finished install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Installed version.
    pub version: String,
    /// Backup taken beforehand.
    pub backup: Option<BackupRecord>,
    /// Paths copied.
    pub installed: usize,
    /// Paths deleted.
    pub deleted: usize,
    /// Old backups removed afterwards.
    pub pruned: usize,
}

/// Package contents without installing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    /// Manifest, if the package ships one.
    pub manifest: Option<UpdateManifest>,
    /// Archive size in bytes.
    pub file_size: u64,
    /// Number of archive entries.
    pub entries: usize,
}

/// Extracted archive. The directory is removed on drop.
#[derive(Debug)]
pub struct ExtractedPackage {
    dir: TempDir,
}

impl ExtractedPackage {
    /// Extraction root.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Installs update archives into one target directory.
#[derive(Debug, Clone)]
pub struct Installer {
    target_dir: PathBuf,
    backups: BackupStore,
    options: InstallOptions,
}

type Sink<'a> = &'a mut dyn FnMut(InstallProgress);

fn report(sink: &mut dyn FnMut(InstallProgress), percent: u8, status: impl Into<String>) {
    let status = status.into();
    debug!("[{:>3}%] {}", percent, status);
    sink(InstallProgress { percent, status });
}

fn step_failed(step: &'static str) -> impl FnOnce(CoreError) -> CoreError {
    move |err| match err {
        CoreError::InstallStepFailed { .. } | CoreError::ArchiveCorrupt(_) => err,
        other => CoreError::InstallStepFailed {
            step,
            reason: other.to_string(),
            restored: false,
        },
    }
}

impl Installer {
    /// Installer for `target_dir` keeping backups under `backup_dir`.
    #[must_use]
    pub fn new(target_dir: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>, options: InstallOptions) -> Self {
        Self {
            target_dir: target_dir.into(),
            backups: BackupStore::new(backup_dir),
            options,
        }
    }

    /// Installation root.
    #[must_use]
    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    /// Backup store.
    #[must_use]
    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Work out what `archive` will change, reading only its manifest.
    ///
    /// Manifest paths win. Otherwise the configured default paths are used,
    /// and failing those the archive's top-level entries.
    pub fn plan(&self, archive: &Path) -> Result<InstallPlan> {
        let manifest = UpdateManifest::from_archive(archive)?.unwrap_or_default();

        let mut install_paths = manifest.install_paths();
        if install_paths.is_empty() {
            install_paths.clone_from(&self.options.default_paths);
        }
        if install_paths.is_empty() {
            install_paths = top_level_entries(archive)?;
        }
        for path in &install_paths {
            check_relative_path(path)?;
        }

        let version_file = manifest
            .version_file
            .clone()
            .or_else(|| self.options.version_file.clone());
        if let Some(file) = &version_file {
            check_relative_path(file)?;
        }

        Ok(InstallPlan {
            version: manifest.version,
            install_paths,
            delete_paths: manifest.delete_files,
            version_file,
            expected_hash: manifest.expected_hash,
        })
    }

    /// Extract `archive` into a fresh temporary directory.
    pub fn extract(&self, archive: &Path, sink: Sink<'_>) -> Result<ExtractedPackage> {
        report(sink, 10, "Extracting update package");

        let work_dir = self.options.work_dir.clone().unwrap_or_else(std::env::temp_dir);
        fs::create_dir_all(&work_dir).map_err(|e| CoreError::io("create directory", &work_dir, &e))?;
        let dir = tempfile::Builder::new()
            .prefix("olm-extract-")
            .tempdir_in(&work_dir)
            .map_err(|e| CoreError::io("create temp directory in", &work_dir, &e))?;

        let file = File::open(archive).map_err(|e| CoreError::io("open", archive, &e))?;
        let mut zip = zip::ZipArchive::new(file)?;

        let uncompressed: u64 = (0..zip.len())
            .filter_map(|i| zip.by_index(i).ok().map(|entry| entry.size()))
            .sum();
        system::ensure_free_space(dir.path(), uncompressed)?;

        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            let relative = entry.enclosed_name().ok_or_else(|| {
                CoreError::ArchiveCorrupt(format!("unsafe entry path '{}'", entry.name()))
            })?;
            let out = dir.path().join(relative);

            if entry.is_dir() {
                fs::create_dir_all(&out).map_err(|e| CoreError::io("create directory", &out, &e))?;
                continue;
            }
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent).map_err(|e| CoreError::io("create directory", parent, &e))?;
            }

            let mut target = File::create(&out).map_err(|e| CoreError::io("create", &out, &e))?;
            io::copy(&mut entry, &mut target)
                .map_err(|e| CoreError::ArchiveCorrupt(format!("{}: {e}", entry.name())))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode() {
                    fs::set_permissions(&out, fs::Permissions::from_mode(mode))
                        .map_err(|e| CoreError::io("set permissions on", &out, &e))?;
                }
            }
        }

        info!("Extracted {} entries to {}", zip.len(), dir.path().display());
        report(sink, 20, "Package extracted");
        Ok(ExtractedPackage { dir })
    }

    /// Back up every path the plan touches. `None` when backups are off.
    pub fn backup(&self, plan: &InstallPlan, sink: Sink<'_>) -> Result<Option<BackupRecord>> {
        if !self.options.backup_enabled {
            debug!("Backups disabled");
            return Ok(None);
        }

        report(sink, 30, "Backing up current version");
        let installed = self.installed_version(plan);
        let record = self
            .backups
            .create(&self.target_dir, &installed, &plan.backup_paths())
            .map_err(step_failed("backup"))?;
        report(sink, 40, format!("Backup created: {}", record.backup_path.display()));
        Ok(Some(record))
    }

    /// Version the backup holds: the configured one, else the first line of
    /// the installed version marker, else `unknown`.
    fn installed_version(&self, plan: &InstallPlan) -> String {
        if let Some(version) = self.options.installed_version.as_deref().filter(|v| !v.trim().is_empty()) {
            return version.trim().to_string();
        }
        plan.version_file
            .as_ref()
            .and_then(|file| fs::read_to_string(self.target_dir.join(file)).ok())
            .and_then(|content| content.lines().next().map(|line| line.trim().to_string()))
            .filter(|line| !line.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Copy the plan's paths from `package` and apply its deletions.
    ///
    /// Returns `(installed, deleted)` counts.
    pub fn apply(&self, plan: &InstallPlan, package: &ExtractedPackage, sink: Sink<'_>) -> Result<(usize, usize)> {
        let total = plan.install_paths.len().max(1);
        let mut installed = 0;

        for (i, path) in plan.install_paths.iter().enumerate() {
            let percent = 40 + u8::try_from(i * 50 / total).unwrap_or(50);
            let src = package.path().join(path);
            if !src.exists() {
                warn!("{} is not in the package, skipping", path);
                continue;
            }

            report(sink, percent, format!("Installing {path}"));
            let dst = self.target_dir.join(path);
            if src.is_dir() {
                remove_path(&dst).map_err(step_failed("install"))?;
            }
            copy_path(&src, &dst).map_err(step_failed("install"))?;
            installed += 1;
        }

        let deleted = if plan.delete_paths.is_empty() {
            0
        } else {
            report(sink, 90, "Removing obsolete files");
            let mut deleted = 0;
            for path in &plan.delete_paths {
                let target = self.target_dir.join(path);
                if target.exists() {
                    remove_path(&target).map_err(step_failed("delete"))?;
                    deleted += 1;
                }
            }
            deleted
        };

        Ok((installed, deleted))
    }

    /// Confirm the version marker names the installed version.
    pub fn verify_installed(&self, plan: &InstallPlan, sink: Sink<'_>) -> Result<()> {
        report(sink, 95, "Verifying installation");

        let (Some(file), false) = (&plan.version_file, plan.version.is_empty()) else {
            debug!("No version marker to verify");
            return Ok(());
        };

        let marker = self.target_dir.join(file);
        let content = fs::read_to_string(&marker).map_err(|e| CoreError::InstallStepFailed {
            step: "verify",
            reason: format!("cannot read {}: {e}", marker.display()),
            restored: false,
        })?;
        if !content.contains(&plan.version) {
            return Err(CoreError::InstallStepFailed {
                step: "verify",
                reason: format!("{} does not mention version {}", file, plan.version),
                restored: false,
            });
        }
        info!("Version marker {} confirms {}", file, plan.version);
        Ok(())
    }

    /// Roll the installation back to `record`.
    pub fn restore(&self, record: &BackupRecord) -> Result<()> {
        self.backups.restore(record, &self.target_dir)
    }

    /// Restore after `err`, returning the error to surface.
    pub fn recover(&self, record: Option<&BackupRecord>, err: CoreError) -> CoreError {
        let Some(record) = record else {
            return err;
        };
        warn!("Install failed ({}), restoring backup", err);
        match self.restore(record) {
            Ok(()) => {
                info!("Previous version restored");
                match err {
                    CoreError::InstallStepFailed { step, reason, .. } => CoreError::InstallStepFailed {
                        step,
                        reason,
                        restored: true,
                    },
                    other => other,
                }
            }
            Err(restore_err) => {
                error!("Restore failed: {}", restore_err);
                CoreError::RestoreFailed {
                    install_error: err.to_string(),
                    restore_error: restore_err.to_string(),
                }
            }
        }
    }

    /// Run every step: extract, back up, apply, verify, clean up.
    ///
    /// Any failure after the backup restores it. The archive is removed
    /// after a successful install.
    pub fn install(&self, archive: &Path, sink: Sink<'_>) -> Result<InstallReport> {
        info!(
            "Installing {} into {}",
            archive.display(),
            self.target_dir.display()
        );

        let plan = self.plan(archive)?;
        let package = self.extract(archive, sink)?;
        let backup = self.backup(&plan, sink)?;

        let applied = self
            .apply(&plan, &package, sink)
            .and_then(|counts| self.verify_installed(&plan, sink).map(|()| counts));
        let (installed, deleted) = match applied {
            Ok(counts) => counts,
            Err(err) => return Err(self.recover(backup.as_ref(), err)),
        };

        drop(package);
        if let Err(e) = fs::remove_file(archive) {
            warn!("Failed to remove {}: {}", archive.display(), e);
        }
        let pruned = self.cleanup_old_backups(self.options.backup_keep)?;

        report(sink, 100, "Update installed");
        Ok(InstallReport {
            version: plan.version,
            backup,
            installed,
            deleted,
            pruned,
        })
    }

    /// Keep the newest `keep` backups.
    pub fn cleanup_old_backups(&self, keep: usize) -> Result<usize> {
        self.backups.cleanup_old(keep)
    }

    /// Backups, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        self.backups.list()
    }

    /// Delete one backup.
    pub fn delete_backup(&self, path: &Path) -> Result<()> {
        self.backups.delete(path)
    }

    /// Check that `archive` is a readable zip with a manifest or installable paths.
    pub fn validate_package(&self, archive: &Path) -> Result<()> {
        let info = self.package_info(archive)?;
        if info.entries == 0 {
            return Err(CoreError::ArchiveCorrupt("package is empty".to_string()));
        }
        self.plan(archive).map(|_| ())
    }

    /// Manifest and size of `archive`.
    pub fn package_info(&self, archive: &Path) -> Result<PackageInfo> {
        let file_size = fs::metadata(archive)
            .map_err(|e| CoreError::io("read metadata of", archive, &e))?
            .len();
        let file = File::open(archive).map_err(|e| CoreError::io("open", archive, &e))?;
        let entries = zip::ZipArchive::new(file)?.len();

        Ok(PackageInfo {
            manifest: UpdateManifest::from_archive(archive)?,
            file_size,
            entries,
        })
    }
}

fn top_level_entries(archive: &Path) -> Result<Vec<String>> {
    let file = File::open(archive).map_err(|e| CoreError::io("open", archive, &e))?;
    let zip = zip::ZipArchive::new(file)?;

    let names: BTreeSet<String> = zip
        .file_names()
        .filter_map(|name| name.split('/').find(|part| !part.is_empty() && *part != "."))
        .filter(|name| *name != MANIFEST_FILE)
        .map(str::to_string)
        .collect();
    Ok(names.into_iter().collect())
}
