//! The document passed from the application to the updater helper.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::UpdateSettings;
use crate::error::{CoreError, Result};
use crate::install::InstallOptions;
use crate::persist;

fn default_true() -> bool {
    true
}

fn default_backup_keep() -> usize {
    3
}

/// Everything the helper needs to install an update.
///
/// Written once by the application before it exits and read once by the
/// helper. Nothing else crosses the process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateHandoff {
    /// Version being installed.
    pub version: String,
    /// Downloaded package.
    pub update_file: PathBuf,
    /// Installation root.
    pub target_dir: PathBuf,
    /// Main executable, relaunched afterwards.
    pub main_exe: PathBuf,
    /// Where backups are kept.
    pub backup_dir: PathBuf,
    /// Package digest, `algo:hex` or bare hex.
    #[serde(default, alias = "md5", skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
    /// Release notes shown after the update.
    #[serde(default)]
    pub release_notes: String,
    /// Version being replaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    /// PID of the application that wrote this document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_pid: Option<u32>,
    /// Take a backup before installing.
    #[serde(default = "default_true")]
    pub backup_enabled: bool,
    /// Backups kept afterwards.
    #[serde(default = "default_backup_keep")]
    pub backup_keep: usize,
    /// Paths installed when the package lists none.
    #[serde(default)]
    pub default_paths: Vec<String>,
    /// Version marker when the package names none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_file: Option<String>,
}

impl UpdateHandoff {
    /// Copy the install knobs from settings.
    pub fn apply_settings(&mut self, settings: &UpdateSettings) {
        self.backup_enabled = settings.backup_enabled;
        self.backup_keep = settings.backup_keep;
        self.default_paths = settings.default_paths.clone();
        self.version_file = settings.version_file.clone();
    }

    /// Read a handoff file.
    pub fn read(path: &Path) -> Result<Self> {
        persist::read_json(path)?
            .ok_or_else(|| CoreError::Config(format!("handoff file not found: {}", path.display())))
    }

    /// Write atomically.
    pub fn write(&self, path: &Path) -> Result<()> {
        persist::write_json_atomic(path, self)
    }

    /// Check that the referenced package and installation exist.
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(CoreError::Config("handoff names no version".to_string()));
        }
        if !self.update_file.is_file() {
            return Err(CoreError::Config(format!(
                "update file not found: {}",
                self.update_file.display()
            )));
        }
        if !self.target_dir.is_dir() {
            return Err(CoreError::Config(format!(
                "target directory not found: {}",
                self.target_dir.display()
            )));
        }
        if self.main_exe.file_name().is_none() {
            return Err(CoreError::Config(format!(
                "main executable has no file name: {}",
                self.main_exe.display()
            )));
        }
        Ok(())
    }

    /// Installer options carried by this handoff.
    #[must_use]
    pub fn install_options(&self) -> InstallOptions {
        InstallOptions {
            backup_enabled: self.backup_enabled,
            backup_keep: self.backup_keep,
            default_paths: self.default_paths.clone(),
            version_file: self.version_file.clone(),
            work_dir: None,
            installed_version: self.previous_version.clone(),
        }
    }

    /// Process name to wait for: the file name of `main_exe`.
    ///
    /// Interpreted entry points run under an interpreter, so the wait
    /// relies on `parent_pid` for those.
    #[must_use]
    pub fn main_process_name(&self) -> String {
        self.main_exe
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(root: &Path) -> UpdateHandoff {
        UpdateHandoff {
            version: "1.3.0".to_string(),
            update_file: root.join("temp/update.zip"),
            target_dir: root.to_path_buf(),
            main_exe: root.join("olm"),
            backup_dir: root.join("backup"),
            expected_hash: None,
            release_notes: String::new(),
            previous_version: Some("1.2.0".to_string()),
            parent_pid: Some(42),
            backup_enabled: true,
            backup_keep: 3,
            default_paths: vec!["ui".to_string()],
            version_file: None,
        }
    }

    #[test]
    fn test_legacy_document() {
        let json = r#"{
            "version": "1.3.0",
            "update_file": "/opt/olm/temp/update.zip",
            "target_dir": "/opt/olm",
            "main_exe": "/opt/olm/main.py",
            "backup_dir": "/opt/olm/backup",
            "md5": "5d41402abc4b2a76b9719d911017c592",
            "release_notes": "fixes"
        }"#;
        let handoff: UpdateHandoff = serde_json::from_str(json).unwrap();
        assert_eq!(
            handoff.expected_hash.as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
        assert!(handoff.backup_enabled);
        assert_eq!(handoff.backup_keep, 3);
        assert_eq!(handoff.main_process_name(), "main.py");
        assert!(handoff.parent_pid.is_none());
    }

    #[test]
    fn test_write_read_and_validate() {
        let dir = tempdir().unwrap();
        let handoff = sample(dir.path());
        let path = dir.path().join("temp/update_info.json");
        handoff.write(&path).unwrap();
        assert_eq!(UpdateHandoff::read(&path).unwrap(), handoff);

        assert!(matches!(handoff.validate(), Err(CoreError::Config(_))));
        std::fs::write(&handoff.update_file, b"zip").unwrap();
        handoff.validate().unwrap();
    }

    #[test]
    fn test_install_options_name_backup_after_previous_version() {
        let dir = tempdir().unwrap();
        let options = sample(dir.path()).install_options();
        assert_eq!(options.installed_version.as_deref(), Some("1.2.0"));
        assert_eq!(options.default_paths, vec!["ui".to_string()]);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        assert!(UpdateHandoff::read(&dir.path().join("none.json")).is_err());
    }
}
