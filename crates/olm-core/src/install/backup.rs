//! Snapshots of installation paths taken before an update.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::fsops::{copy_path, remove_path, tree_size};
use crate::error::{CoreError, Result};
use crate::persist;

/// Metadata file inside every backup directory.
pub const BACKUP_INFO_FILE: &str = "backup_info.json";

/// One backup. Written once at creation and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Version the backup was taken for.
    pub version: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Backup directory.
    pub backup_path: PathBuf,
    /// Relative paths covered, including ones that did not exist yet.
    pub paths: Vec<String>,
}

/// Directory holding `backup_*` snapshots.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    /// Store rooted at `root`. Nothing is created until the first backup.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy `paths` from `target_dir` into a new backup directory.
    ///
    /// Paths missing from the target are recorded but not copied, so a
    /// restore deletes whatever the install created there.
    pub fn create(&self, target_dir: &Path, version: &str, paths: &[String]) -> Result<BackupRecord> {
        let backup_path = self.fresh_dir(version)?;
        info!("Creating backup in {}", backup_path.display());

        for path in paths {
            let src = target_dir.join(path);
            if src.exists() {
                copy_path(&src, &backup_path.join(path))?;
                debug!("Backed up {}", path);
            } else {
                debug!("{} not present, recorded only", path);
            }
        }

        let record = BackupRecord {
            version: version.to_string(),
            timestamp: Utc::now(),
            backup_path: backup_path.clone(),
            paths: paths.to_vec(),
        };
        persist::write_json_atomic(&backup_path.join(BACKUP_INFO_FILE), &record)?;
        Ok(record)
    }

    fn fresh_dir(&self, version: &str) -> Result<PathBuf> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
        let tag: String = version
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        let tag = if tag.is_empty() { "backup".to_string() } else { tag };

        let base = format!("backup_{tag}_{stamp}");
        let mut candidate = self.root.join(&base);
        let mut n = 1;
        while candidate.exists() {
            candidate = self.root.join(format!("{base}_{n}"));
            n += 1;
        }

        fs::create_dir_all(&candidate)
            .map_err(|e| CoreError::io("create directory", &candidate, &e))?;
        Ok(candidate)
    }

    /// All readable backups, newest first.
    pub fn list(&self) -> Result<Vec<BackupRecord>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CoreError::io("read directory", &self.root, &e)),
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            match persist::read_json::<BackupRecord>(&dir.join(BACKUP_INFO_FILE)) {
                Ok(Some(mut record)) => {
                    record.backup_path = dir;
                    records.push(record);
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable backup {}: {}", dir.display(), e),
            }
        }

        records.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.backup_path.cmp(&a.backup_path))
        });
        Ok(records)
    }

    /// Most recent backup.
    pub fn latest(&self) -> Result<Option<BackupRecord>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Backup stored at `path`.
    pub fn load(&self, path: &Path) -> Result<BackupRecord> {
        let mut record = persist::read_json::<BackupRecord>(&path.join(BACKUP_INFO_FILE))?
            .ok_or_else(|| CoreError::Config(format!("{} is not a backup", path.display())))?;
        record.backup_path = path.to_path_buf();
        Ok(record)
    }

    /// Delete one backup directory.
    pub fn delete(&self, path: &Path) -> Result<()> {
        if !path.starts_with(&self.root) {
            return Err(CoreError::Config(format!(
                "{} is outside the backup directory",
                path.display()
            )));
        }
        remove_path(path)?;
        info!("Deleted backup {}", path.display());
        Ok(())
    }

    /// Keep the newest `keep` backups and delete the rest. Returns how many
    /// were deleted.
    pub fn cleanup_old(&self, keep: usize) -> Result<usize> {
        let mut deleted = 0;
        for record in self.list()?.into_iter().skip(keep) {
            match self.delete(&record.backup_path) {
                Ok(()) => deleted += 1,
                Err(e) => warn!("Failed to delete old backup: {}", e),
            }
        }
        if deleted > 0 {
            info!("Removed {} old backup(s)", deleted);
        }
        Ok(deleted)
    }

    /// Bytes used by a backup.
    #[must_use]
    pub fn size(&self, record: &BackupRecord) -> u64 {
        tree_size(&record.backup_path)
    }

    /// Put every covered path in `target_dir` back to its backed-up state.
    pub fn restore(&self, record: &BackupRecord, target_dir: &Path) -> Result<()> {
        info!(
            "Restoring {} path(s) from {}",
            record.paths.len(),
            record.backup_path.display()
        );

        for path in &record.paths {
            let target = target_dir.join(path);
            let saved = record.backup_path.join(path);

            remove_path(&target)?;
            if saved.exists() {
                copy_path(&saved, &target)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_restore() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("app");
        fs::create_dir_all(target.join("ui")).unwrap();
        fs::write(target.join("ui/main.qml"), "old").unwrap();

        let store = BackupStore::new(dir.path().join("backup"));
        let paths = vec!["ui".to_string(), "plugins".to_string()];
        let record = store.create(&target, "1.0.0", &paths).unwrap();
        assert!(
            record
                .backup_path
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("backup_1.0.0_")
        );

        fs::write(target.join("ui/main.qml"), "new").unwrap();
        fs::create_dir_all(target.join("plugins")).unwrap();
        fs::write(target.join("plugins/extra"), "x").unwrap();

        store.restore(&record, &target).unwrap();
        assert_eq!(fs::read_to_string(target.join("ui/main.qml")).unwrap(), "old");
        assert!(!target.join("plugins").exists());
    }

    #[test]
    fn test_list_newest_first_and_load() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("app");
        fs::create_dir_all(&target).unwrap();
        let store = BackupStore::new(dir.path().join("backup"));

        let first = store.create(&target, "1.0.0", &[]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.create(&target, "1.1.0", &[]).unwrap();

        let list = store.list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].version, second.version);
        assert_eq!(store.load(&first.backup_path).unwrap().version, "1.0.0");
    }

    #[test]
    fn test_delete_outside_root_rejected() {
        let dir = tempdir().unwrap();
        let store = BackupStore::new(dir.path().join("backup"));
        assert!(store.delete(dir.path()).is_err());
    }
}
