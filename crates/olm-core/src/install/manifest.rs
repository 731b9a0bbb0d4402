//! `update_manifest.json`, the install plan shipped inside an update archive.

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::persist;

/// File name of the manifest at the archive root.
pub const MANIFEST_FILE: &str = "update_manifest.json";

/// One path to install, relative to the installation root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Relative path inside both the archive and the installation.
    pub path: String,
}

/// Install plan published with an update package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateManifest {
    /// Version the package installs.
    #[serde(default)]
    pub version: String,

    /// Paths to copy into the installation.
    #[serde(default)]
    pub files: Vec<ManifestEntry>,

    /// Paths to remove after copying.
    #[serde(default)]
    pub delete_files: Vec<String>,

    /// File that must contain `version` after install.
    #[serde(default)]
    pub version_file: Option<String>,

    /// Digest of the package itself.
    #[serde(default, alias = "md5")]
    pub expected_hash: Option<String>,

    /// Declared package size.
    #[serde(default)]
    pub file_size: Option<u64>,

    /// Release notes.
    #[serde(default)]
    pub release_notes: String,
}

impl UpdateManifest {
    /// Read the manifest from an extracted package. `None` if absent.
    pub fn from_dir(dir: &Path) -> Result<Option<Self>> {
        let manifest = persist::read_json::<Self>(&dir.join(MANIFEST_FILE))?;
        if let Some(manifest) = &manifest {
            manifest.validate()?;
        }
        Ok(manifest)
    }

    /// Read the manifest straight from a zip archive without extracting.
    pub fn from_archive(archive: &Path) -> Result<Option<Self>> {
        let file = File::open(archive).map_err(|e| CoreError::io("open", archive, &e))?;
        let mut zip = zip::ZipArchive::new(file)?;

        let mut entry = match zip.by_name(MANIFEST_FILE) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut content = String::new();
        entry
            .read_to_string(&mut content)
            .map_err(|e| CoreError::ArchiveCorrupt(format!("{MANIFEST_FILE}: {e}")))?;

        let manifest: Self = serde_json::from_str(&content)
            .map_err(|e| CoreError::ArchiveCorrupt(format!("{MANIFEST_FILE}: {e}")))?;
        manifest.validate()?;
        Ok(Some(manifest))
    }

    /// Reject absolute paths and parent references.
    pub fn validate(&self) -> Result<()> {
        let paths = self
            .files
            .iter()
            .map(|entry| entry.path.as_str())
            .chain(self.delete_files.iter().map(String::as_str))
            .chain(self.version_file.as_deref());

        for path in paths {
            check_relative_path(path)?;
        }
        Ok(())
    }

    /// Paths listed for installation.
    #[must_use]
    pub fn install_paths(&self) -> Vec<String> {
        self.files.iter().map(|entry| entry.path.clone()).collect()
    }
}

/// Fail with [`CoreError::ArchiveCorrupt`] unless `path` is a plain relative path.
pub fn check_relative_path(path: &str) -> Result<()> {
    let unsafe_path = || CoreError::ArchiveCorrupt(format!("unsafe path in manifest: '{path}'"));

    if path.trim().is_empty() {
        return Err(unsafe_path());
    }
    // Windows-style roots are rejected on every platform.
    if path.starts_with('\\') || path.as_bytes().get(1) == Some(&b':') {
        return Err(unsafe_path());
    }

    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) if part.to_string_lossy().contains("..") => {
                return Err(unsafe_path());
            }
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_paths() {
        check_relative_path("ui/main.qml").unwrap();
        check_relative_path("./config").unwrap();
        assert!(check_relative_path("/etc/passwd").is_err());
        assert!(check_relative_path("../outside").is_err());
        assert!(check_relative_path("ui/../../x").is_err());
        assert!(check_relative_path("C:\\Windows").is_err());
        assert!(check_relative_path("").is_err());
    }

    #[test]
    fn test_legacy_md5_key() {
        let manifest: UpdateManifest = serde_json::from_str(
            r#"{"version":"1.2.0","files":[{"path":"ui"}],"md5":"5d41402abc4b2a76b9719d911017c592"}"#,
        )
        .unwrap();
        assert_eq!(
            manifest.expected_hash.as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
        assert_eq!(manifest.install_paths(), vec!["ui".to_string()]);
    }

    #[test]
    fn test_validate_rejects_delete_outside() {
        let manifest = UpdateManifest {
            delete_files: vec!["../../home".to_string()],
            ..UpdateManifest::default()
        };
        assert!(matches!(
            manifest.validate(),
            Err(CoreError::ArchiveCorrupt(_))
        ));
    }
}
