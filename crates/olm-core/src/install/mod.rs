//! Update package installation, backup and rollback.
//!
//! An update package is a zip archive with an optional
//! [`MANIFEST_FILE`] at its root. The [`Installer`] never touches the
//! installation before the archive has been read successfully, and every
//! failure after a backup exists restores it.

mod backup;
mod fsops;
mod installer;
mod manifest;

pub use backup::{BACKUP_INFO_FILE, BackupRecord, BackupStore};
pub use installer::{
    ExtractedPackage, InstallOptions, InstallPlan, InstallProgress, InstallReport, Installer,
    PackageInfo,
};
pub use manifest::{MANIFEST_FILE, ManifestEntry, UpdateManifest, check_relative_path};
