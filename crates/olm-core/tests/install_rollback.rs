//! Installer transactions: apply, roll back and backup retention.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use olm_core::CoreError;
use olm_core::download::{HashAlgorithm, compute_file_hash};
use olm_core::install::{BackupStore, InstallOptions, InstallProgress, Installer, MANIFEST_FILE};
use serde_json::json;
use tempfile::{TempDir, tempdir};
use walkdir::WalkDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// Relative path → sha256 of every file under `root`.
fn snapshot(root: &Path) -> BTreeMap<PathBuf, String> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let relative = entry.path().strip_prefix(root).unwrap().to_path_buf();
            let hash = compute_file_hash(entry.path(), HashAlgorithm::Sha256).unwrap();
            (relative, hash)
        })
        .collect()
}

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// Installation at version 1.0.0.
fn installation() -> TempDir {
    let dir = tempdir().unwrap();
    write(dir.path(), "VERSION", "1.0.0\n");
    write(dir.path(), "ui/index.html", "<h1>v1</h1>");
    write(dir.path(), "ui/old.css", "body {}");
    write(dir.path(), "config/app.json", r#"{"theme":"light"}"#);
    write(dir.path(), "legacy.txt", "remove me in v2");
    write(dir.path(), "models/keep.bin", "untouched");
    dir
}

fn package(dir: &Path, manifest: &serde_json::Value, files: &[(&str, &str)]) -> PathBuf {
    let path = dir.join("update.zip");
    let mut zip = ZipWriter::new(std::fs::File::create(&path).unwrap());
    let options = SimpleFileOptions::default();

    zip.start_file(MANIFEST_FILE, options).unwrap();
    zip.write_all(manifest.to_string().as_bytes()).unwrap();
    for (name, content) in files {
        zip.start_file(*name, options).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
    path
}

fn v2_files(version_marker: &'static str) -> Vec<(&'static str, &'static str)> {
    vec![
        ("VERSION", version_marker),
        ("ui/index.html", "<h1>v2</h1>"),
        ("ui/app.js", "console.log('v2')"),
        ("config/app.json", r#"{"theme":"dark"}"#),
        ("plugins/new.txt", "added in v2"),
    ]
}

fn v2_manifest() -> serde_json::Value {
    json!({
        "version": "2.0.0",
        "files": [
            { "path": "VERSION" },
            { "path": "ui" },
            { "path": "config/app.json" },
            { "path": "plugins" }
        ],
        "delete_files": ["legacy.txt"],
        "version_file": "VERSION"
    })
}

fn installer(target: &Path, backups: &Path) -> Installer {
    Installer::new(target, backups, InstallOptions::default())
}

#[test]
fn test_install_applies_manifest() {
    let target = installation();
    let work = tempdir().unwrap();
    let archive = package(work.path(), &v2_manifest(), &v2_files("2.0.0\n"));
    let installer = installer(target.path(), &work.path().join("backup"));

    let mut progress: Vec<InstallProgress> = Vec::new();
    let report = installer
        .install(&archive, &mut |p| progress.push(p))
        .unwrap();

    assert_eq!(report.version, "2.0.0");
    assert_eq!(report.installed, 4);
    assert_eq!(report.deleted, 1);
    let backup = report.backup.expect("backup taken");
    assert_eq!(backup.version, "1.0.0", "backups are named after what they hold");
    assert!(
        backup
            .backup_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("backup_1.0.0_")
    );
    assert!(!archive.exists());

    let root = target.path();
    assert_eq!(std::fs::read_to_string(root.join("ui/index.html")).unwrap(), "<h1>v2</h1>");
    assert!(root.join("ui/app.js").exists());
    assert!(!root.join("ui/old.css").exists(), "directories are replaced wholesale");
    assert!(!root.join("legacy.txt").exists());
    assert_eq!(std::fs::read_to_string(root.join("models/keep.bin")).unwrap(), "untouched");

    let percents: Vec<u8> = progress.iter().map(|p| p.percent).collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.first(), Some(&10));
    assert_eq!(percents.last(), Some(&100));
}

#[test]
fn test_failed_verify_restores_exact_tree() {
    let target = installation();
    let before = snapshot(target.path());
    let work = tempdir().unwrap();
    let archive = package(work.path(), &v2_manifest(), &v2_files("1.9.9\n"));
    let installer = installer(target.path(), &work.path().join("backup"));

    let err = installer.install(&archive, &mut |_| {}).unwrap_err();
    assert!(matches!(
        err,
        CoreError::InstallStepFailed {
            step: "verify",
            restored: true,
            ..
        }
    ));
    assert!(err.user_message().contains("previous version was restored"));

    assert_eq!(snapshot(target.path()), before);
    assert!(!target.path().join("plugins").exists());
    assert!(archive.exists());

    let backups = installer.list_backups().unwrap();
    assert_eq!(backups.len(), 1);
    assert!(backups[0].paths.contains(&"legacy.txt".to_string()));
}

#[test]
fn test_failed_verify_without_backup_does_not_claim_restore() {
    let target = installation();
    let work = tempdir().unwrap();
    let archive = package(work.path(), &v2_manifest(), &v2_files("1.9.9\n"));
    let installer = Installer::new(
        target.path(),
        work.path().join("backup"),
        InstallOptions {
            backup_enabled: false,
            ..InstallOptions::default()
        },
    );

    let err = installer.install(&archive, &mut |_| {}).unwrap_err();
    assert!(matches!(
        err,
        CoreError::InstallStepFailed {
            step: "verify",
            restored: false,
            ..
        }
    ));
    assert!(err.user_message().contains("No backup was restored"));
    assert!(installer.list_backups().unwrap().is_empty());
}

#[test]
fn test_backup_named_after_configured_installed_version() {
    let target = installation();
    let work = tempdir().unwrap();
    let archive = package(work.path(), &v2_manifest(), &v2_files("2.0.0\n"));
    let installer = Installer::new(
        target.path(),
        work.path().join("backup"),
        InstallOptions {
            installed_version: Some("1.0.0-rc.2".to_string()),
            ..InstallOptions::default()
        },
    );

    let report = installer.install(&archive, &mut |_| {}).unwrap();
    assert_eq!(report.backup.unwrap().version, "1.0.0-rc.2");
}

#[test]
fn test_corrupt_archive_touches_nothing() {
    let target = installation();
    let before = snapshot(target.path());
    let work = tempdir().unwrap();
    let archive = work.path().join("update.zip");
    std::fs::write(&archive, b"PK\x03\x04 definitely not a zip").unwrap();
    let installer = installer(target.path(), &work.path().join("backup"));

    let err = installer.install(&archive, &mut |_| {}).unwrap_err();
    assert!(matches!(err, CoreError::ArchiveCorrupt(_)));
    assert_eq!(snapshot(target.path()), before);
    assert!(installer.list_backups().unwrap().is_empty());
}

#[test]
fn test_manifest_with_parent_path_is_rejected() {
    let target = installation();
    let before = snapshot(target.path());
    let work = tempdir().unwrap();
    let manifest = json!({ "version": "2.0.0", "files": [{ "path": "../escape" }] });
    let archive = package(work.path(), &manifest, &[("VERSION", "2.0.0")]);
    let installer = installer(target.path(), &work.path().join("backup"));

    assert!(matches!(
        installer.validate_package(&archive),
        Err(CoreError::ArchiveCorrupt(_))
    ));
    assert!(matches!(
        installer.install(&archive, &mut |_| {}),
        Err(CoreError::ArchiveCorrupt(_))
    ));
    assert_eq!(snapshot(target.path()), before);
}

#[test]
fn test_package_info_reads_manifest_without_extracting() {
    let work = tempdir().unwrap();
    let archive = package(work.path(), &v2_manifest(), &v2_files("2.0.0"));
    let target = tempdir().unwrap();
    let installer = installer(target.path(), &work.path().join("backup"));

    let info = installer.package_info(&archive).unwrap();
    assert_eq!(info.manifest.unwrap().version, "2.0.0");
    assert_eq!(info.entries, 6);
    assert!(info.file_size > 0);
    installer.validate_package(&archive).unwrap();
    assert!(std::fs::read_dir(target.path()).unwrap().next().is_none());
}

#[test]
fn test_cleanup_keeps_two_newest_of_five() {
    let target = installation();
    let work = tempdir().unwrap();
    let store = BackupStore::new(work.path().join("backup"));

    let mut created = Vec::new();
    for i in 0..5 {
        let record = store
            .create(target.path(), &format!("1.0.{i}"), &["ui".to_string()])
            .unwrap();
        created.push(record.backup_path);
        std::thread::sleep(Duration::from_millis(15));
    }

    assert_eq!(store.cleanup_old(2).unwrap(), 3);

    let remaining: Vec<PathBuf> = store.list().unwrap().into_iter().map(|r| r.backup_path).collect();
    assert_eq!(remaining, vec![created[4].clone(), created[3].clone()]);
    for old in &created[..3] {
        assert!(!old.exists());
    }
}

#[test]
fn test_restore_on_demand() {
    let target = installation();
    let before = snapshot(target.path());
    let work = tempdir().unwrap();
    let archive = package(work.path(), &v2_manifest(), &v2_files("2.0.0\n"));
    let installer = installer(target.path(), &work.path().join("backup"));

    let report = installer.install(&archive, &mut |_| {}).unwrap();
    assert_ne!(snapshot(target.path()), before);

    installer.restore(&report.backup.unwrap()).unwrap();
    assert_eq!(snapshot(target.path()), before);
}
