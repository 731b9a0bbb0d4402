//! Application settings and on-disk layout.
//!
//! Settings live in `config/config.json` under the application root. Missing
//! keys are filled from defaults, and documents written before
//! `schema_version` existed are migrated and saved back.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::persist;

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Environment variable that overrides the application root.
pub const ROOT_ENV_VAR: &str = "OLM_HOME";

/// Smallest and largest accepted download chunk.
pub const CHUNK_SIZE_RANGE: (usize, usize) = (8 * 1024, 1024 * 1024);

/// Accepted worker pool sizes.
pub const CONCURRENCY_RANGE: (usize, usize) = (8, 32);

/// Top-level settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Document schema version.
    pub schema_version: u32,
    /// Model server location.
    pub server: ServerSettings,
    /// Self-update behaviour.
    pub update: UpdateSettings,
    /// Download engine tuning.
    pub downloads: DownloadSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            server: ServerSettings::default(),
            update: UpdateSettings::default(),
            downloads: DownloadSettings::default(),
        }
    }
}

/// Address of the model server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Host name or IP.
    pub address: String,
    /// TCP port.
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: 11434,
        }
    }
}

impl ServerSettings {
    /// Base URL of the REST API, e.g. `http://localhost:11434/api`.
    #[must_use]
    pub fn api_base(&self) -> String {
        format!("http://{}:{}/api", self.address, self.port)
    }
}

/// User settings for the update system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSettings {
    /// Where to look for updates: a local directory, an HTTP(S) URL or a
    /// GitHub repository URL. Empty disables checking.
    pub source: String,

    /// Minimum seconds between automatic checks.
    pub check_interval_secs: u64,

    /// Start downloading as soon as an update is found.
    pub auto_download: bool,

    /// Hand off to the installer as soon as the download completes.
    pub auto_install: bool,

    /// Back up touched paths before installing.
    pub backup_enabled: bool,

    /// Number of backups kept after a successful install.
    pub backup_keep: usize,

    /// Paths installed when a package manifest lists no files.
    pub default_paths: Vec<String>,

    /// Version marker checked after install when the manifest names none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_file: Option<String>,

    /// Allow local directory sources.
    pub developer_mode: bool,

    /// Version to skip (user chose "Skip This Version").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_version: Option<String>,

    /// Last time we checked for updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            source: String::new(),
            check_interval_secs: 86_400,
            auto_download: false,
            auto_install: false,
            backup_enabled: true,
            backup_keep: 3,
            default_paths: vec!["ui".to_string(), "config".to_string()],
            version_file: None,
            developer_mode: false,
            skipped_version: None,
            last_check: None,
        }
    }
}

impl UpdateSettings {
    /// Check if we should perform an automatic update check on startup.
    #[must_use]
    pub fn should_check_on_startup(&self) -> bool {
        self.should_check_at(Utc::now())
    }

    fn should_check_at(&self, now: DateTime<Utc>) -> bool {
        if self.source.trim().is_empty() {
            return false;
        }

        match self.last_check {
            None => true,
            Some(last) => {
                let elapsed = now.signed_duration_since(last).num_seconds();
                elapsed < 0 || elapsed as u64 >= self.check_interval_secs
            }
        }
    }

    /// Check if a version should be skipped based on user preference.
    #[must_use]
    pub fn should_skip_version(&self, version: &str) -> bool {
        match &self.skipped_version {
            Some(skipped) => {
                skipped == version || skipped == version.strip_prefix('v').unwrap_or(version)
            }
            None => false,
        }
    }

    /// Record that we just checked for updates.
    pub fn record_check(&mut self) {
        self.last_check = Some(Utc::now());
    }

    /// Set a version to skip.
    pub fn skip_version(&mut self, version: impl Into<String>) {
        self.skipped_version = Some(version.into());
    }
}

/// Download engine tuning. Values are clamped on use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// Bytes written between control checks.
    pub chunk_size: usize,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub retry_backoff_ms: u64,
    /// Minimum interval between progress snapshots.
    pub progress_interval_ms: u64,
    /// Worker pool size.
    pub concurrency: usize,
    /// TCP connect timeout.
    pub connect_timeout_secs: u64,
    /// Idle read timeout on a response body.
    pub read_timeout_secs: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            max_retries: 3,
            retry_backoff_ms: 2_000,
            progress_interval_ms: 500,
            concurrency: 8,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
        }
    }
}

impl DownloadSettings {
    /// Chunk size clamped to [`CHUNK_SIZE_RANGE`].
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
            .clamp(CHUNK_SIZE_RANGE.0, CHUNK_SIZE_RANGE.1)
    }

    /// Pool size clamped to [`CONCURRENCY_RANGE`].
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
            .clamp(CONCURRENCY_RANGE.0, CONCURRENCY_RANGE.1)
    }

    /// Delay between retry attempts.
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Progress interval, never below half a second.
    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(500))
    }

    /// Connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// Read timeout.
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }
}

impl Settings {
    /// Load settings, filling defaults and migrating older documents.
    ///
    /// A missing file yields defaults without writing anything. A migrated
    /// document is saved back immediately.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let Some(mut document) = persist::read_json::<Value>(path)? else {
            return Ok(Self::default());
        };

        let migrated = migrate(&mut document)?;
        let settings: Self = serde_json::from_value(document)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;

        if migrated {
            tracing::info!(
                "Migrated settings in {} to schema {}",
                path.display(),
                CURRENT_SCHEMA_VERSION
            );
            settings.save(path)?;
        }
        Ok(settings)
    }

    /// Save settings atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        persist::write_json_atomic(path, self)
    }
}

/// Bring a raw settings document up to [`CURRENT_SCHEMA_VERSION`].
///
/// Schema 0 is the layout without `schema_version`, where the update block
/// used `update_server` and `check_interval`.
fn migrate(document: &mut Value) -> Result<bool> {
    let Some(root) = document.as_object_mut() else {
        return Err(CoreError::Config(
            "settings document is not a JSON object".to_string(),
        ));
    };

    let version = root
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    if version > u64::from(CURRENT_SCHEMA_VERSION) {
        return Err(CoreError::Config(format!(
            "settings schema {version} is newer than supported {CURRENT_SCHEMA_VERSION}"
        )));
    }
    if version == u64::from(CURRENT_SCHEMA_VERSION) {
        return Ok(false);
    }

    if let Some(update) = root.get_mut("update").and_then(Value::as_object_mut) {
        for (old, new) in [
            ("update_server", "source"),
            ("check_interval", "check_interval_secs"),
        ] {
            if let Some(value) = update.remove(old) {
                update.entry(new).or_insert(value);
            }
        }
    }

    root.insert(
        "schema_version".to_string(),
        Value::from(CURRENT_SCHEMA_VERSION),
    );
    Ok(true)
}

/// Locations derived from the application root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    /// Use `root` as the application root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the root from an explicit path, then `OLM_HOME`, then the
    /// directory holding the running executable.
    pub fn resolve(explicit: Option<PathBuf>) -> Result<Self> {
        if let Some(root) = explicit {
            return Ok(Self::new(root));
        }
        if let Some(root) = env::var_os(ROOT_ENV_VAR).filter(|v| !v.is_empty()) {
            return Ok(Self::new(PathBuf::from(root)));
        }

        let exe = env::current_exe()
            .map_err(|e| CoreError::Config(format!("cannot locate executable: {e}")))?;
        let root = exe
            .parent()
            .ok_or_else(|| CoreError::Config("executable has no parent directory".to_string()))?;
        Ok(Self::new(root))
    }

    /// Application root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `config/`
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    /// `config/config.json`
    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.config_dir().join("config.json")
    }

    /// `config/download_tasks.json`
    #[must_use]
    pub fn tasks_file(&self) -> PathBuf {
        self.config_dir().join("download_tasks.json")
    }

    /// `config/update_status.json`
    #[must_use]
    pub fn status_file(&self) -> PathBuf {
        self.config_dir().join("update_status.json")
    }

    /// `temp/`
    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// `temp/update.zip`
    #[must_use]
    pub fn update_file(&self) -> PathBuf {
        self.temp_dir().join("update.zip")
    }

    /// `temp/update_info.json`
    #[must_use]
    pub fn handoff_file(&self) -> PathBuf {
        self.temp_dir().join("update_info.json")
    }

    /// `backup/`
    #[must_use]
    pub fn backup_dir(&self) -> PathBuf {
        self.root.join("backup")
    }

    /// `logs/`
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::tempdir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(settings.server.api_base(), "http://localhost:11434/api");
        assert!(settings.update.backup_enabled);
        assert_eq!(settings.update.backup_keep, 3);
        assert_eq!(settings.downloads.max_retries, 3);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let settings = Settings::load_or_default(&path).unwrap();
        assert_eq!(settings, Settings::default());
        assert!(!path.exists());
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"schema_version": 1, "server": {"address": "10.0.0.5"}}"#,
        )
        .unwrap();

        let settings = Settings::load_or_default(&path).unwrap();
        assert_eq!(settings.server.address, "10.0.0.5");
        assert_eq!(settings.server.port, 11434);
        assert_eq!(settings.downloads, DownloadSettings::default());
    }

    #[test]
    fn test_legacy_document_is_migrated_and_saved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"update": {"update_server": "https://updates.example.com", "check_interval": 3600, "backup_enabled": false}}"#,
        )
        .unwrap();

        let settings = Settings::load_or_default(&path).unwrap();
        assert_eq!(settings.update.source, "https://updates.example.com");
        assert_eq!(settings.update.check_interval_secs, 3600);
        assert!(!settings.update.backup_enabled);

        let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["schema_version"], 1);
        assert_eq!(saved["update"]["source"], "https://updates.example.com");
        assert!(saved["update"].get("update_server").is_none());
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"schema_version": 99}"#).unwrap();
        assert!(matches!(
            Settings::load_or_default(&path),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn test_download_settings_clamp() {
        let settings = DownloadSettings {
            chunk_size: 1,
            concurrency: 100,
            progress_interval_ms: 10,
            ..DownloadSettings::default()
        };
        assert_eq!(settings.chunk_size(), 8 * 1024);
        assert_eq!(settings.concurrency(), 32);
        assert_eq!(settings.progress_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_should_check_interval() {
        let mut settings = UpdateSettings {
            source: "https://updates.example.com".to_string(),
            ..UpdateSettings::default()
        };
        let now = Utc::now();
        assert!(settings.should_check_at(now));

        settings.last_check = Some(now - ChronoDuration::hours(1));
        assert!(!settings.should_check_at(now));

        settings.last_check = Some(now - ChronoDuration::hours(25));
        assert!(settings.should_check_at(now));

        settings.source.clear();
        assert!(!settings.should_check_at(now));
    }

    #[test]
    fn test_skip_version() {
        let mut settings = UpdateSettings::default();
        assert!(!settings.should_skip_version("1.2.3"));

        settings.skip_version("1.2.3");
        assert!(settings.should_skip_version("1.2.3"));
        assert!(settings.should_skip_version("v1.2.3"));
    }

    #[test]
    fn test_paths_layout() {
        let paths = AppPaths::new("/opt/olm");
        assert_eq!(
            paths.tasks_file(),
            PathBuf::from("/opt/olm/config/download_tasks.json")
        );
        assert_eq!(paths.update_file(), PathBuf::from("/opt/olm/temp/update.zip"));
        assert_eq!(
            paths.handoff_file(),
            PathBuf::from("/opt/olm/temp/update_info.json")
        );
        assert_eq!(paths.backup_dir(), PathBuf::from("/opt/olm/backup"));
    }

    #[test]
    fn test_explicit_root_wins() {
        let paths = AppPaths::resolve(Some(PathBuf::from("/srv/olm"))).unwrap();
        assert_eq!(paths.root(), Path::new("/srv/olm"));
    }
}
