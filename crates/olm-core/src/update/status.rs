//! Outcome of the last update, left for the next application start.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::persist;

/// Written by the helper into `config/update_status.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatus {
    /// Whether the new version is installed.
    pub success: bool,
    /// Version that was being installed.
    pub version: String,
    /// Version before the update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    /// When the helper finished.
    pub timestamp: DateTime<Utc>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Helper log for this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl UpdateStatus {
    /// Status for an installed update.
    #[must_use]
    pub fn success(version: &str, previous_version: Option<String>, log_file: Option<PathBuf>) -> Self {
        Self {
            success: true,
            version: version.to_string(),
            previous_version,
            timestamp: Utc::now(),
            error: None,
            log_file,
        }
    }

    /// Status for a failed update.
    #[must_use]
    pub fn failure(
        version: &str,
        previous_version: Option<String>,
        error: impl Into<String>,
        log_file: Option<PathBuf>,
    ) -> Self {
        Self {
            success: false,
            version: version.to_string(),
            previous_version,
            timestamp: Utc::now(),
            error: Some(error.into()),
            log_file,
        }
    }

    /// Write atomically.
    pub fn write(&self, path: &Path) -> Result<()> {
        persist::write_json_atomic(path, self)
    }

    /// Read the status file, `None` when there is none.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        persist::read_json(path)
    }

    /// Read and delete the status file.
    pub fn take(path: &Path) -> Result<Option<Self>> {
        let status = Self::read(path)?;
        if status.is_some() {
            std::fs::remove_file(path).map_err(|e| CoreError::io("remove", path, &e))?;
        }
        Ok(status)
    }
}
