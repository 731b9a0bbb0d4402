//! Durable registry of named download tasks.
//!
//! The registry is a single JSON document keyed by task name, rewritten
//! atomically after every change. A task that was `downloading` when the
//! process died is reloaded as `paused` so it can be resumed explicitly.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::download::{ProgressSnapshot, format_bytes};
use crate::error::{CoreError, Result};
use crate::persist;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a worker slot.
    Queued,
    /// A worker is transferring.
    Downloading,
    /// Stopped with a partial file kept.
    Paused,
    /// Finished and verified.
    Completed,
    /// Stopped by an error.
    Failed,
    /// Stopped and discarded.
    Cancelled,
}

impl TaskStatus {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// True for states a new pull may pick up again.
    #[must_use]
    pub const fn is_resumable(self) -> bool {
        matches!(self, Self::Queued | Self::Paused | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task downloads.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TaskSource {
    /// A pull through the model server.
    #[default]
    Model,
    /// A plain HTTP file.
    #[serde(rename_all = "camelCase")]
    File {
        /// Source URL.
        url: String,
        /// Final path.
        dest: PathBuf,
        /// Declared size.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_size: Option<u64>,
        /// Expected digest, `algo:hex` or bare hex.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_hash: Option<String>,
    },
}

/// One in-flight or recoverable download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTask {
    /// Unique key.
    #[serde(rename = "modelName")]
    pub name: String,
    /// Current state.
    pub status: TaskStatus,
    /// Percent complete, 0 to 100.
    #[serde(default)]
    pub progress: f64,
    /// Display speed.
    #[serde(default)]
    pub speed: String,
    /// Display time remaining.
    #[serde(default)]
    pub eta: String,
    /// Display bytes done.
    #[serde(default)]
    pub downloaded_size: String,
    /// Display bytes total.
    #[serde(default)]
    pub total_size: String,
    /// True once bytes have been durably written.
    #[serde(default)]
    pub can_resume: bool,
    /// What to download.
    #[serde(default)]
    pub source: TaskSource,
    /// Last failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last persisted change.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Raw byte counter behind `downloaded_size`.
    #[serde(default)]
    pub downloaded_bytes: u64,
    /// Raw byte counter behind `total_size`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

impl DownloadTask {
    /// New queued task.
    #[must_use]
    pub fn new(name: impl Into<String>, source: TaskSource) -> Self {
        Self {
            name: name.into(),
            status: TaskStatus::Queued,
            progress: 0.0,
            speed: String::new(),
            eta: String::new(),
            downloaded_size: String::new(),
            total_size: String::new(),
            can_resume: false,
            source,
            error: None,
            updated_at: Utc::now(),
            downloaded_bytes: 0,
            total_bytes: None,
        }
    }

    /// Copy counters and display strings from a snapshot.
    pub fn apply_progress(&mut self, snapshot: &ProgressSnapshot) {
        self.progress = snapshot.percent();
        self.speed = snapshot.speed_text();
        self.eta = snapshot.eta_text();
        self.downloaded_bytes = snapshot.downloaded;
        self.downloaded_size = format_bytes(snapshot.downloaded);
        self.total_bytes = snapshot.total;
        self.total_size = snapshot.total.map(format_bytes).unwrap_or_default();
        if snapshot.downloaded > 0 {
            self.can_resume = true;
        }
    }

    /// Clear live-only display fields.
    pub fn clear_rates(&mut self) {
        self.speed.clear();
        self.eta.clear();
    }
}

/// Name → task map backed by a JSON file.
#[derive(Debug)]
pub struct TaskRegistry {
    path: PathBuf,
    tasks: BTreeMap<String, DownloadTask>,
}

impl TaskRegistry {
    /// Load the registry, reconciling interrupted tasks.
    ///
    /// A missing file gives an empty registry. A corrupt file is logged and
    /// replaced with an empty registry on the next save.
    pub fn open(path: &Path) -> Result<Self> {
        let (tasks, existed) = match persist::read_json::<BTreeMap<String, DownloadTask>>(path) {
            Ok(Some(tasks)) => (tasks, true),
            Ok(None) => (BTreeMap::new(), false),
            Err(CoreError::Json(e)) => {
                warn!("Task registry {} is corrupt ({}), starting empty", path.display(), e);
                (BTreeMap::new(), true)
            }
            Err(e) => return Err(e),
        };

        let mut registry = Self {
            path: path.to_path_buf(),
            tasks,
        };

        let mut reclassified = 0;
        for task in registry.tasks.values_mut() {
            if task.status == TaskStatus::Downloading {
                task.status = TaskStatus::Paused;
                task.can_resume = true;
                task.clear_rates();
                reclassified += 1;
            }
        }
        if reclassified > 0 {
            info!("Marked {} interrupted task(s) as paused", reclassified);
        }

        if existed {
            registry.save()?;
        }
        Ok(registry)
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Task by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DownloadTask> {
        self.tasks.get(name)
    }

    /// All tasks, ordered by name.
    #[must_use]
    pub fn list(&self) -> Vec<DownloadTask> {
        self.tasks.values().cloned().collect()
    }

    /// Insert or replace a task and persist.
    pub fn upsert(&mut self, mut task: DownloadTask) -> Result<()> {
        task.updated_at = Utc::now();
        self.tasks.insert(task.name.clone(), task);
        self.save()
    }

    /// Replace a task in memory only. The next persisting call writes it.
    pub fn stage(&mut self, mut task: DownloadTask) {
        task.updated_at = Utc::now();
        self.tasks.insert(task.name.clone(), task);
    }

    /// Remove a task and persist. Returns the removed task.
    pub fn remove(&mut self, name: &str) -> Result<Option<DownloadTask>> {
        let removed = self.tasks.remove(name);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    fn save(&self) -> Result<()> {
        persist::write_json_atomic(&self.path, &self.tasks)
    }
}
