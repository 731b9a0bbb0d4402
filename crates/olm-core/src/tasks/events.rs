//! Events published by the task manager.

use std::fmt;

use crate::registry::DownloadTask;

/// Terminal result of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Downloaded and verified.
    Completed,
    /// Stopped by an error. The task stays in the registry as `failed`.
    Failed {
        /// Display text of the error.
        reason: String,
    },
    /// Cancelled and removed.
    Cancelled,
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Something happened to a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// The task record changed status.
    TaskUpdated(DownloadTask),
    /// Periodic transfer progress.
    Progress {
        /// Task name.
        name: String,
        /// Percent complete.
        percent: f64,
        /// Display speed.
        speed: String,
        /// Display time remaining.
        eta: String,
    },
    /// Human-readable status line from the model server.
    Status {
        /// Task name.
        name: String,
        /// Message text.
        message: String,
    },
    /// The task ended. Sent once per execution that does not end paused.
    Finished {
        /// Task name.
        name: String,
        /// How it ended.
        outcome: TaskOutcome,
    },
}

impl TaskEvent {
    /// Name of the task this event is about.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::TaskUpdated(task) => &task.name,
            Self::Progress { name, .. } | Self::Status { name, .. } | Self::Finished { name, .. } => {
                name
            }
        }
    }
}
