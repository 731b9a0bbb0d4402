//! Error types for downloads, task control and the update pipeline.

use std::path::Path;

use thiserror::Error;

/// Errors raised by the core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A request or body read timed out.
    #[error("request timed out: {0}")]
    NetworkTimeout(String),

    /// Connection failure or broken transfer.
    #[error("network error: {0}")]
    Network(String),

    /// Server answered with a non-success status.
    #[error("server returned HTTP {status} for {url}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Requested URL.
        url: String,
    },

    /// Content hash of a finished download did not match.
    #[error("content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Expected hex digest.
        expected: String,
        /// Computed hex digest.
        actual: String,
    },

    /// Finished file size differs from the declared size.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Declared size.
        expected: u64,
        /// Bytes on disk.
        actual: u64,
    },

    /// Update archive is unreadable or contains unsafe paths.
    #[error("archive is corrupt: {0}")]
    ArchiveCorrupt(String),

    /// Main process survived forced termination.
    #[error("process '{name}' is still running")]
    ProcessStillRunning {
        /// Process name that was waited on.
        name: String,
    },

    /// One install step failed. Triggers a restore.
    #[error("install step '{step}' failed: {reason}")]
    InstallStepFailed {
        /// Step name.
        step: &'static str,
        /// Underlying failure.
        reason: String,
        /// A backup was restored afterwards.
        restored: bool,
    },

    /// Restore after a failed install also failed. Needs manual intervention.
    #[error("install failed ({install_error}) and restore failed: {restore_error}")]
    RestoreFailed {
        /// The failure that triggered the restore.
        install_error: String,
        /// Why the restore failed.
        restore_error: String,
    },

    /// Not enough free space on the destination volume.
    #[error("insufficient disk space: {required} bytes required, {available} available")]
    InsufficientDiskSpace {
        /// Bytes needed.
        required: u64,
        /// Bytes free.
        available: u64,
    },

    /// Version string failed strict validation.
    #[error("invalid version format: {0}")]
    InvalidVersionFormat(String),

    /// A worker already owns this task name.
    #[error("task '{0}' is already active")]
    TaskAlreadyActive(String),

    /// No task with this name.
    #[error("task '{0}' not found")]
    TaskNotFound(String),

    /// Requested transition is not valid from the task's status.
    #[error("cannot {action} task '{name}' while it is {status}")]
    InvalidTaskState {
        /// Task name.
        name: String,
        /// Attempted action.
        action: &'static str,
        /// Current status.
        status: String,
    },

    /// Expected-hash string could not be parsed.
    #[error("invalid content digest: {0}")]
    InvalidDigest(String),

    /// Model server reported an error.
    #[error("model server error: {0}")]
    Api(String),

    /// Settings or handoff document is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(String),

    /// Failed to parse or write JSON.
    #[error("JSON error: {0}")]
    Json(String),
}

impl CoreError {
    /// Wraps an I/O error with the operation and path it happened on.
    pub fn io(operation: &str, path: &Path, err: &std::io::Error) -> Self {
        Self::Io(format!("failed to {operation} {}: {err}", path.display()))
    }

    /// Returns a user-friendly message suitable for display.
    #[must_use]
    pub fn user_message(&self) -> &str {
        match self {
            Self::NetworkTimeout(_) => "The connection timed out. Please check your network.",
            Self::Network(_) => "Could not reach the server. Please check your connection.",
            Self::HttpStatus { .. } => "The server rejected the request.",
            Self::HashMismatch { .. } | Self::SizeMismatch { .. } => {
                "The downloaded file failed verification and was discarded."
            }
            Self::ArchiveCorrupt(_) => "The update package is damaged.",
            Self::ProcessStillRunning { .. } => {
                "The application is still running. Close it and try again."
            }
            Self::InstallStepFailed { restored: true, .. } => {
                "The update could not be installed. The previous version was restored."
            }
            Self::InstallStepFailed { restored: false, .. } => {
                "The update could not be installed. No backup was restored."
            }
            Self::RestoreFailed { .. } => {
                "The update failed and the previous version could not be restored. Manual repair is required."
            }
            Self::InsufficientDiskSpace { .. } => "Not enough disk space.",
            Self::InvalidVersionFormat(_) => "The version number is not valid.",
            Self::TaskAlreadyActive(_) => "This download is already running.",
            Self::TaskNotFound(_) => "Download task not found.",
            Self::InvalidTaskState { .. } => "The download cannot do that right now.",
            Self::Api(_) => "The model server reported an error.",
            Self::InvalidDigest(_) | Self::Config(_) | Self::Io(_) | Self::Json(_) => {
                "An unexpected error occurred."
            }
        }
    }

    /// Returns whether this error is transient and worth retrying in place.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkTimeout(_) | Self::Network(_) => true,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::NetworkTimeout(err.to_string())
        } else if let Some(status) = err.status() {
            Self::HttpStatus {
                status: status.as_u16(),
                url: err.url().map(ToString::to_string).unwrap_or_default(),
            }
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<zip::result::ZipError> for CoreError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::ArchiveCorrupt(err.to_string())
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages() {
        let err = CoreError::Network("connection refused".to_string());
        assert!(err.user_message().contains("connection"));

        let err = CoreError::RestoreFailed {
            install_error: "copy".to_string(),
            restore_error: "denied".to_string(),
        };
        assert!(err.user_message().contains("Manual repair"));
    }

    #[test]
    fn test_install_message_reflects_restore() {
        let failed = |restored| CoreError::InstallStepFailed {
            step: "files",
            reason: "denied".to_string(),
            restored,
        };
        assert!(failed(true).user_message().contains("was restored"));
        assert!(failed(false).user_message().contains("No backup"));
    }

    #[test]
    fn test_retryable() {
        assert!(CoreError::NetworkTimeout("read".to_string()).is_retryable());
        assert!(CoreError::Network("reset".to_string()).is_retryable());
        assert!(
            CoreError::HttpStatus {
                status: 503,
                url: String::new()
            }
            .is_retryable()
        );
        assert!(
            CoreError::HttpStatus {
                status: 429,
                url: String::new()
            }
            .is_retryable()
        );
        assert!(
            !CoreError::HttpStatus {
                status: 404,
                url: String::new()
            }
            .is_retryable()
        );
        assert!(
            !CoreError::HashMismatch {
                expected: "a".to_string(),
                actual: "b".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_io_context() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = CoreError::io("open", Path::new("/tmp/x"), &err);
        assert!(err.to_string().contains("failed to open /tmp/x"));
    }
}
