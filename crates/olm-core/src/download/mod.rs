//! Resumable downloads.
//!
//! [`HttpDownloader`] fetches one URL into `<dest>.tmp`, resuming with a
//! ranged request when a partial file exists, and renames to `<dest>` only
//! after the optional content hash verifies. [`pull_model`] drives the
//! model server's streamed pull, which resumes by re-issuing the request.
//!
//! Both poll a [`TaskControl`] after every chunk or event so pause and cancel
//! are observed promptly.

mod control;
mod engine;
mod hash;
mod progress;
mod pull;
mod retry;

pub use control::{ControlSignal, TaskControl};
pub use engine::{DownloadOutcome, DownloadRequest, HttpDownloader, temp_path};
pub use hash::{ContentHash, HashAlgorithm, compute_file_hash};
pub use progress::{
    ProgressSnapshot, ProgressTracker, format_bytes, format_eta, format_speed,
};
pub use pull::{LayerProgress, PullOutcome, PullUpdate, is_satisfied_status, is_technical_status, pull_model};
pub use retry::RetryPolicy;

pub(crate) use engine::USER_AGENT_VALUE;
