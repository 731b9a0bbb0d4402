//! Self-update: checking sources and handing off to the helper.
//!
//! The flow is split across two processes:
//!
//! 1. [`Supervisor::check`] asks the configured [`UpdateSource`] for the
//!    latest [`RemoteVersion`].
//! 2. [`Supervisor::start_download`] fetches the package to `temp/update.zip`.
//! 3. [`Supervisor::prepare_handoff`] writes an [`UpdateHandoff`] and
//!    [`Supervisor::launch_orchestrator`] starts the helper, after which the
//!    application exits.
//! 4. The helper installs and leaves an [`UpdateStatus`] that
//!    [`Supervisor::take_status`] reports on the next start.

mod github;
mod handoff;
mod source;
mod status;
mod supervisor;

pub use github::{GitHubAsset, GitHubClient, GitHubRelease};
pub use handoff::UpdateHandoff;
pub use source::{RemoteVersion, UpdateSource, VERSION_FILE};
pub use status::UpdateStatus;
pub use supervisor::{DownloadStart, HELPER_BINARY, Supervisor, UPDATE_TASK, UpdateCheck};
