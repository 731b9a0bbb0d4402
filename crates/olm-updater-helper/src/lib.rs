//! Out-of-process installer for application updates.
//!
//! The application downloads the package, writes an
//! [`UpdateHandoff`](olm_core::update::UpdateHandoff), starts this helper and
//! exits. The helper then:
//!
//! 1. reads and validates the handoff,
//! 2. waits for the application to exit, killing it after a timeout,
//! 3. backs up the paths the package touches,
//! 4. extracts and verifies the package,
//! 5. installs it, restoring the backup on any failure,
//! 6. writes `config/update_status.json` for the next start,
//! 7. relaunches the application.

pub mod launch;
pub mod log;
pub mod orchestrator;

pub use orchestrator::{
    Launcher, Orchestrator, ProcessControl, Stage, StageReport, SystemProcesses, WaitPolicy,
};
