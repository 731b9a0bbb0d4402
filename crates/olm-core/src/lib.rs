//! Core of the local model manager.
//!
//! This crate holds everything that has state or failure-recovery logic:
//! resumable downloads, the durable task registry, the worker pool that
//! drives downloads, and the self-update pipeline (check, fetch, hand off,
//! install, roll back).
//!
//! # Overview
//!
//! - [`version`] parses and orders `MAJOR.MINOR.PATCH[-PRE]` strings
//! - [`download`] performs a single resumable HTTP fetch and drives model pulls
//! - [`registry`] persists named download tasks and reconciles them on load
//! - [`tasks`] runs downloads on a bounded pool and publishes [`tasks::TaskEvent`]s
//! - [`install`] extracts an update archive, backs up, applies and restores
//! - [`update`] checks update sources and hands off to the helper process
//! - [`ollama`] talks to the model server's REST API
//!
//! # Example
//!
//! ```no_run
//! use olm_core::config::{AppPaths, Settings};
//! use olm_core::ollama::OllamaClient;
//! use olm_core::tasks::{TaskEvent, TaskManager};
//!
//! async fn pull() -> olm_core::Result<()> {
//!     let paths = AppPaths::resolve(None)?;
//!     let settings = Settings::load_or_default(&paths.settings_file())?;
//!     let ollama = OllamaClient::new(&settings.server)?;
//!     let (manager, mut events) = TaskManager::open(&paths.tasks_file(), &settings.downloads, ollama)?;
//!
//!     manager.pull_model("llama3")?;
//!     while let Some(event) = events.recv().await {
//!         if let TaskEvent::Finished { name, outcome } = event {
//!             println!("{name}: {outcome}");
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod error;
pub mod version;

// Downloads and tasks
pub mod download;
pub mod ollama;
pub mod registry;
pub mod tasks;

// Self-update
pub mod install;
pub mod update;

pub mod system;

mod persist;

pub use error::{CoreError, Result};
pub use version::{Bump, UpdateKind, Version, compare, is_newer, next_version};

/// Current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
