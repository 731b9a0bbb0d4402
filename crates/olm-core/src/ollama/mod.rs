//! Client for the local model server.
//!
//! Covers the endpoints the manager needs: installed and loaded model lists,
//! delete, unload and the streamed pull.

mod client;
mod types;

pub use client::OllamaClient;
pub use types::{ModelInfo, PullEvent, RunningModel, normalize_name};
