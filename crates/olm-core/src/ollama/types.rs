//! Model server API types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Installed model as reported by `GET /api/tags`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model name including tag, e.g. `llama3:latest`.
    pub name: String,

    /// Size on disk in bytes.
    #[serde(default)]
    pub size: u64,

    /// Manifest digest.
    #[serde(default)]
    pub digest: String,

    /// Free-form details (family, parameter size, quantization).
    #[serde(default)]
    pub details: Value,

    /// Last modification timestamp as sent by the server.
    #[serde(default)]
    pub modified_at: String,
}

impl ModelInfo {
    /// True when `name` refers to this model, treating a missing tag as `latest`.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        normalize_name(&self.name) == normalize_name(name)
    }
}

/// Loaded model as reported by `GET /api/ps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningModel {
    /// Model name.
    pub name: String,

    /// Total memory footprint in bytes.
    #[serde(default)]
    pub size: u64,

    /// Portion resident in GPU memory.
    #[serde(default)]
    pub size_vram: u64,

    /// When the model will be unloaded.
    #[serde(default)]
    pub expires_at: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ModelList<T> {
    #[serde(default = "Vec::new")]
    pub models: Vec<T>,
}

/// One line of the `POST /api/pull` NDJSON stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PullEvent {
    /// Human status such as `pulling manifest` or `success`.
    #[serde(default)]
    pub status: String,

    /// Layer digest for byte-progress events.
    #[serde(default)]
    pub digest: Option<String>,

    /// Layer size in bytes.
    #[serde(default)]
    pub total: Option<u64>,

    /// Bytes of the layer already present.
    #[serde(default)]
    pub completed: Option<u64>,

    /// Set when the pull failed.
    #[serde(default)]
    pub error: Option<String>,
}

/// `name` with `:latest` appended when no tag is given.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    if name.contains(':') {
        name.to_string()
    } else {
        format!("{name}:latest")
    }
}
