//! Atomic JSON document writes.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CoreError, Result};

/// Serialize `value` as pretty JSON and write it atomically.
///
/// Writes to a sibling temp file, syncs, then renames over `path` so a crash
/// never leaves a truncated document behind.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| CoreError::io("create directory", parent, &e))?;
    }

    let temp_path = sibling_temp(path);

    let mut file = File::create(&temp_path).map_err(|e| CoreError::io("create", &temp_path, &e))?;
    file.write_all(bytes)
        .map_err(|e| CoreError::io("write", &temp_path, &e))?;
    file.sync_all()
        .map_err(|e| CoreError::io("sync", &temp_path, &e))?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        CoreError::io("replace", path, &e)
    })?;

    tracing::debug!("Wrote {}", path.display());
    Ok(())
}

/// Read a JSON document. `Ok(None)` when the file does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CoreError::io("read", path, &e)),
    };
    Ok(Some(serde_json::from_str(&content)?))
}

fn sibling_temp(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");
        let doc = Doc {
            name: "llama3".to_string(),
        };

        write_json_atomic(&path, &doc).unwrap();

        assert!(!dir.path().join("nested").join("doc.json.tmp").exists());
        assert_eq!(read_json::<Doc>(&path).unwrap(), Some(doc));
    }

    #[test]
    fn test_read_missing_is_none() {
        let dir = tempdir().unwrap();
        assert_eq!(read_json::<Doc>(&dir.path().join("none.json")).unwrap(), None);
    }
}
