//! Recursive copy and removal.

use std::fs;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::{CoreError, Result};

/// Copy a file or directory tree to `dst`, creating parents.
pub(crate) fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| CoreError::io("create directory", parent, &e))?;
    }

    if !src.is_dir() {
        fs::copy(src, dst).map_err(|e| CoreError::io("copy", src, &e))?;
        return Ok(());
    }

    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| CoreError::Io(format!("failed to walk {}: {e}", src.display())))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| CoreError::Io(e.to_string()))?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| CoreError::io("create directory", &target, &e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| CoreError::io("copy", entry.path(), &e))?;
        }
    }
    Ok(())
}

/// Remove a file or directory tree. Missing paths are fine.
pub(crate) fn remove_path(path: &Path) -> Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|e| CoreError::io("remove", path, &e))
}

/// Total size of the files under `path`.
pub(crate) fn tree_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_copy_and_remove_tree() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();
        fs::write(src.join("nested/b.txt"), "bb").unwrap();

        let dst = dir.path().join("out/copy");
        copy_path(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(dst.join("nested/b.txt")).unwrap(), "bb");
        assert_eq!(tree_size(&dst), 3);

        remove_path(&dst).unwrap();
        assert!(!dst.exists());
        remove_path(&dst).unwrap();
    }
}
