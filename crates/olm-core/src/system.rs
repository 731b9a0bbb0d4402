//! Disk space and process lookups.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use sysinfo::{Disks, Pid, System};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};

/// Free bytes on the volume holding `path`, if it can be determined.
///
/// Picks the disk with the longest mount point that prefixes the path. The
/// path itself need not exist yet.
#[must_use]
pub fn available_space(path: &Path) -> Option<u64> {
    let target = existing_ancestor(path);
    let disks = Disks::new_with_refreshed_list();

    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if target.starts_with(mount) {
            let score = mount.as_os_str().len();
            if best.is_none_or(|(current, _)| score > current) {
                best = Some((score, disk.available_space()));
            }
        }
    }

    best.map(|(_, space)| space)
}

/// Fail with [`CoreError::InsufficientDiskSpace`] when fewer than `required`
/// bytes are free next to `path`. Unknown volumes pass.
pub fn ensure_free_space(path: &Path, required: u64) -> Result<()> {
    match available_space(path) {
        Some(available) if available < required => {
            Err(CoreError::InsufficientDiskSpace { required, available })
        }
        Some(available) => {
            debug!("{} bytes free, {} required", available, required);
            Ok(())
        }
        None => {
            debug!("No disk found for {}, skipping space check", path.display());
            Ok(())
        }
    }
}

fn existing_ancestor(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut current = absolute.as_path();
    loop {
        if let Ok(canonical) = current.canonicalize() {
            return canonical;
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return absolute,
        }
    }
}

/// Compare a process name against `name`, ignoring case and `.exe`.
fn name_matches(process_name: &str, name: &str) -> bool {
    let strip = |s: &str| {
        let lower = s.to_ascii_lowercase();
        lower.strip_suffix(".exe").map(str::to_string).unwrap_or(lower)
    };
    strip(process_name) == strip(name)
}

/// PIDs of processes called `name`, excluding the current process.
#[must_use]
pub fn find_processes(name: &str) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes();
    let own = sysinfo::get_current_pid().ok();

    system
        .processes()
        .iter()
        .filter(|(pid, _)| Some(**pid) != own)
        .filter(|(_, process)| name_matches(process.name(), name))
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

/// True when any process other than this one is called `name`.
#[must_use]
pub fn is_process_running(name: &str) -> bool {
    !find_processes(name).is_empty()
}

/// Kill every process called `name`. Returns how many were signalled.
pub fn kill_processes(name: &str) -> usize {
    let mut system = System::new();
    system.refresh_processes();
    let own = sysinfo::get_current_pid().ok();

    let mut killed = 0;
    for (pid, process) in system.processes() {
        if Some(*pid) == own || !name_matches(process.name(), name) {
            continue;
        }
        if process.kill() {
            info!("Killed {} (pid {})", process.name(), pid);
            killed += 1;
        } else {
            warn!("Failed to kill {} (pid {})", process.name(), pid);
        }
    }
    killed
}

/// True while the process with `pid` exists.
#[must_use]
pub fn is_pid_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_process(Pid::from_u32(pid))
}

/// Kill the process with `pid`. Returns false when it was not found.
pub fn kill_pid(pid: u32) -> bool {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    if !system.refresh_process(pid) {
        return false;
    }
    system.process(pid).is_some_and(sysinfo::Process::kill)
}

/// Configure `command` to outlive the current process with no attached stdio.
pub fn detach(command: &mut Command) -> &mut Command {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }

    command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_matches() {
        assert!(name_matches("OLM.exe", "olm"));
        assert!(name_matches("olm", "olm.EXE"));
        assert!(!name_matches("olm-updater-helper", "olm"));
    }

    #[test]
    fn test_available_space_for_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("a/b/c.tmp");
        assert_eq!(existing_ancestor(&missing), dir.path().canonicalize().unwrap());
        // Passes on hosts where the volume is unknown.
        ensure_free_space(&missing, 1).unwrap();
    }

    #[test]
    fn test_insufficient_space() {
        let dir = tempfile::tempdir().unwrap();
        if available_space(dir.path()).is_some() {
            let err = ensure_free_space(dir.path(), u64::MAX).unwrap_err();
            assert!(matches!(err, CoreError::InsufficientDiskSpace { .. }));
        }
    }

    #[test]
    fn test_current_process_alive_but_excluded() {
        let own = std::process::id();
        assert!(is_pid_alive(own));
        let name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();
        assert!(!find_processes(&name).contains(&own));
    }
}
