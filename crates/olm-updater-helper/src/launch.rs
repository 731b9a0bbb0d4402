//! Relaunch the updated application.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use olm_core::system;
use tracing::{info, warn};

use crate::orchestrator::Launcher;

/// True for `.py` and `.pyw` entry points.
#[must_use]
pub fn is_script(exe: &Path) -> bool {
    exe.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("py") || ext.eq_ignore_ascii_case("pyw"))
}

/// Interpreter in the project's `.venv`, where the project root is the
/// parent of the entry point's directory.
#[must_use]
pub fn venv_interpreter(exe: &Path) -> Option<PathBuf> {
    let project_root = exe.parent()?.parent()?;
    let venv = project_root.join(".venv");
    let interpreter = if cfg!(windows) {
        venv.join("Scripts").join("python.exe")
    } else {
        venv.join("bin").join("python")
    };
    interpreter.is_file().then_some(interpreter)
}

fn system_interpreter() -> &'static str {
    if cfg!(windows) { "python" } else { "python3" }
}

/// Command that starts `exe`, going through an interpreter for scripts.
#[must_use]
pub fn launch_command(exe: &Path) -> Command {
    let mut command = if is_script(exe) {
        let interpreter = venv_interpreter(exe).unwrap_or_else(|| {
            warn!(
                "No .venv interpreter next to {}, falling back to {}",
                exe.display(),
                system_interpreter()
            );
            PathBuf::from(system_interpreter())
        });
        let mut command = Command::new(interpreter);
        command.arg(exe);
        command
    } else {
        Command::new(exe)
    };

    if let Some(dir) = exe.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        command.current_dir(dir);
    }
    command
}

/// Starts the application detached from the helper.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedLauncher;

impl Launcher for DetachedLauncher {
    fn launch(&self, exe: &Path) -> io::Result<u32> {
        let mut command = launch_command(exe);
        let child = system::detach(&mut command).spawn()?;
        info!("Relaunched {} (pid {})", exe.display(), child.id());
        Ok(child.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_is_script() {
        assert!(is_script(Path::new("/app/src/main.py")));
        assert!(is_script(Path::new("C:/app/src/main.PYW")));
        assert!(!is_script(Path::new("/app/olm")));
        assert!(!is_script(Path::new("/app/olm.exe")));
    }

    #[test]
    fn test_venv_interpreter_found() {
        let dir = tempdir().unwrap();
        let interpreter = if cfg!(windows) {
            dir.path().join(".venv/Scripts/python.exe")
        } else {
            dir.path().join(".venv/bin/python")
        };
        std::fs::create_dir_all(interpreter.parent().unwrap()).unwrap();
        std::fs::write(&interpreter, "").unwrap();
        let entry = dir.path().join("src/main.py");

        assert_eq!(venv_interpreter(&entry), Some(interpreter.clone()));
        let command = launch_command(&entry);
        assert_eq!(Path::new(command.get_program()), interpreter);
        assert_eq!(command.get_args().collect::<Vec<_>>(), vec![entry.as_os_str()]);
        assert_eq!(command.get_current_dir(), Some(dir.path().join("src").as_path()));
    }

    #[test]
    fn test_missing_venv_falls_back_to_system_python() {
        let dir = tempdir().unwrap();
        let entry = dir.path().join("src/main.py");
        assert!(venv_interpreter(&entry).is_none());

        let command = launch_command(&entry);
        assert_eq!(command.get_program(), system_interpreter());
    }

    #[test]
    fn test_binary_runs_directly() {
        let command = launch_command(Path::new("/opt/olm/olm"));
        assert_eq!(command.get_program(), "/opt/olm/olm");
        assert_eq!(command.get_args().count(), 0);
    }
}
