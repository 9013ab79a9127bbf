//! PID file for detecting a running daemon.
//!
//! The file lives at `<data_dir>/workhorse.pid`. It is written once the
//! endpoints are bound and removed on shutdown. A file whose process is gone
//! is treated as stale and removed by whoever finds it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// File name of the PID file inside the data directory.
pub const PID_FILE_NAME: &str = "workhorse.pid";

/// Get the path to the daemon PID file.
pub fn pid_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(PID_FILE_NAME)
}

/// Get the PID of the running daemon, if any.
///
/// Automatically cleans up stale or unparseable PID files.
pub fn read_running_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;

    let pid: u32 = match contents.trim().parse() {
        Ok(pid) => pid,
        Err(_) => {
            cleanup_stale_pid_file(path);
            return None;
        }
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        cleanup_stale_pid_file(path);
        None
    }
}

/// Check if a process with the given PID exists.
///
/// Uses `kill(pid, 0)`; a permission error still means the process exists.
pub fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn cleanup_stale_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove stale PID file {:?}: {}", path, e);
        }
    } else {
        tracing::debug!("Removed stale PID file {:?}", path);
    }
}

/// The PID file owned by this process. Removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current process id to `path`, creating parent directories.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("{}\n", std::process::id()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove PID file {:?}: {}", self.path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pid_file_path() {
        let path = pid_file_path(Path::new("/var/lib/workhorse"));
        assert_eq!(path, PathBuf::from("/var/lib/workhorse/workhorse.pid"));
    }

    #[test]
    fn test_is_process_running_current_process() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    fn test_is_process_running_nonexistent() {
        // PID 4194304 exceeds the default pid_max on Linux.
        assert!(!is_process_running(4_194_304));
        assert!(!is_process_running(0));
        assert!(!is_process_running(u32::MAX));
    }

    #[test]
    fn test_read_running_pid_missing_file() {
        let dir = tempdir().unwrap();
        assert_eq!(read_running_pid(&dir.path().join("none.pid")), None);
    }

    #[test]
    fn test_read_running_pid_cleans_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workhorse.pid");
        fs::write(&path, "not-a-pid").unwrap();

        assert_eq!(read_running_pid(&path), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_read_running_pid_cleans_stale_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workhorse.pid");
        fs::write(&path, "4194304").unwrap();

        assert_eq!(read_running_pid(&path), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_pid_file_create_and_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("workhorse.pid");

        let pid_file = PidFile::create(&path).unwrap();
        assert_eq!(pid_file.path(), path);
        assert_eq!(read_running_pid(&path), Some(std::process::id()));

        drop(pid_file);
        assert!(!path.exists());
    }
}
