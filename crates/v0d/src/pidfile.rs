//! Daemon PID file: single-instance guard and orphan detection.
//!
//! A PID file is considered valid only when the recorded process is alive
//! *and* its command line matches the expected worker identity - this
//! defeats PID reuse by an unrelated process that happens to inherit the
//! same number after the daemon exits.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("another instance is already running (pid {pid})")]
    AlreadyRunning { pid: i32 },
}

fn io_err(path: &Path, source: std::io::Error) -> PidFileError {
    PidFileError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read `/proc/<pid>/cmdline` (NUL-separated argv) as a single string.
/// Returns `None` if the process or `/proc` entry doesn't exist.
fn read_cmdline(pid: i32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    Some(
        raw.split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect::<Vec<_>>()
            .join(" "),
    )
}

fn pid_is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// A held PID file. Removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Acquire the PID file at `path`, identifying this process with
    /// `identity_substr` (a string expected to appear in this process's own
    /// command line, e.g. the daemon binary name). Fails if an existing
    /// PID file names a live process whose command line also contains
    /// `identity_substr`.
    pub fn acquire(path: &Path, identity_substr: &str) -> Result<Self, PidFileError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        if let Some(existing_pid) = read_pid(path) {
            if pid_is_alive(existing_pid) {
                if let Some(cmdline) = read_cmdline(existing_pid) {
                    if cmdline.contains(identity_substr) {
                        return Err(PidFileError::AlreadyRunning { pid: existing_pid });
                    }
                }
            }
            // Stale: process dead, or alive but not ours (PID reuse). Overwrite.
        }

        std::fs::write(path, std::process::id().to_string()).map_err(|e| io_err(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Send `SIGTERM` to orphaned worker processes: any PID under `/proc`
/// whose cmdline matches `identity_substr` and `state_dir_substr`, except
/// `keep_pid` (the process that owns the current PID file). Best-effort;
/// individual read/signal failures are swallowed since `/proc` entries can
/// disappear mid-scan.
pub fn reap_orphans(identity_substr: &str, state_dir_substr: &str, keep_pid: i32) {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        if pid == keep_pid {
            continue;
        }
        let Some(cmdline) = read_cmdline(pid) else {
            continue;
        };
        if cmdline.contains(identity_substr) && cmdline.contains(state_dir_substr) {
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
    }
}
