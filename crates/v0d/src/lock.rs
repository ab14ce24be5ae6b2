//! File-lock abstraction for the merge queue's `.queue.lock`.
//!
//! Uses an OS advisory exclusive lock (`fs2::FileExt`) as the primary
//! mechanism. The lock file's contents additionally carry
//! `"<holder> (pid <pid>)"` so a second line of defense - a liveness probe
//! against the recorded PID - can reclaim a lock left behind by a holder
//! that died without the OS ever releasing the advisory lock (observed on
//! some platforms for processes killed via `SIGKILL` mid-syscall).

use fs2::FileExt;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("io error acquiring lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("lock {path} held by another process after {retries} retries")]
    TimedOut { path: PathBuf, retries: u32 },
}

fn io_err(path: &Path, source: std::io::Error) -> LockError {
    LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A held file lock. Releases on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: File,
}

impl FileLock {
    /// Acquire the lock at `path`, retrying with exponential back-off up
    /// to `max_retries` times. `holder` is a human-readable label (e.g.
    /// the daemon's process name) recorded alongside the PID.
    pub fn acquire(path: &Path, holder: &str, max_retries: u32) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        reclaim_if_stale(path);

        let mut attempt = 0u32;
        loop {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(path)
                .map_err(|e| io_err(path, e))?;

            match file.try_lock_exclusive() {
                Ok(()) => {
                    let mut file = file;
                    file.set_len(0).map_err(|e| io_err(path, e))?;
                    let contents = format!("{holder} (pid {})", std::process::id());
                    file.write_all(contents.as_bytes())
                        .map_err(|e| io_err(path, e))?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                        file,
                    });
                }
                Err(_) if attempt >= max_retries => {
                    return Err(LockError::TimedOut {
                        path: path.to_path_buf(),
                        retries: max_retries,
                    })
                }
                Err(_) => {
                    reclaim_if_stale(path);
                    let backoff = Duration::from_millis(50 * 2u64.pow(attempt.min(10)));
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Parse `"<holder> (pid <pid>)"` out of a lock file's contents.
fn parse_holder_pid(contents: &str) -> Option<i32> {
    let open = contents.rfind("(pid ")?;
    let close = contents[open..].find(')')?;
    contents[open + 5..open + close].trim().parse().ok()
}

fn pid_is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// If the lock file exists and names a PID that is no longer alive,
/// delete it so a subsequent acquire starts clean.
fn reclaim_if_stale(path: &Path) {
    let Ok(mut file) = File::open(path) else {
        return;
    };
    let mut contents = String::new();
    if file.read_to_string(&mut contents).is_err() {
        return;
    }
    if let Some(pid) = parse_holder_pid(&contents) {
        if !pid_is_alive(pid) {
            let _ = std::fs::remove_file(path);
        }
    }
}
