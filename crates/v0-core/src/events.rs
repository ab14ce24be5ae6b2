//! Plain-text, size-rotated event log.
//!
//! Each operation gets one `events.log` of `[ts] kind: detail` lines.
//! When the file grows past a configured byte threshold, it is rotated:
//! `events.log` -> `events.log.1` -> `events.log.2` ... up to a configured
//! retention count, with the oldest copy dropped.

use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("io error on {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> EventLogError {
    EventLogError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Append one `[ts] kind: detail` line to `dir/events.log`, rotating first
/// if the file is already at or over `max_bytes`.
pub fn emit_event(
    dir: &Path,
    kind: &str,
    detail: &str,
    max_bytes: u64,
    rotate_keep: u32,
) -> Result<(), EventLogError> {
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let log_path = dir.join("events.log");

    if let Ok(meta) = std::fs::metadata(&log_path) {
        if meta.len() >= max_bytes {
            rotate(dir, rotate_keep)?;
        }
    }

    let ts = Utc::now().to_rfc3339();
    let line = format!("[{ts}] {kind}: {detail}\n");

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| io_err(&log_path, e))?;
    file.write_all(line.as_bytes())
        .map_err(|e| io_err(&log_path, e))?;
    Ok(())
}

/// Shift `events.log.N` -> `events.log.N+1` (dropping anything beyond
/// `rotate_keep`), then `events.log` -> `events.log.1`.
fn rotate(dir: &Path, rotate_keep: u32) -> Result<(), EventLogError> {
    if rotate_keep == 0 {
        let log_path = dir.join("events.log");
        std::fs::remove_file(&log_path).map_err(|e| io_err(&log_path, e))?;
        return Ok(());
    }

    // Drop the oldest if it would overflow retention.
    let oldest = dir.join(format!("events.log.{rotate_keep}"));
    if oldest.exists() {
        std::fs::remove_file(&oldest).map_err(|e| io_err(&oldest, e))?;
    }

    let mut n = rotate_keep;
    while n > 1 {
        let from = dir.join(format!("events.log.{}", n - 1));
        let to = dir.join(format!("events.log.{n}"));
        if from.exists() {
            std::fs::rename(&from, &to).map_err(|e| io_err(&from, e))?;
        }
        n -= 1;
    }

    let log_path = dir.join("events.log");
    let first_rotated = dir.join("events.log.1");
    std::fs::rename(&log_path, &first_rotated).map_err(|e| io_err(&log_path, e))?;
    Ok(())
}

/// Read all lines currently in `events.log` (not rotated copies), for
/// tests and diagnostics.
pub fn read_current(dir: &Path) -> std::io::Result<Vec<String>> {
    let log_path = dir.join("events.log");
    if !log_path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(log_path)?;
    Ok(content.lines().map(str::to_string).collect())
}
