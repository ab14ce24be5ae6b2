//! Crash-safe file writes shared by the state store, merge queue, and
//! event log: write to a temp file in the target directory, then rename
//! over the destination so readers never observe a partially written
//! file.

use std::io::Write;
use std::path::Path;

/// Write `bytes` to `dir/final_name` atomically.
///
/// The temp file is created in `dir` (not a system temp directory) so the
/// final rename is guaranteed to be same-filesystem and therefore atomic.
pub fn atomic_write(dir: &Path, final_name: &str, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let tmp_name = format!(".{final_name}.tmp-{}", std::process::id());
    let tmp_path = dir.join(&tmp_name);
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, dir.join(final_name))
}
