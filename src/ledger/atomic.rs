//! Replace-by-rename file writes.
//!
//! The destination path is only ever observed holding the old content or the
//! complete new content.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Write `bytes` to `path` atomically.
///
/// The content goes to a temporary file in the same directory, is flushed to
/// disk, and is then renamed over `path`. If any step fails the temporary
/// file is removed and `path` is left untouched.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".ledger-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    // A failed persist hands the temp file back; dropping it unlinks it.
    tmp.persist(path).map_err(|e| e.error)?;

    sync_dir(dir);
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        if let Err(e) = handle.sync_all() {
            tracing::debug!(dir = %dir.display(), error = %e, "directory fsync failed");
        }
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
