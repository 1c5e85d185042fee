//! Atomic file replacement.
//!
//! Bytes go to a named temp file beside the destination, are flushed and
//! synced, then renamed over it. Readers see the old file or the new one,
//! never a partial write. Temp names share a recognisable prefix so files
//! stranded by a crash can be swept later.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::Builder;
use tracing::{debug, warn};

const TEMP_SUFFIX: &str = ".tmp";

fn parent_dir_or_dot(path: &Path) -> &Path {
    // `Path::parent` is `Some("")` for a bare file name.
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn temp_prefix(dest: &Path) -> String {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(".{name}.")
}

/// Replace `dest` with `bytes`.
///
/// On any error before the rename the destination is untouched and the temp
/// file is removed.
pub fn write_bytes(dest: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = parent_dir_or_dot(dest);
    fs::create_dir_all(dir)?;

    let mut tmp = Builder::new()
        .prefix(&temp_prefix(dest))
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file_mut().flush()?;
    tmp.as_file().sync_all()?;

    tmp.persist(dest).map_err(|e| e.error)?;

    // Best-effort: the file is already in place.
    let _ = sync_parent_dir(dest);
    Ok(())
}

/// Remove temp files left beside `dest` by interrupted writes.
///
/// Failures are logged and skipped. Returns the number removed.
pub fn sweep_orphans(dest: &Path) -> usize {
    let dir = parent_dir_or_dot(dest);
    let prefix = temp_prefix(dest);
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), "skipping orphan sweep: {e}");
            return 0;
        }
    };

    let orphans: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(TEMP_SUFFIX))
        })
        .collect();

    let mut removed = 0;
    for path in orphans {
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), "failed to remove orphaned temp file: {e}"),
        }
    }
    if removed > 0 {
        debug!(removed, dest = %dest.display(), "swept orphaned temp files");
    }
    removed
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    fs::File::open(parent_dir_or_dot(path))?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("book.json");
        fs::write(&dest, b"old").unwrap();

        write_bytes(&dest, b"new").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_creates_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested/deeper/book.json");
        write_bytes(&dest, b"{}").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"{}");
    }

    #[test]
    fn test_sweep_only_touches_own_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("book.json");
        fs::write(&dest, b"{}").unwrap();
        fs::write(dir.path().join(".book.json.a1b2c3.tmp"), b"partial").unwrap();
        fs::write(dir.path().join(".other.json.x.tmp"), b"keep").unwrap();
        fs::write(dir.path().join("notes.tmp"), b"keep").unwrap();

        assert_eq!(sweep_orphans(&dest), 1);
        assert!(dest.exists());
        assert!(dir.path().join(".other.json.x.tmp").exists());
        assert!(dir.path().join("notes.tmp").exists());
        assert_eq!(sweep_orphans(&dest), 0);
    }
}
