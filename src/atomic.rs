//! Atomic file publication.
//!
//! Every on-disk state change goes through this module: the full new
//! contents are written to a temporary sibling file and made visible in
//! a single link or rename step, so no reader ever observes a
//! half-written lock or registry file.
//!
//! Temp files are named `<target>.<pid>.<random>.tmp` with a 64-bit
//! suffix from the OS cryptographic RNG, created with owner-only
//! permissions and `O_EXCL` (the temp path is never followed through a
//! symlink). Orphans matching this pattern are reclaimed by
//! [`remove_stale_temps`].

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;

use crate::error::LockError;

/// Outcome of an exclusive publish attempt.
#[derive(Debug)]
pub enum ExclusivePublish {
    /// The target did not exist; it now holds the new contents.
    Published,
    /// The target already existed; nothing was changed.
    TargetExists,
}

/// Writes `contents` to `target`, replacing any existing file.
///
/// Used for registry writes: the rename has replace-existing semantics,
/// so the previous image stays intact until the new one is complete.
pub fn write_replace(target: &Path, contents: &[u8]) -> Result<(), LockError> {
    let temp = write_temp_sibling(target, contents)?;
    if let Err(source) = fs::rename(&temp, target) {
        let _ = fs::remove_file(&temp);
        return Err(LockError::Write {
            path: target.to_path_buf(),
            source,
        });
    }
    verify_published(target, contents.len() as u64)
}

/// Publishes `contents` at `target` only if `target` does not exist.
///
/// The fully-written temp file is hard-linked into place: the link is a
/// single atomic step that fails with `AlreadyExists` when the target is
/// present, which is what makes lock acquisition race-free. A plain
/// rename cannot express "fail if the target exists".
pub fn write_exclusive(target: &Path, contents: &[u8]) -> Result<ExclusivePublish, LockError> {
    let temp = write_temp_sibling(target, contents)?;
    let linked = fs::hard_link(&temp, target);
    let _ = fs::remove_file(&temp);
    match linked {
        Ok(()) => {
            verify_published(target, contents.len() as u64)?;
            Ok(ExclusivePublish::Published)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Ok(ExclusivePublish::TargetExists)
        }
        Err(source) => Err(LockError::Write {
            path: target.to_path_buf(),
            source,
        }),
    }
}

/// Removes orphaned temp files next to `target` older than `older_than`.
///
/// Only names matching exactly the pattern this writer emits for this
/// target are considered. Returns how many files were removed.
pub fn remove_stale_temps(target: &Path, older_than: Duration) -> Result<usize, LockError> {
    let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(0);
    };
    let Some(target_name) = target.file_name().and_then(|n| n.to_str()) else {
        return Ok(0);
    };

    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(LockError::Read {
                path: parent.to_path_buf(),
                source,
            })
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !is_temp_sibling_name(target_name, name) {
            continue;
        }
        let old_enough = entry
            .metadata()
            .and_then(|m| m.modified())
            .and_then(|mtime| {
                mtime
                    .elapsed()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            })
            .map(|age| age > older_than)
            .unwrap_or(false);
        if old_enough && fs::remove_file(entry.path()).is_ok() {
            debug!(path = %entry.path().display(), "removed orphaned temp file");
            removed += 1;
        }
    }
    Ok(removed)
}

/// `<target name>.<pid digits>.<16 hex>.tmp`
fn is_temp_sibling_name(target_name: &str, candidate: &str) -> bool {
    let Some(rest) = candidate.strip_prefix(target_name) else {
        return false;
    };
    let Some(rest) = rest.strip_prefix('.') else {
        return false;
    };
    let Some(middle) = rest.strip_suffix(".tmp") else {
        return false;
    };
    let Some((pid, random)) = middle.split_once('.') else {
        return false;
    };
    !pid.is_empty()
        && pid.bytes().all(|b| b.is_ascii_digit())
        && random.len() == 16
        && random.bytes().all(|b| b.is_ascii_hexdigit())
}

fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().into_owned());
    let suffix = OsRng.next_u64();
    target.with_file_name(format!("{name}.{}.{suffix:016x}.tmp", process::id()))
}

/// Creates the temp sibling with owner-only permissions and writes the
/// full contents, synced to disk.
fn write_temp_sibling(target: &Path, contents: &[u8]) -> Result<PathBuf, LockError> {
    let temp = temp_sibling(target);

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let write_err = |source| LockError::Write {
        path: temp.clone(),
        source,
    };

    let mut file = options.open(&temp).map_err(write_err)?;
    let result = file
        .write_all(contents)
        .and_then(|()| file.sync_all());
    drop(file);
    if let Err(source) = result {
        let _ = fs::remove_file(&temp);
        return Err(write_err(source));
    }
    Ok(temp)
}

/// Cheap sanity check that the publish step landed: the target must
/// exist with the expected length.
fn verify_published(target: &Path, expected_len: u64) -> Result<(), LockError> {
    let meta = fs::metadata(target).map_err(|source| LockError::Read {
        path: target.to_path_buf(),
        source,
    })?;
    if meta.len() != expected_len {
        return Err(LockError::Write {
            path: target.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                format!(
                    "published file has {} bytes, expected {expected_len}",
                    meta.len()
                ),
            ),
        });
    }
    Ok(())
}
