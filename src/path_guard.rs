//! Path validation and tag sanitization.
//!
//! Every caller-supplied lock path passes through here before any
//! filesystem call, and every caller-supplied tag is sanitized before it
//! reaches the line-oriented lock format or the registry.

use std::env;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::LockError;

/// Maximum tag length in characters after control stripping.
pub const MAX_TAG_LEN: usize = 256;

/// Symlink chains longer than this are treated as unresolvable.
const MAX_SYMLINK_HOPS: u32 = 16;

/// Validates and resolves a caller-supplied lock path.
///
/// Rejects paths whose textual or resolved form contains a `..` segment
/// or a NUL byte, then resolves to an absolute path with symlinks
/// followed (including symlinks whose target does not exist yet).
pub fn resolve_lock_path(path: &Path) -> Result<PathBuf, LockError> {
    reject_dangerous(path)?;

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()
            .map_err(|source| LockError::Read {
                path: path.to_path_buf(),
                source,
            })?
            .join(path)
    };

    let resolved =
        resolve_symlinks(&absolute, MAX_SYMLINK_HOPS).map_err(|source| LockError::Read {
            path: absolute.clone(),
            source,
        })?;

    reject_dangerous(&resolved)?;
    Ok(resolved)
}

/// Rejects `..` segments and NUL bytes.
fn reject_dangerous(path: &Path) -> Result<(), LockError> {
    let traversal = path
        .components()
        .any(|c| matches!(c, Component::ParentDir));
    if traversal || path.to_string_lossy().contains('\0') {
        return Err(LockError::PathTraversal {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Resolves symlinks along `path`, tolerating a non-existent final target.
///
/// `canonicalize` alone fails on paths that do not exist yet, which is
/// the normal case for a lock about to be created. A dangling symlink at
/// the final component is chased manually; otherwise the deepest existing
/// ancestor is canonicalized and the remainder re-attached lexically.
fn resolve_symlinks(path: &Path, hops_left: u32) -> io::Result<PathBuf> {
    match path.canonicalize() {
        Ok(resolved) => Ok(resolved),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if hops_left == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "too many levels of symbolic links",
                ));
            }
            if let Ok(link) = fs::read_link(path) {
                let target = if link.is_absolute() {
                    link
                } else {
                    match path.parent() {
                        Some(parent) => parent.join(link),
                        None => link,
                    }
                };
                return resolve_symlinks(&target, hops_left - 1);
            }
            let file_name = match path.file_name() {
                Some(name) => name,
                None => return Ok(normalize_lexically(path)),
            };
            match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => {
                    let parent = match parent.canonicalize() {
                        Ok(p) => p,
                        Err(pe) if pe.kind() == io::ErrorKind::NotFound => {
                            normalize_lexically(parent)
                        }
                        Err(pe) => return Err(pe),
                    };
                    Ok(parent.join(file_name))
                }
                _ => Ok(normalize_lexically(path)),
            }
        }
        Err(e) => Err(e),
    }
}

/// Drops `.` components; `..` never reaches here (rejected earlier).
fn normalize_lexically(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Sanitizes a holder-supplied tag for storage.
///
/// Strips all control characters (U+0000..=U+001F and U+007F), truncates
/// to [`MAX_TAG_LEN`] characters, and treats an empty result as no tag.
/// Stripping rather than replacing keeps the lock file format closed
/// under sanitization: no newline or carriage return can reach it.
pub fn sanitize_tag(tag: &str) -> Option<String> {
    let cleaned: String = tag
        .chars()
        .filter(|c| !matches!(c, '\u{0}'..='\u{1f}' | '\u{7f}'))
        .take(MAX_TAG_LEN)
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}
