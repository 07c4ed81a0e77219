//! Path sanitization for mailbox documents.
//!
//! Every path handed to the store resolves inside the workspace root.
//! Relative paths have `.` and `..` segments stripped; absolute paths are
//! accepted only when they already point inside the root.

use crate::error::StorageError;
use std::path::{Component, Path, PathBuf};

/// Resolve `requested` against `root`, refusing anything that escapes it.
pub fn sanitize(root: &Path, requested: &Path) -> Result<PathBuf, StorageError> {
    let raw = requested.to_string_lossy();
    if raw.contains('\0') {
        return Err(StorageError::InvalidPath(format!(
            "{} contains a NUL byte",
            raw.replace('\0', "\\0")
        )));
    }

    let relative = if requested.is_absolute() {
        let resolved = lexical_resolve(requested);
        match resolved.strip_prefix(root) {
            Ok(rest) => rest.to_path_buf(),
            Err(_) => {
                return Err(StorageError::InvalidPath(format!(
                    "{} is outside the workspace root {}",
                    requested.display(),
                    root.display()
                )))
            }
        }
    } else {
        requested.to_path_buf()
    };

    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir | Component::ParentDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::InvalidPath(format!(
                    "{} must be relative to the workspace root",
                    requested.display()
                )))
            }
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(StorageError::InvalidPath(format!(
            "{} does not name a file inside the workspace",
            requested.display()
        )));
    }

    Ok(root.join(clean))
}

/// Resolve `.` and `..` without touching the filesystem.
fn lexical_resolve(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
