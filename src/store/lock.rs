//! Advisory `.lock` sibling files shared by both peers.

use crate::error::StorageError;
use crate::store::retry::{classify, IoRetry};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Held exclusive lock; released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Lock path for a document.
    pub fn path_for(document: &Path) -> PathBuf {
        let mut name = document
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        document.with_file_name(name)
    }

    /// Acquire the lock for `document`, backing off while the other peer holds it.
    pub fn acquire(document: &Path, retry: &IoRetry) -> Result<Self, StorageError> {
        let path = Self::path_for(document);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| classify(parent, e, 1))?;
        }
        let file = retry.run(&path, || {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)
        })?;

        let max_attempts = retry.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    let mut lock = Self { file, path };
                    lock.write_owner();
                    return Ok(lock);
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if attempt < max_attempts {
                        debug!(path = %path.display(), attempt, "Lock held by peer, backing off");
                        std::thread::sleep(retry.backoff(attempt));
                    }
                }
                Err(e) => return Err(classify(&path, e, attempt)),
            }
        }

        Err(StorageError::LockContention {
            path,
            attempts: max_attempts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // Owner metadata only aids diagnostics of stale locks.
    fn write_owner(&mut self) {
        let _ = self.file.set_len(0);
        let _ = writeln!(
            self.file,
            "pid={} acquired_at={}",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        );
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
