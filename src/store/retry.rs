//! Retry-with-backoff for transient filesystem errors.

use crate::error::StorageError;
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

const ENOSPC: i32 = 28;
const EDQUOT: i32 = 122;
const EBUSY: i32 = 16;
const EAGAIN: i32 = 11;

/// Bounded exponential backoff for I/O calls.
#[derive(Debug, Clone)]
pub struct IoRetry {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for IoRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(1000),
        }
    }
}

impl IoRetry {
    /// Delay before attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `f`, retrying transient failures, and classify the final error.
    pub fn run<T>(
        &self,
        path: &Path,
        mut f: impl FnMut() -> io::Result<T>,
    ) -> Result<T, StorageError> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(path = %path.display(), attempt, "I/O succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if is_transient(&e) && attempt < max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        path = %path.display(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient I/O error, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(classify(path, e, attempt)),
            }
        }
    }
}

/// Errors worth retrying: permission races, lock contention, interruptions.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
    ) || matches!(err.raw_os_error(), Some(EBUSY) | Some(EAGAIN))
}

/// Map an `io::Error` to the store's typed taxonomy.
pub fn classify(path: &Path, err: io::Error, attempts: u32) -> StorageError {
    if matches!(err.raw_os_error(), Some(ENOSPC) | Some(EDQUOT)) {
        return StorageError::DiskFull(path.to_path_buf());
    }
    match err.kind() {
        io::ErrorKind::NotFound => StorageError::FileNotFound(path.to_path_buf()),
        io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
            path: path.to_path_buf(),
            attempts,
            source: err,
        },
        _ => StorageError::Io {
            path: path.to_path_buf(),
            attempts,
            source: err,
        },
    }
}
