//! Error types for the opsync mailbox.

use crate::operation::OperationStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Storage-related errors
///
/// Every variant maps to a stable code (see [`StorageError::code`]) that is
/// safe to surface to either peer, plus a list of recovery suggestions.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Document not found: {0:?}")]
    FileNotFound(PathBuf),

    #[error("Failed to parse JSON document {path:?}: {message}")]
    JsonParse { path: PathBuf, message: String },

    #[error("Permission denied for {path:?} after {attempts} attempt(s): {source}")]
    PermissionDenied {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Disk full while writing {0:?}")]
    DiskFull(PathBuf),

    #[error("Storage I/O error on {path:?} after {attempts} attempt(s): {source}")]
    Io {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Lock contention on {path:?} after {attempts} attempt(s)")]
    LockContention { path: PathBuf, attempts: u32 },

    #[error("Queue version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },

    #[error("Stale queue document: read version {read} is older than last seen {last_seen}")]
    StaleVersion { read: u64, last_seen: u64 },

    #[error("Invalid workspace {path:?}: {reason}")]
    InvalidWorkspace { path: PathBuf, reason: String },

    #[error("Failed to serialize document: {0}")]
    Serialize(String),
}

impl StorageError {
    /// Stable, machine-readable classification.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::FileNotFound(_) => "FILE_NOT_FOUND",
            StorageError::JsonParse { .. } => "JSON_PARSE_ERROR",
            StorageError::PermissionDenied { .. } => "PERMISSION_DENIED",
            StorageError::DiskFull(_) => "DISK_FULL",
            StorageError::Io { .. } => "IO_ERROR",
            StorageError::InvalidPath(_) => "INVALID_PATH",
            StorageError::LockContention { .. } => "LOCK_CONTENTION",
            StorageError::VersionConflict { .. } => "VERSION_CONFLICT",
            StorageError::StaleVersion { .. } => "STALE_VERSION",
            StorageError::InvalidWorkspace { .. } => "INVALID_WORKSPACE",
            StorageError::Serialize(_) => "SERIALIZE_ERROR",
        }
    }

    /// Whether the caller may reasonably retry the same call.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            StorageError::InvalidPath(_)
                | StorageError::InvalidWorkspace { .. }
                | StorageError::Serialize(_)
        )
    }

    /// Contention and concurrency errors that usually clear on a re-read.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::LockContention { .. }
                | StorageError::VersionConflict { .. }
                | StorageError::StaleVersion { .. }
                | StorageError::PermissionDenied { .. }
        )
    }

    /// Human-oriented hints attached to each classification.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            StorageError::FileNotFound(_) => vec![
                "Initialize the mailbox by starting either peer once",
                "Check that both peers point at the same workspace root",
            ],
            StorageError::JsonParse { .. } => vec![
                "Restore the document from its .bak sibling",
                "Delete the document to let the coordinator recreate it",
            ],
            StorageError::PermissionDenied { .. } => vec![
                "Check file ownership and permissions of the mailbox directory",
                "Make sure no other tool holds the file open exclusively",
            ],
            StorageError::DiskFull(_) => vec![
                "Free disk space on the workspace volume",
                "Run `opsync compact` to drop aged terminal operations",
            ],
            StorageError::Io { .. } => vec![
                "Retry the command",
                "Run `opsync cleanup` to remove orphaned temporary files",
            ],
            StorageError::InvalidPath(_) => {
                vec!["Use a path relative to the workspace root without `..` segments"]
            }
            StorageError::LockContention { .. } => vec![
                "The other peer is writing; retry shortly",
                "Run `opsync cleanup` if a crashed process left a lock file behind",
            ],
            StorageError::VersionConflict { .. } | StorageError::StaleVersion { .. } => {
                vec!["Re-read the queue and re-apply the change"]
            }
            StorageError::InvalidWorkspace { .. } => vec![
                "Create the workspace directory",
                "Check that the directory is writable by the current user",
            ],
            StorageError::Serialize(_) => vec!["Report this as a bug"],
        }
    }
}

/// Errors surfaced by the coordinator, resolver and CLI.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Operation validation failed: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Duplicate operation id: {0}")]
    DuplicateOperationId(String),

    #[error("Invalid transition for operation {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: OperationStatus,
        to: OperationStatus,
    },

    #[error("Retry rejected for operation {id}: {reason}")]
    RetryRejected { id: String, reason: String },

    #[error("Queue changed concurrently; gave up after {attempts} attempts")]
    ConcurrentUpdate { attempts: u32 },

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<config::ConfigError> for ApiError {
    fn from(err: config::ConfigError) -> Self {
        ApiError::ConfigError(err.to_string())
    }
}
