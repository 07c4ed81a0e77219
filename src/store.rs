//! Atomic File Store
//!
//! Crash-safe persistence of the three mailbox documents. Writes go to a
//! unique temporary sibling, are fsynced, then renamed over the destination,
//! so a reader on the other peer only ever sees the old or the new document.
//! Writers additionally serialize on an advisory `.lock` sibling.

pub mod lock;
pub mod paths;
pub mod retry;

pub use lock::FileLock;
pub use retry::IoRetry;

use crate::error::StorageError;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const TMP_SUFFIX: &str = ".tmp";
const BACKUP_SUFFIX: &str = ".bak";

/// The three canonical mailbox documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Queue,
    SyncState,
    Results,
}

impl DocumentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::Queue => "queue",
            DocumentKind::SyncState => "sync-state",
            DocumentKind::Results => "results",
        }
    }
}

/// A typed document that lives at one of the canonical mailbox paths.
pub trait MailboxDocument: Serialize + DeserializeOwned {
    const KIND: DocumentKind;

    /// Optimistic-concurrency counter, for documents that carry one.
    fn version(&self) -> Option<u64> {
        None
    }

    fn set_version(&mut self, _version: u64) {}
}

/// Storage paths and I/O tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Mailbox directory, relative to the workspace root
    #[serde(default = "default_mailbox_dir")]
    pub mailbox_dir: PathBuf,
    #[serde(default = "default_queue_file")]
    pub queue_file: String,
    #[serde(default = "default_sync_file")]
    pub sync_state_file: String,
    #[serde(default = "default_results_file")]
    pub results_file: String,
    /// Keep the previous content of versioned documents as a `.bak` sibling
    #[serde(default = "default_true")]
    pub keep_backups: bool,
    /// Attempts for transient I/O failures and lock contention
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Temp and lock files older than this are considered orphaned (seconds)
    #[serde(default = "default_orphan_age_secs")]
    pub orphan_age_secs: u64,
}

fn default_mailbox_dir() -> PathBuf {
    PathBuf::from(".opsync")
}

fn default_queue_file() -> String {
    "queue.json".to_string()
}

fn default_sync_file() -> String {
    "sync-state.json".to_string()
}

fn default_results_file() -> String {
    "results.json".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    25
}

fn default_max_delay_ms() -> u64 {
    1000
}

fn default_orphan_age_secs() -> u64 {
    60
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mailbox_dir: default_mailbox_dir(),
            queue_file: default_queue_file(),
            sync_state_file: default_sync_file(),
            results_file: default_results_file(),
            keep_backups: default_true(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            orphan_age_secs: default_orphan_age_secs(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.mailbox_dir.as_os_str().is_empty() {
            return Err("Mailbox directory cannot be empty".to_string());
        }
        for (name, file) in [
            ("queue_file", &self.queue_file),
            ("sync_state_file", &self.sync_state_file),
            ("results_file", &self.results_file),
        ] {
            if file.is_empty() || file.contains('/') || file.contains('\\') {
                return Err(format!("{} must be a plain file name, got '{}'", name, file));
            }
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        Ok(())
    }

    fn io_retry(&self) -> IoRetry {
        IoRetry {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// What `cleanup` removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub temp_files: Vec<PathBuf>,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.temp_files.len()
    }
}

/// Crash-safe JSON document store scoped to one workspace.
pub struct AtomicFileStore {
    root: PathBuf,
    config: StorageConfig,
    retry: IoRetry,
    /// Serializes writers inside this process; the lock file covers the other peer.
    io_guard: Mutex<()>,
}

impl AtomicFileStore {
    /// Open a store rooted at `workspace_root`, creating the mailbox directory.
    pub fn open<P: AsRef<Path>>(workspace_root: P, config: StorageConfig) -> Result<Self, StorageError> {
        let workspace_root = workspace_root.as_ref();
        Self::validate_workspace(workspace_root)?;
        config.validate().map_err(StorageError::InvalidPath)?;

        let root = dunce::canonicalize(workspace_root)
            .map_err(|e| retry::classify(workspace_root, e, 1))?;
        let retry = config.io_retry();
        let store = Self {
            root,
            config,
            retry,
            io_guard: Mutex::new(()),
        };

        let mailbox = store.mailbox_dir()?;
        fs::create_dir_all(&mailbox).map_err(|e| retry::classify(&mailbox, e, 1))?;
        debug!(mailbox = %mailbox.display(), "Opened mailbox store");
        Ok(store)
    }

    /// Fail fast unless `path` is an existing, writable directory.
    pub fn validate_workspace(path: &Path) -> Result<(), StorageError> {
        let invalid = |reason: &str| StorageError::InvalidWorkspace {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        let meta = fs::metadata(path).map_err(|_| invalid("directory does not exist"))?;
        if !meta.is_dir() {
            return Err(invalid("not a directory"));
        }

        let probe = path.join(format!(".opsync-probe-{}-{}", std::process::id(), unique_suffix()));
        match OpenOptions::new().write(true).create_new(true).open(&probe) {
            Ok(file) => {
                drop(file);
                let _ = fs::remove_file(&probe);
                Ok(())
            }
            Err(e) => Err(invalid(&format!("directory is not writable: {}", e))),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Absolute mailbox directory.
    pub fn mailbox_dir(&self) -> Result<PathBuf, StorageError> {
        paths::sanitize(&self.root, &self.config.mailbox_dir)
    }

    /// Absolute path of a canonical document.
    pub fn document_path(&self, kind: DocumentKind) -> Result<PathBuf, StorageError> {
        let file = match kind {
            DocumentKind::Queue => &self.config.queue_file,
            DocumentKind::SyncState => &self.config.sync_state_file,
            DocumentKind::Results => &self.config.results_file,
        };
        paths::sanitize(&self.root, &self.config.mailbox_dir.join(file))
    }

    /// Resolve a caller-supplied path inside the workspace.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf, StorageError> {
        paths::sanitize(&self.root, path)
    }

    pub fn exists(&self, kind: DocumentKind) -> bool {
        self.document_path(kind).map(|p| p.exists()).unwrap_or(false)
    }

    /// Read and parse a canonical document.
    pub fn read_document<D: MailboxDocument>(&self) -> Result<D, StorageError> {
        let path = self.document_path(D::KIND)?;
        self.read_json_file(&path)
    }

    /// Persist a canonical document, bumping its version when it carries one.
    pub fn write_document<D: MailboxDocument>(&self, doc: &mut D) -> Result<(), StorageError> {
        let path = self.document_path(D::KIND)?;
        let _guard = self.io_guard.lock();
        let _lock = FileLock::acquire(&path, &self.retry)?;
        if let Some(version) = doc.version() {
            doc.set_version(version + 1);
        }
        self.write_json_locked(&path, doc, doc.version().is_some())
    }

    /// Persist a versioned document only if nobody advanced it since `expected`.
    ///
    /// The on-disk version is re-read under the lock. Returns the new version.
    pub fn write_versioned<D: MailboxDocument>(
        &self,
        doc: &mut D,
        expected: u64,
    ) -> Result<u64, StorageError> {
        let path = self.document_path(D::KIND)?;
        let _guard = self.io_guard.lock();
        let _lock = FileLock::acquire(&path, &self.retry)?;

        let found = match self.read_json_file::<D>(&path) {
            Ok(current) => current.version().unwrap_or(0),
            Err(StorageError::FileNotFound(_)) => 0,
            Err(e) => return Err(e),
        };
        if found != expected {
            debug!(expected, found, document = D::KIND.as_str(), "Version conflict");
            return Err(StorageError::VersionConflict { expected, found });
        }

        let next = found + 1;
        doc.set_version(next);
        self.write_json_locked(&path, doc, doc.version().is_some())?;
        Ok(next)
    }

    /// Read a document, restoring it from backup when it does not parse.
    ///
    /// `None` when the document does not exist yet. A corrupt document with
    /// no usable backup is reported as the original `JSON_PARSE_ERROR`.
    pub fn read_or_restore<D: MailboxDocument>(&self) -> Result<Option<D>, StorageError> {
        match self.read_document::<D>() {
            Ok(doc) => Ok(Some(doc)),
            Err(StorageError::FileNotFound(_)) => Ok(None),
            Err(parse @ StorageError::JsonParse { .. }) => {
                warn!(document = D::KIND.as_str(), error = %parse, "Document is corrupt, restoring from backup");
                if let Err(restore) = self.restore_after(D::KIND, 0) {
                    warn!(document = D::KIND.as_str(), error = %restore, "No usable backup");
                    return Err(parse);
                }
                self.read_document().map(Some)
            }
            Err(e) => Err(e),
        }
    }

    /// Read-modify-write a versioned document.
    ///
    /// A missing document starts from `fresh()`. When the other peer writes
    /// in between, the document is re-read and `mutate` applied again, up to
    /// `max_attempts` times. Returns the document as persisted.
    pub fn update_versioned<D: MailboxDocument>(
        &self,
        max_attempts: u32,
        fresh: impl Fn() -> D,
        mut mutate: impl FnMut(&mut D),
    ) -> Result<D, StorageError> {
        let mut attempt = 1;
        loop {
            let mut doc = self.read_or_restore::<D>()?.unwrap_or_else(&fresh);
            let expected = doc.version().unwrap_or(0);
            mutate(&mut doc);
            match self.write_versioned(&mut doc, expected) {
                Ok(_) => return Ok(doc),
                Err(StorageError::VersionConflict { .. }) if attempt < max_attempts => {
                    debug!(attempt, document = D::KIND.as_str(), "Document advanced by peer, re-applying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write any JSON value to a sanitized path inside the workspace.
    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StorageError> {
        let path = self.resolve(path)?;
        let _guard = self.io_guard.lock();
        let _lock = FileLock::acquire(&path, &self.retry)?;
        self.write_json_locked(&path, value, false)
    }

    /// Read any JSON value from a sanitized path inside the workspace.
    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T, StorageError> {
        let path = self.resolve(path)?;
        self.read_json_file(&path)
    }

    /// Copy a document to its `.bak` sibling (atomically).
    pub fn backup(&self, kind: DocumentKind) -> Result<PathBuf, StorageError> {
        let path = self.document_path(kind)?;
        let backup = with_suffix(&path, BACKUP_SUFFIX);
        let _guard = self.io_guard.lock();
        let _lock = FileLock::acquire(&path, &self.retry)?;
        let bytes = self.retry.run(&path, || fs::read(&path))?;
        self.atomic_write(&backup, &bytes)?;
        info!(document = kind.as_str(), backup = %backup.display(), "Backed up document");
        Ok(backup)
    }

    /// Replace a document with its `.bak` sibling (atomically).
    ///
    /// The backup must parse as JSON; a corrupt backup is never restored.
    pub fn restore(&self, kind: DocumentKind) -> Result<PathBuf, StorageError> {
        self.restore_after(kind, 0)
    }

    /// [`restore`](Self::restore), keeping versions strictly increasing.
    ///
    /// The backup is one write behind the document it replaces, so a
    /// versioned backup is re-stamped past that document and past
    /// `last_known`, the newest version the caller has seen. The corrupt
    /// document is not copied over the backup.
    pub fn restore_after(&self, kind: DocumentKind, last_known: u64) -> Result<PathBuf, StorageError> {
        let path = self.document_path(kind)?;
        let backup = with_suffix(&path, BACKUP_SUFFIX);
        let _guard = self.io_guard.lock();
        let _lock = FileLock::acquire(&path, &self.retry)?;
        let bytes = self.retry.run(&backup, || fs::read(&backup))?;
        let mut value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| StorageError::JsonParse {
                path: backup.clone(),
                message: e.to_string(),
            })?;

        let bytes = match value.get("version").and_then(serde_json::Value::as_u64) {
            Some(version) => {
                let next = version.saturating_add(1).max(last_known).saturating_add(1);
                value["version"] = serde_json::Value::from(next);
                debug!(document = kind.as_str(), from = version, to = next, "Re-stamped restored version");
                serde_json::to_vec_pretty(&value).map_err(|e| StorageError::Serialize(e.to_string()))?
            }
            None => bytes,
        };
        self.atomic_write(&path, &bytes)?;
        warn!(document = kind.as_str(), "Restored document from backup");
        Ok(path)
    }

    /// Remove temp siblings left behind by a crashed writer.
    ///
    /// `.lock` siblings are never removed: a peer may have opened one and not
    /// locked it yet, and deleting it would let two peers lock different
    /// inodes. A crashed holder's advisory lock is released by the OS.
    pub fn cleanup(&self) -> Result<CleanupReport, StorageError> {
        let dir = self.mailbox_dir()?;
        let max_age = Duration::from_secs(self.config.orphan_age_secs);
        let mut report = CleanupReport::default();

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(retry::classify(&dir, e, 1)),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let is_tmp = entry.file_name().to_string_lossy().ends_with(TMP_SUFFIX);
            if !is_tmp || !older_than(&path, max_age) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed orphaned temp file");
                    report.temp_files.push(path);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove orphaned file"),
            }
        }

        if !report.temp_files.is_empty() {
            info!(temp_files = report.temp_files.len(), "Cleaned up orphaned mailbox files");
        }
        Ok(report)
    }

    fn read_json_file<T: DeserializeOwned>(&self, path: &Path) -> Result<T, StorageError> {
        let content = self.retry.run(path, || fs::read_to_string(path))?;
        if content.trim().is_empty() {
            return Err(StorageError::JsonParse {
                path: path.to_path_buf(),
                message: "document is empty".to_string(),
            });
        }
        serde_json::from_str(&content).map_err(|e| StorageError::JsonParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    // Caller holds the lock.
    fn write_json_locked<T: Serialize + ?Sized>(
        &self,
        path: &Path,
        value: &T,
        keep_backup: bool,
    ) -> Result<(), StorageError> {
        let bytes =
            serde_json::to_vec_pretty(value).map_err(|e| StorageError::Serialize(e.to_string()))?;
        if keep_backup && self.config.keep_backups && path.exists() {
            let backup = with_suffix(path, BACKUP_SUFFIX);
            match fs::read(path) {
                Ok(previous) => self.atomic_write(&backup, &previous)?,
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping backup of unreadable document"),
            }
        }
        self.atomic_write(path, &bytes)
    }

    /// temp sibling → fsync → rename → fsync directory
    fn atomic_write(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| retry::classify(parent, e, 1))?;
        }

        self.retry.run(path, || {
            let temp_path = temp_sibling(path);
            let result = (|| {
                let mut file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&temp_path)?;
                file.write_all(bytes)?;
                file.sync_all()?;
                drop(file);
                fs::rename(&temp_path, path)
            })();
            if result.is_err() {
                let _ = fs::remove_file(&temp_path);
            }
            result
        })?;

        sync_parent_dir(path);
        debug!(path = %path.display(), bytes = bytes.len(), "Wrote document atomically");
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{}.{}.{}{}",
        name,
        std::process::id(),
        unique_suffix(),
        TMP_SUFFIX
    ))
}

fn unique_suffix() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

fn older_than(path: &Path, age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map_or(false, |elapsed| elapsed >= age)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}
