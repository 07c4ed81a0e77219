//! In-memory queue view with optimistic-concurrency persistence.

use crate::error::{ApiError, StorageError};
use crate::mailbox::QueueDocument;
use crate::store::{AtomicFileStore, DocumentKind};
use chrono::Utc;
use tracing::{debug, info, warn};

/// The last queue document this peer read or wrote, and its version.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    doc: QueueDocument,
    last_seen: u64,
}

impl QueueSnapshot {
    /// Read the queue, creating it when missing and falling back to the
    /// `.bak` sibling when it does not parse.
    pub fn load(store: &AtomicFileStore) -> Result<Self, ApiError> {
        let doc = match store.read_document::<QueueDocument>() {
            Ok(doc) => doc,
            Err(StorageError::FileNotFound(_)) => {
                let mut doc = QueueDocument::new(Utc::now());
                match store.write_versioned(&mut doc, 0) {
                    Ok(_) => {
                        info!("Created empty queue document");
                        doc
                    }
                    // The other peer created it first.
                    Err(StorageError::VersionConflict { .. }) => store.read_document()?,
                    Err(e) => return Err(e.into()),
                }
            }
            Err(parse @ StorageError::JsonParse { .. }) => recover(store, parse, 0)?,
            Err(e) => return Err(e.into()),
        };
        let last_seen = doc.version;
        Ok(Self { doc, last_seen })
    }

    pub fn document(&self) -> &QueueDocument {
        &self.doc
    }

    pub fn last_seen_version(&self) -> u64 {
        self.last_seen
    }

    /// Re-read the queue. A version older than the last one seen is stale;
    /// it is re-read once before failing.
    pub fn refresh(&mut self, store: &AtomicFileStore) -> Result<(), ApiError> {
        let mut doc = match store.read_document::<QueueDocument>() {
            Ok(doc) => doc,
            Err(parse @ StorageError::JsonParse { .. }) => recover(store, parse, self.last_seen)?,
            Err(e) => return Err(e.into()),
        };
        if doc.version < self.last_seen {
            debug!(
                read = doc.version,
                last_seen = self.last_seen,
                "Stale queue read, re-reading"
            );
            doc = store.read_document()?;
            if doc.version < self.last_seen {
                return Err(StorageError::StaleVersion {
                    read: doc.version,
                    last_seen: self.last_seen,
                }
                .into());
            }
        }
        self.last_seen = doc.version;
        self.doc = doc;
        Ok(())
    }

    /// Apply `mutate` to a copy of the queue and persist it.
    ///
    /// When the other peer advanced the queue in between, the copy is
    /// discarded, the queue re-read and `mutate` applied again, up to
    /// `max_attempts` times. A mutation that changes nothing is not written.
    pub fn commit<T>(
        &mut self,
        store: &AtomicFileStore,
        max_attempts: u32,
        mut mutate: impl FnMut(&mut QueueDocument) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let max_attempts = max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let mut draft = self.doc.clone();
            let value = mutate(&mut draft)?;
            if draft == self.doc {
                return Ok(value);
            }

            draft.last_modified = Utc::now();
            match store.write_versioned(&mut draft, self.last_seen) {
                Ok(version) => {
                    debug!(version, attempt, "Committed queue");
                    self.last_seen = version;
                    self.doc = draft;
                    return Ok(value);
                }
                Err(StorageError::VersionConflict { expected, found }) => {
                    debug!(attempt, expected, found, "Queue advanced by peer, re-applying");
                    self.refresh(store)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(attempts = max_attempts, "Gave up committing queue after repeated conflicts");
        Err(ApiError::ConcurrentUpdate {
            attempts: max_attempts,
        })
    }
}

/// Restore the queue from its backup, stamped past `last_known`.
fn recover(
    store: &AtomicFileStore,
    parse: StorageError,
    last_known: u64,
) -> Result<QueueDocument, ApiError> {
    warn!(error = %parse, "Queue document is corrupt, restoring from backup");
    match store.restore_after(DocumentKind::Queue, last_known) {
        Ok(_) => Ok(store.read_document()?),
        Err(restore) => {
            warn!(error = %restore, "No usable queue backup");
            Err(parse.into())
        }
    }
}
