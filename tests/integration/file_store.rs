//! Integration tests for the atomic file store

use chrono::Utc;
use opsync::error::StorageError;
use opsync::mailbox::{QueueDocument, ResultsDocument};
use opsync::operation::{Operation, OperationParams, Origin};
use opsync::store::{AtomicFileStore, DocumentKind, StorageConfig};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn open(temp_dir: &TempDir) -> AtomicFileStore {
    AtomicFileStore::open(temp_dir.path(), StorageConfig::default()).unwrap()
}

fn queue_with_heartbeat() -> QueueDocument {
    let mut queue = QueueDocument::new(Utc::now());
    queue
        .operations
        .push(Operation::new(OperationParams::Heartbeat {}, Origin::Client));
    queue
}

#[test]
fn test_round_trip_bumps_version_by_one() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(&temp_dir);

    let mut queue = queue_with_heartbeat();
    store.write_document(&mut queue).unwrap();
    assert_eq!(queue.version, 1);

    let read: QueueDocument = store.read_document().unwrap();
    assert_eq!(read, queue);

    let mut again = read.clone();
    store.write_document(&mut again).unwrap();
    let reread: QueueDocument = store.read_document().unwrap();
    assert_eq!(reread.version, read.version + 1);
    assert_eq!(reread.operations, read.operations);
}

#[test]
fn test_versioned_write_rejects_stale_writer() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(&temp_dir);

    let mut first = QueueDocument::new(Utc::now());
    assert_eq!(store.write_versioned(&mut first, 0).unwrap(), 1);

    let mut stale = queue_with_heartbeat();
    match store.write_versioned(&mut stale, 0) {
        Err(StorageError::VersionConflict { expected, found }) => {
            assert_eq!(expected, 0);
            assert_eq!(found, 1);
        }
        other => panic!("expected version conflict, got {:?}", other),
    }

    let on_disk: QueueDocument = store.read_document().unwrap();
    assert!(on_disk.operations.is_empty());
}

#[test]
fn test_interrupted_write_leaves_prior_content() {
    let temp_dir = TempDir::new().unwrap();
    let config = StorageConfig {
        orphan_age_secs: 0,
        ..StorageConfig::default()
    };
    let store = AtomicFileStore::open(temp_dir.path(), config).unwrap();

    let mut queue = queue_with_heartbeat();
    store.write_document(&mut queue).unwrap();

    // A writer that died after writing half of its temp file, before the rename.
    let mailbox = store.mailbox_dir().unwrap();
    let orphan = mailbox.join(".queue.json.99999.crashed.tmp");
    fs::write(&orphan, b"{\"operations\": [").unwrap();

    let read: QueueDocument = store.read_document().unwrap();
    assert_eq!(read, queue);

    std::thread::sleep(std::time::Duration::from_millis(20));
    let report = store.cleanup().unwrap();
    assert_eq!(report.temp_files, vec![orphan.clone()]);
    assert!(!orphan.exists());
    assert_eq!(store.read_document::<QueueDocument>().unwrap(), queue);
}

#[test]
fn test_backup_holds_previous_queue() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(&temp_dir);

    let mut queue = QueueDocument::new(Utc::now());
    store.write_document(&mut queue).unwrap();
    let mut next = queue_with_heartbeat();
    next.version = queue.version;
    store.write_document(&mut next).unwrap();

    let path = store.document_path(DocumentKind::Queue).unwrap();
    fs::write(&path, "not json").unwrap();
    assert!(matches!(
        store.read_document::<QueueDocument>(),
        Err(StorageError::JsonParse { .. })
    ));

    store.restore(DocumentKind::Queue).unwrap();
    let restored: QueueDocument = store.read_document().unwrap();
    // Backup content, stamped past the version-2 document it replaced.
    assert_eq!(restored.version, 3);
    assert!(restored.operations.is_empty());
}

#[test]
fn test_missing_and_empty_documents() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(&temp_dir);

    assert!(!store.exists(DocumentKind::Results));
    match store.read_document::<ResultsDocument>() {
        Err(err @ StorageError::FileNotFound(_)) => assert_eq!(err.code(), "FILE_NOT_FOUND"),
        other => panic!("expected not found, got {:?}", other),
    }

    let path = store.document_path(DocumentKind::Results).unwrap();
    fs::write(&path, "  \n").unwrap();
    assert!(matches!(
        store.read_document::<ResultsDocument>(),
        Err(StorageError::JsonParse { .. })
    ));
}

#[test]
fn test_paths_stay_inside_workspace() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(&temp_dir);

    let resolved = store.resolve(Path::new("../../etc/passwd")).unwrap();
    assert!(resolved.starts_with(store.root()));

    let outside = TempDir::new().unwrap();
    let escaped = store.write_json(&outside.path().join("x.json"), &serde_json::json!({}));
    assert!(matches!(escaped, Err(StorageError::InvalidPath(_))));

    store
        .write_json(Path::new("notes/extra.json"), &serde_json::json!({"ok": true}))
        .unwrap();
    let value: serde_json::Value = store.read_json(Path::new("notes/extra.json")).unwrap();
    assert_eq!(value["ok"], true);
}

#[test]
fn test_open_rejects_missing_workspace() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope");
    match AtomicFileStore::open(&missing, StorageConfig::default()) {
        Err(err @ StorageError::InvalidWorkspace { .. }) => {
            assert!(!err.is_recoverable());
        }
        other => panic!("expected invalid workspace, got {:?}", other.map(|_| ())),
    }
}
