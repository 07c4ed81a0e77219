//! Property-based tests for versioned persistence

use chrono::Utc;
use opsync::mailbox::QueueDocument;
use opsync::operation::{Operation, OperationParams, Origin};
use opsync::store::{AtomicFileStore, StorageConfig};
use proptest::prelude::*;
use proptest::test_runner::{Config, TestRunner};
use tempfile::TempDir;

/// Every persist raises the version by exactly one and the last write wins intact.
#[test]
fn test_each_write_bumps_version_once() {
    let mut runner = TestRunner::new(Config {
        cases: 32,
        ..Config::default()
    });
    let bodies = proptest::collection::vec("\\PC{0,80}", 1..6);

    runner
        .run(&bodies, |bodies| {
            let temp_dir = TempDir::new().unwrap();
            let store = AtomicFileStore::open(temp_dir.path(), StorageConfig::default()).unwrap();
            let mut queue = QueueDocument::new(Utc::now());

            for (i, body) in bodies.iter().enumerate() {
                queue.operations.push(Operation::new(
                    OperationParams::UpdateDesign {
                        spec_id: "spec-a".to_string(),
                        content: body.clone(),
                        version: Some(i as u64),
                    },
                    Origin::Client,
                ));
                let before = queue.version;
                store.write_document(&mut queue).unwrap();
                prop_assert_eq!(queue.version, before + 1);

                let read: QueueDocument = store.read_document().unwrap();
                prop_assert_eq!(&read, &queue);
            }
            prop_assert_eq!(queue.version, bodies.len() as u64);
            Ok(())
        })
        .unwrap();
}
