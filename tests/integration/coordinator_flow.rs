//! Integration tests for the queue coordinator

use super::test_utils::{
    fast_config, open_coordinator, set_current, update_requirements, ScriptedExecutor,
};
use chrono::{Duration, Utc};
use opsync::error::ApiError;
use opsync::mailbox::QueueDocument;
use opsync::operation::{Operation, OperationParams, OperationStatus, Origin, Priority, META_RETRY_OF};
use opsync::store::DocumentKind;
use opsync::worker::{PollOutcome, Worker};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_each_enqueue_persists_one_version() {
    let temp_dir = TempDir::new().unwrap();
    let mut coordinator = open_coordinator(&temp_dir, &fast_config(Origin::Client));
    let start = coordinator.get_queue().version;

    coordinator.enqueue(set_current("spec-a")).unwrap();
    coordinator.enqueue(set_current("spec-b")).unwrap();

    let on_disk: QueueDocument = coordinator.store().read_document().unwrap();
    assert_eq!(on_disk.version, start + 2);
    assert_eq!(on_disk.operations.len(), 2);
    assert_eq!(coordinator.get_queue(), &on_disk);
}

#[test]
fn test_processing_order_priority_then_age() {
    let temp_dir = TempDir::new().unwrap();
    let mut coordinator = open_coordinator(&temp_dir, &fast_config(Origin::Client));
    let now = Utc::now();

    let low = coordinator
        .enqueue(update_requirements("spec-a", "a", now - Duration::seconds(90)).with_priority(Priority::Low))
        .unwrap();
    let old_normal = coordinator
        .enqueue(update_requirements("spec-b", "b", now - Duration::seconds(80)))
        .unwrap();
    let new_normal = coordinator
        .enqueue(update_requirements("spec-c", "c", now))
        .unwrap();
    let urgent = coordinator
        .enqueue(update_requirements("spec-d", "d", now).with_priority(Priority::Urgent))
        .unwrap();

    let order: Vec<String> = coordinator
        .processing_order()
        .into_iter()
        .map(|op| op.id.clone())
        .collect();
    assert_eq!(
        order,
        vec![
            urgent.operation_id,
            old_normal.operation_id,
            new_normal.operation_id,
            low.operation_id
        ]
    );
}

#[test]
fn test_dependencies_gate_eligibility() {
    let temp_dir = TempDir::new().unwrap();
    let config = fast_config(Origin::Client);
    let mut coordinator = open_coordinator(&temp_dir, &config);

    let missing = set_current("spec-a").with_dependencies(vec!["op-never-queued-01".to_string()]);
    assert!(matches!(
        coordinator.enqueue(missing),
        Err(ApiError::Validation(_))
    ));

    let first = coordinator.enqueue(set_current("spec-a")).unwrap().operation_id;
    let second = coordinator
        .enqueue(set_current("spec-b").with_dependencies(vec![first.clone()]))
        .unwrap()
        .operation_id;
    let eligible: Vec<&str> = coordinator
        .processing_order()
        .iter()
        .map(|op| op.id.as_str())
        .collect();
    assert_eq!(eligible, vec![first.as_str()]);

    let mut worker = Worker::new(coordinator, ScriptedExecutor::succeeding());
    assert_eq!(
        worker.poll_once().unwrap(),
        PollOutcome::Completed {
            operation_id: first.clone()
        }
    );
    assert_eq!(
        worker.poll_once().unwrap(),
        PollOutcome::Completed {
            operation_id: second.clone()
        }
    );
    assert_eq!(worker.executor().executed, vec![first, second]);
}

#[test]
fn test_capacity_limit_rejects_new_work() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = fast_config(Origin::Client);
    config.queue.max_live_operations = 2;
    let mut coordinator = open_coordinator(&temp_dir, &config);

    coordinator.enqueue(set_current("spec-a")).unwrap();
    let second = coordinator.enqueue(set_current("spec-b")).unwrap();
    assert!(matches!(
        coordinator.enqueue(set_current("spec-c")),
        Err(ApiError::Validation(_))
    ));

    coordinator.cancel(&second.operation_id, Some("make room")).unwrap();
    coordinator.enqueue(set_current("spec-c")).unwrap();
}

#[test]
fn test_retry_of_completed_operation_clones_it() {
    let temp_dir = TempDir::new().unwrap();
    let coordinator = open_coordinator(&temp_dir, &fast_config(Origin::Client));
    let mut worker = Worker::new(coordinator, ScriptedExecutor::succeeding());

    let id = worker
        .coordinator_mut()
        .enqueue(set_current("spec-a"))
        .unwrap()
        .operation_id;
    worker.poll_once().unwrap();

    let retry_id = worker.coordinator_mut().retry(&id).unwrap();
    assert_ne!(retry_id, id);
    let clone = worker.coordinator().get_operation(&retry_id).unwrap();
    assert_eq!(clone.status, OperationStatus::Pending);
    assert_eq!(clone.retry_count, 0);
    assert_eq!(clone.metadata.get(META_RETRY_OF), Some(&serde_json::Value::String(id.clone())));
    assert_eq!(
        worker.coordinator().get_operation(&id).unwrap().status,
        OperationStatus::Completed
    );

    let pending_retry = worker.coordinator_mut().retry(&retry_id);
    assert!(matches!(
        pending_retry,
        Err(ApiError::InvalidTransition { .. })
    ));
}

#[test]
fn test_compaction_spares_dependencies() {
    let temp_dir = TempDir::new().unwrap();
    let coordinator = open_coordinator(&temp_dir, &fast_config(Origin::Client));
    let mut worker = Worker::new(coordinator, ScriptedExecutor::succeeding());

    let done = worker
        .coordinator_mut()
        .enqueue(set_current("spec-a"))
        .unwrap()
        .operation_id;
    let needed = worker
        .coordinator_mut()
        .enqueue(set_current("spec-b"))
        .unwrap()
        .operation_id;
    worker.poll_once().unwrap();
    worker.poll_once().unwrap();

    let cancelled = Operation::new(
        OperationParams::SetCurrentSpec {
            spec_id: "spec-c".to_string(),
        },
        Origin::Client,
    )
    .with_dependencies(vec![needed.clone()]);
    let cancelled = worker.coordinator_mut().enqueue(cancelled).unwrap().operation_id;
    let waiting = worker
        .coordinator_mut()
        .enqueue(
            Operation::new(OperationParams::SyncStatus {}, Origin::Client)
                .with_dependencies(vec![needed.clone()]),
        )
        .unwrap()
        .operation_id;
    worker.coordinator_mut().cancel(&cancelled, None).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(5));
    let report = worker.coordinator_mut().compact(0).unwrap();
    let mut expected = vec![done, cancelled];
    expected.sort();
    assert_eq!(report.removed_operations, expected);
    assert!(worker.coordinator().get_operation(&needed).is_some());
    assert!(worker.coordinator().get_operation(&waiting).is_some());
}

#[test]
fn test_tick_publishes_sync_state() {
    let temp_dir = TempDir::new().unwrap();
    let mut coordinator = open_coordinator(&temp_dir, &fast_config(Origin::Worker));
    coordinator.enqueue(set_current("spec-a")).unwrap();

    let report = coordinator.tick().unwrap();
    assert_eq!(report.new_conflicts, 0);

    let state = coordinator.get_sync_state().unwrap();
    assert!(state.worker_online);
    assert!(!state.client_online);
    assert_eq!(state.operation_counts.get(OperationStatus::Pending), 1);
    assert_eq!(state.active_conflicts, 0);
    assert!(state.last_sync.is_some());
}

#[test]
fn test_both_peers_heartbeats_survive_publication() {
    let temp_dir = TempDir::new().unwrap();
    let mut client = open_coordinator(&temp_dir, &fast_config(Origin::Client));
    let mut worker_side = open_coordinator(&temp_dir, &fast_config(Origin::Worker));

    let first = client.publish_sync_state(1).unwrap();
    let second = worker_side.publish_sync_state(2).unwrap();
    assert_eq!(second.version, first.version + 1);
    assert!(second.client_online);
    assert!(second.worker_online);
    assert_eq!(client.get_sync_state().unwrap(), second);
}

#[test]
fn test_corrupt_queue_recovers_from_backup() {
    let temp_dir = TempDir::new().unwrap();
    let config = fast_config(Origin::Client);
    let mut coordinator = open_coordinator(&temp_dir, &config);
    let first = coordinator.enqueue(set_current("spec-a")).unwrap().operation_id;
    coordinator.enqueue(set_current("spec-b")).unwrap();

    let path = coordinator.store().document_path(DocumentKind::Queue).unwrap();
    drop(coordinator);
    fs::write(&path, "{\"operations\": [").unwrap();

    let reopened = open_coordinator(&temp_dir, &config);
    let queue = reopened.get_queue();
    assert_eq!(queue.operations.len(), 1);
    assert_eq!(queue.operations[0].id, first);
}

#[test]
fn test_two_peers_share_the_mailbox() {
    let temp_dir = TempDir::new().unwrap();
    let mut client = open_coordinator(&temp_dir, &fast_config(Origin::Client));
    let mut worker_side = open_coordinator(&temp_dir, &fast_config(Origin::Worker));

    let id = client.enqueue(set_current("spec-a")).unwrap().operation_id;
    let claimed = worker_side.claim_next(|_| true).unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.status, OperationStatus::InProgress);

    // The client's snapshot is stale until it re-reads.
    assert_eq!(
        client.get_operation(&id).unwrap().status,
        OperationStatus::Pending
    );
    client.refresh().unwrap();
    assert_eq!(
        client.get_operation(&id).unwrap().status,
        OperationStatus::InProgress
    );

    // Every write starts from the latest queue, so neither peer loses work.
    let other = worker_side.enqueue(set_current("spec-b")).unwrap().operation_id;
    client.enqueue(set_current("spec-c")).unwrap();
    assert!(client.get_operation(&other).is_some());
    assert_eq!(
        client.get_operation(&id).unwrap().status,
        OperationStatus::InProgress
    );
}

#[tokio::test]
async fn test_run_loop_stops_on_shutdown() {
    let temp_dir = TempDir::new().unwrap();
    let mut coordinator = open_coordinator(&temp_dir, &fast_config(Origin::Client));
    coordinator.enqueue(set_current("spec-a")).unwrap();

    coordinator
        .run(tokio::time::sleep(std::time::Duration::from_millis(60)))
        .await
        .unwrap();

    let state = coordinator.get_sync_state().unwrap();
    assert!(state.client_online);
    assert_eq!(state.operation_counts.get(OperationStatus::Pending), 1);
}
