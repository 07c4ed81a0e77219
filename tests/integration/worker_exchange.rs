//! Integration tests for the worker side of the mailbox

use super::test_utils::{fast_config, open_coordinator, set_current, ScriptedExecutor};
use opsync::coordinator::QueueCoordinator;
use opsync::error::ApiError;
use opsync::operation::{Operation, OperationKind, OperationParams, OperationStatus, Origin};
use opsync::store::DocumentKind;
use opsync::worker::{ExecutionFailure, ExecutionOutput, OperationExecutor, PollOutcome, Worker};
use std::fs;
use tempfile::TempDir;

/// Cancels the operation from the client side while "executing" it.
struct CancelledMidway {
    client: QueueCoordinator,
}

impl OperationExecutor for CancelledMidway {
    fn execute(&mut self, op: &Operation) -> Result<ExecutionOutput, ExecutionFailure> {
        self.client
            .cancel(&op.id, Some("user changed their mind"))
            .map_err(|e| ExecutionFailure::permanent("TEST", e.to_string()))?;
        Ok(ExecutionOutput::new("too late"))
    }
}

/// Only runs sync-status operations.
struct SyncOnly;

impl OperationExecutor for SyncOnly {
    fn handles(&self, kind: OperationKind) -> bool {
        kind == OperationKind::SyncStatus
    }

    fn execute(&mut self, _op: &Operation) -> Result<ExecutionOutput, ExecutionFailure> {
        Ok(ExecutionOutput::new("synced"))
    }
}

/// Fails through `anyhow`, as executors built on it do.
struct Flaky;

impl OperationExecutor for Flaky {
    fn execute(&mut self, op: &Operation) -> Result<ExecutionOutput, ExecutionFailure> {
        let reason: anyhow::Result<()> = Err(anyhow::anyhow!("spec folder is locked"));
        reason.map_err(|e| e.context(format!("applying {}", op.id)))?;
        Ok(ExecutionOutput::new("unreachable"))
    }
}

#[test]
fn test_result_of_cancelled_operation_is_dropped() {
    let temp_dir = TempDir::new().unwrap();
    let client = open_coordinator(&temp_dir, &fast_config(Origin::Client));
    let mut worker = Worker::new(
        open_coordinator(&temp_dir, &fast_config(Origin::Worker)),
        CancelledMidway { client },
    );
    let id = worker
        .coordinator_mut()
        .enqueue(set_current("spec-a"))
        .unwrap()
        .operation_id;

    assert_eq!(
        worker.poll_once().unwrap(),
        PollOutcome::Discarded {
            operation_id: id.clone()
        }
    );
    let op = worker.coordinator().get_operation(&id).unwrap();
    assert_eq!(op.status, OperationStatus::Cancelled);
    assert_eq!(op.error.as_deref(), Some("user changed their mind"));
    assert!(worker.coordinator().get_results().unwrap().results.is_empty());
}

#[test]
fn test_results_document_records_outcome() {
    let temp_dir = TempDir::new().unwrap();
    let mut worker = Worker::new(
        open_coordinator(&temp_dir, &fast_config(Origin::Worker)),
        ScriptedExecutor::succeeding(),
    );
    let id = worker
        .coordinator_mut()
        .enqueue(set_current("spec-a"))
        .unwrap()
        .operation_id;
    worker.poll_once().unwrap();

    let results = worker.coordinator().get_results().unwrap();
    let result = results.latest_for(&id).unwrap();
    assert!(result.success);
    assert!(!result.retryable);
    assert_eq!(result.message, "set-current-spec applied");
    assert!(result.error.is_none());

    let op = worker.coordinator().get_operation(&id).unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.result.as_ref().unwrap()["operationId"], id.as_str());
    assert!(op.completed_at.is_some());
    assert_eq!(worker.coordinator().get_queue().processing_stats.total_processed, 1);
}

#[test]
fn test_executor_only_claims_kinds_it_handles() {
    let temp_dir = TempDir::new().unwrap();
    let mut worker = Worker::new(
        open_coordinator(&temp_dir, &fast_config(Origin::Worker)),
        SyncOnly,
    );
    let skipped = worker
        .coordinator_mut()
        .enqueue(set_current("spec-a"))
        .unwrap()
        .operation_id;
    let sync = worker
        .coordinator_mut()
        .enqueue(Operation::new(OperationParams::SyncStatus {}, Origin::Client))
        .unwrap()
        .operation_id;

    assert_eq!(
        worker.poll_once().unwrap(),
        PollOutcome::Completed { operation_id: sync }
    );
    assert_eq!(worker.poll_once().unwrap(), PollOutcome::Idle);
    assert_eq!(
        worker.coordinator().get_operation(&skipped).unwrap().status,
        OperationStatus::Pending
    );
}

#[test]
fn test_anyhow_failure_is_retryable_and_verbatim() {
    let temp_dir = TempDir::new().unwrap();
    let mut worker = Worker::new(
        open_coordinator(&temp_dir, &fast_config(Origin::Worker)),
        Flaky,
    );
    let id = worker
        .coordinator_mut()
        .enqueue(set_current("spec-a"))
        .unwrap()
        .operation_id;

    let outcome = worker.poll_once().unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Failed {
            operation_id: id.clone(),
            retryable: true
        }
    );
    let result = worker
        .coordinator()
        .get_results()
        .unwrap()
        .latest_for(&id)
        .cloned()
        .unwrap();
    let error = result.error.unwrap();
    assert_eq!(error.code, "EXECUTION_ERROR");
    assert_eq!(
        error.message,
        format!("applying {}: spec folder is locked", id)
    );
    let op = worker.coordinator().get_operation(&id).unwrap();
    assert_eq!(op.error.as_deref(), Some(error.message.as_str()));
    assert!(op.next_retry_at.is_some());
}

#[test]
fn test_client_sees_worker_results_after_refresh() {
    let temp_dir = TempDir::new().unwrap();
    let mut client = open_coordinator(&temp_dir, &fast_config(Origin::Client));
    let mut worker = Worker::new(
        open_coordinator(&temp_dir, &fast_config(Origin::Worker)),
        ScriptedExecutor::succeeding(),
    );

    let id = client.enqueue(set_current("spec-a")).unwrap().operation_id;
    assert_eq!(
        worker.poll_once().unwrap(),
        PollOutcome::Completed {
            operation_id: id.clone()
        }
    );

    client.refresh().unwrap();
    assert_eq!(
        client.get_operation(&id).unwrap().status,
        OperationStatus::Completed
    );
    // Replaying the same results is a no-op.
    let replay = client.reconcile_results().unwrap();
    assert!(replay.completed.is_empty());
}

#[tokio::test]
async fn test_worker_loop_drains_queue_until_shutdown() {
    let temp_dir = TempDir::new().unwrap();
    let mut worker = Worker::new(
        open_coordinator(&temp_dir, &fast_config(Origin::Worker)),
        ScriptedExecutor::succeeding(),
    );
    let first = worker
        .coordinator_mut()
        .enqueue(set_current("spec-a"))
        .unwrap()
        .operation_id;
    let second = worker
        .coordinator_mut()
        .enqueue(Operation::new(OperationParams::SyncStatus {}, Origin::Client))
        .unwrap()
        .operation_id;

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let _ = tx.send(());
    });
    worker
        .run(async {
            let _ = rx.await;
        })
        .await
        .unwrap();
    stopper.await.unwrap();

    for id in [&first, &second] {
        assert_eq!(
            worker.coordinator().get_operation(id).unwrap().status,
            OperationStatus::Completed
        );
    }
    assert!(worker.coordinator().get_sync_state().unwrap().worker_online);
}

#[test]
fn test_corrupt_results_restored_before_append() {
    let temp_dir = TempDir::new().unwrap();
    let mut worker = Worker::new(
        open_coordinator(&temp_dir, &fast_config(Origin::Worker)),
        ScriptedExecutor::succeeding(),
    );
    let mut ids = Vec::new();
    for spec in ["spec-a", "spec-b", "spec-c"] {
        ids.push(
            worker
                .coordinator_mut()
                .enqueue(set_current(spec))
                .unwrap()
                .operation_id,
        );
    }
    worker.poll_once().unwrap();
    worker.poll_once().unwrap();

    let path = worker
        .coordinator()
        .store()
        .document_path(DocumentKind::Results)
        .unwrap();
    fs::write(&path, "{\"results\": [").unwrap();

    assert_eq!(
        worker.poll_once().unwrap(),
        PollOutcome::Completed {
            operation_id: ids[2].clone()
        }
    );
    // The backup predates the second result; the first survives.
    let results = worker.coordinator().get_results().unwrap();
    assert!(results.latest_for(&ids[0]).is_some());
    assert!(results.latest_for(&ids[2]).is_some());
    assert!(results.version >= 3);
}

#[test]
fn test_corrupt_results_without_backup_fail_the_poll() {
    let temp_dir = TempDir::new().unwrap();
    let mut worker = Worker::new(
        open_coordinator(&temp_dir, &fast_config(Origin::Worker)),
        ScriptedExecutor::succeeding(),
    );
    worker.coordinator_mut().enqueue(set_current("spec-a")).unwrap();
    let path = worker
        .coordinator()
        .store()
        .document_path(DocumentKind::Results)
        .unwrap();
    fs::write(&path, "").unwrap();

    match worker.poll_once() {
        Err(ApiError::StorageError(e)) => assert_eq!(e.code(), "JSON_PARSE_ERROR"),
        other => panic!("expected a parse error, got {:?}", other),
    }
    assert!(fs::read_to_string(&path).unwrap().is_empty());
}
