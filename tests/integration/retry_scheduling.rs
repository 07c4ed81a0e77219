//! Integration tests for retry eligibility, backoff and exhaustion

use super::test_utils::{fast_config, open_coordinator, set_current, ScriptedExecutor};
use chrono::{Duration, Utc};
use opsync::config::OpsyncConfig;
use opsync::error::ApiError;
use opsync::operation::{OperationStatus, Origin, RetryPolicy};
use opsync::worker::{ExecutionFailure, PollOutcome, Worker};
use std::time::Duration as StdDuration;
use tempfile::TempDir;

fn failing_worker(
    temp_dir: &TempDir,
    config: &OpsyncConfig,
    times: usize,
) -> Worker<ScriptedExecutor> {
    let coordinator = open_coordinator(temp_dir, config);
    Worker::new(
        coordinator,
        ScriptedExecutor::failing(
            times,
            ExecutionFailure::retryable("DISK_BUSY", "disk unavailable"),
        ),
    )
}

#[test]
fn test_three_retries_then_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let mut worker = failing_worker(&temp_dir, &fast_config(Origin::Worker), 10);
    let id = worker
        .coordinator_mut()
        .enqueue(set_current("spec-a").with_max_retries(3))
        .unwrap()
        .operation_id;

    for attempt in 0..3 {
        assert_eq!(
            worker.poll_once().unwrap(),
            PollOutcome::Failed {
                operation_id: id.clone(),
                retryable: true
            }
        );
        let op = worker.coordinator().get_operation(&id).unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.retry_count, attempt);
        assert!(op.next_retry_at.is_some());
        worker.coordinator_mut().retry(&id).unwrap();
    }

    worker.poll_once().unwrap();
    let op = worker.coordinator().get_operation(&id).unwrap();
    assert_eq!(op.retry_count, 3);
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.error.as_deref(), Some("disk unavailable"));
    assert!(op.next_retry_at.is_none());

    match worker.coordinator_mut().retry(&id) {
        Err(ApiError::RetryRejected { id: rejected, .. }) => assert_eq!(rejected, id),
        other => panic!("expected retry rejection, got {:?}", other),
    }
    let op = worker.coordinator().get_operation(&id).unwrap();
    assert!(op.retry_count <= op.max_retries);
    assert_eq!(worker.executor().executed.len(), 4);
}

#[test]
fn test_due_retries_are_promoted() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = fast_config(Origin::Worker);
    config.queue.retry.base_delay_ms = 1;
    config.queue.retry.max_delay_ms = 1;
    config.queue.retry.jitter_ratio = 0.0;
    let mut worker = failing_worker(&temp_dir, &config, 1);
    let id = worker
        .coordinator_mut()
        .enqueue(set_current("spec-a"))
        .unwrap()
        .operation_id;

    worker.poll_once().unwrap();
    std::thread::sleep(StdDuration::from_millis(10));

    let promoted = worker.coordinator_mut().promote_due_retries().unwrap();
    assert_eq!(promoted, vec![id.clone()]);
    let op = worker.coordinator().get_operation(&id).unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(op.retry_count, 1);

    assert_eq!(
        worker.poll_once().unwrap(),
        PollOutcome::Completed { operation_id: id }
    );
}

#[test]
fn test_future_retry_is_not_promoted() {
    let temp_dir = TempDir::new().unwrap();
    let mut worker = failing_worker(&temp_dir, &fast_config(Origin::Worker), 1);
    let id = worker
        .coordinator_mut()
        .enqueue(set_current("spec-a"))
        .unwrap()
        .operation_id;

    worker.poll_once().unwrap();
    assert!(worker.coordinator_mut().promote_due_retries().unwrap().is_empty());
    assert_eq!(worker.poll_once().unwrap(), PollOutcome::Idle);
    assert_eq!(
        worker.coordinator().get_operation(&id).unwrap().status,
        OperationStatus::Failed
    );
}

#[test]
fn test_backoff_doubles_until_capped() {
    let policy = RetryPolicy::default();
    let expected = [1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000];
    for (i, ms) in expected.iter().enumerate() {
        assert_eq!(policy.base_delay(i as u32 + 1), StdDuration::from_millis(*ms));
    }
    for retry in 1..10 {
        let delay = policy.delay(retry);
        let base = policy.base_delay(retry);
        assert!(delay >= base);
        assert!(delay.as_millis() as f64 <= base.as_millis() as f64 * 1.1);
    }
}

#[test]
fn test_old_failures_are_not_retried() {
    let policy = RetryPolicy::default();
    let now = Utc::now();
    let mut op = set_current("spec-a");
    op.status = OperationStatus::Failed;
    assert!(policy.can_retry(&op, now));
    assert!(!policy.can_retry(&op, now + Duration::hours(2)));

    op.next_retry_at = Some(now + Duration::seconds(5));
    assert!(!policy.should_retry(&op, now));
    assert!(policy.should_retry(&op, now + Duration::seconds(5)));
}

#[test]
fn test_retry_past_horizon_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = fast_config(Origin::Worker);
    config.queue.retry.max_age_secs = 0;
    let mut worker = failing_worker(&temp_dir, &config, 1);
    let id = worker
        .coordinator_mut()
        .enqueue(set_current("spec-a"))
        .unwrap()
        .operation_id;

    worker.poll_once().unwrap();
    std::thread::sleep(StdDuration::from_millis(10));

    match worker.coordinator_mut().retry(&id) {
        Err(ApiError::RetryRejected { id: rejected, reason }) => {
            assert_eq!(rejected, id);
            assert!(reason.contains("retry horizon"));
        }
        other => panic!("expected retry rejection, got {:?}", other),
    }
    let op = worker.coordinator().get_operation(&id).unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.retry_count, 0);
}
