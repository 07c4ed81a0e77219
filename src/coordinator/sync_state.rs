//! Sync-state recomputation.

use crate::mailbox::{PerformanceMetrics, QueueDocument, SyncError, SyncState};
use crate::operation::{OperationStatus, Origin};
use chrono::{DateTime, Duration, Utc};

/// Window over which throughput is averaged.
const THROUGHPUT_WINDOW_MINUTES: i64 = 5;

/// Per-publication inputs that do not live in the queue.
#[derive(Debug, Clone)]
pub struct SyncInputs<'a> {
    pub peer: Origin,
    pub now: DateTime<Utc>,
    pub heartbeat_timeout: Duration,
    pub batch_duration_ms: u64,
    pub errors: &'a [SyncError],
}

/// Fold the queue and this peer's heartbeat into the previous sync state.
pub fn compute_sync_state(
    previous: SyncState,
    queue: &QueueDocument,
    inputs: &SyncInputs<'_>,
) -> SyncState {
    let mut state = previous;
    match inputs.peer {
        Origin::Client => state.last_client_heartbeat = Some(inputs.now),
        Origin::Worker => state.last_worker_heartbeat = Some(inputs.now),
    }
    let alive = |beat: Option<DateTime<Utc>>| {
        beat.map_or(false, |at| inputs.now - at <= inputs.heartbeat_timeout)
    };
    state.client_online = alive(state.last_client_heartbeat);
    state.worker_online = alive(state.last_worker_heartbeat);
    state.last_sync = Some(inputs.now);
    state.operation_counts = queue.counts();
    state.active_conflicts = queue.active_conflicts().count();
    for error in inputs.errors {
        state.push_error(error.clone());
    }

    let window_start = inputs.now - Duration::minutes(THROUGHPUT_WINDOW_MINUTES);
    let recent = queue
        .operations
        .iter()
        .filter(|op| op.status == OperationStatus::Completed)
        .filter(|op| op.completed_at.map_or(false, |at| at >= window_start))
        .count();
    state.performance = PerformanceMetrics {
        average_operation_time_ms: queue.processing_stats.average_processing_time_ms,
        throughput_per_minute: recent as f64 / THROUGHPUT_WINDOW_MINUTES as f64,
        last_batch_duration_ms: inputs.batch_duration_ms,
    };
    state
}
