//! Mailbox documents
//!
//! The three JSON documents the peers exchange: the queue (operations and
//! conflicts), the sync state (health snapshot, written by the coordinator
//! only) and the results (written by the worker only).

use crate::conflict::Conflict;
use crate::operation::{Operation, OperationStatus, Origin};
use crate::store::{DocumentKind, MailboxDocument};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};

/// Results kept in the results document; oldest evicted first.
pub const MAX_RESULTS: usize = 100;
/// Capacity of the recent-errors ring in the sync state.
pub const MAX_RECENT_ERRORS: usize = 10;

/// Which peer this process is, and how quickly the other one is presumed gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxConfig {
    #[serde(default = "default_peer")]
    pub peer: Origin,
    /// A peer whose heartbeat is older than this is reported offline (seconds)
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: i64,
}

fn default_peer() -> Origin {
    Origin::Client
}

fn default_heartbeat_timeout_secs() -> i64 {
    30
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            peer: default_peer(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

impl MailboxConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_timeout_secs <= 0 {
            return Err("heartbeat_timeout_secs must be positive".to_string());
        }
        Ok(())
    }
}

/// Cumulative counters over reconciled results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    pub total_processed: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub average_processing_time_ms: f64,
}

impl ProcessingStats {
    /// Fold one finished execution into the running average.
    pub fn record(&mut self, success: bool, processing_time_ms: u64) {
        let previous = self.total_processed as f64;
        self.total_processed += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.average_processing_time_ms = (self.average_processing_time_ms * previous
            + processing_time_ms as f64)
            / self.total_processed as f64;
    }
}

/// The queue document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDocument {
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    /// Strictly increases on every successful persist
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub processing_stats: ProcessingStats,
}

impl MailboxDocument for QueueDocument {
    const KIND: DocumentKind = DocumentKind::Queue;

    fn version(&self) -> Option<u64> {
        Some(self.version)
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl QueueDocument {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            operations: Vec::new(),
            conflicts: Vec::new(),
            version: 0,
            created_at: now,
            last_modified: now,
            processing_stats: ProcessingStats::default(),
        }
    }

    pub fn get_operation(&self, id: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }

    pub fn get_operation_mut(&mut self, id: &str) -> Option<&mut Operation> {
        self.operations.iter_mut().find(|op| op.id == id)
    }

    pub fn get_conflict(&self, id: &str) -> Option<&Conflict> {
        self.conflicts.iter().find(|c| c.id == id)
    }

    pub fn get_conflict_mut(&mut self, id: &str) -> Option<&mut Conflict> {
        self.conflicts.iter_mut().find(|c| c.id == id)
    }

    /// Unresolved conflicts.
    pub fn active_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| !c.resolved)
    }

    /// Whether the operation is a party to an unresolved conflict.
    pub fn has_active_conflict(&self, op_id: &str) -> bool {
        self.active_conflicts()
            .any(|c| c.operation_ids.iter().any(|id| id == op_id))
    }

    /// Operation count per status; every status is present.
    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for op in &self.operations {
            counts.increment(op.status);
        }
        counts
    }
}

/// Error payload attached to a failed result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Outcome of one execution, written by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub operation_id: String,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResultError>,
    pub timestamp: DateTime<Utc>,
    pub processing_time_ms: u64,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicts_detected: Option<Vec<String>>,
}

/// The results document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsDocument {
    pub results: Vec<OperationResult>,
    pub last_updated: DateTime<Utc>,
    /// Bumped on every persist; absent in documents from older writers
    #[serde(default)]
    pub version: u64,
}

impl MailboxDocument for ResultsDocument {
    const KIND: DocumentKind = DocumentKind::Results;

    fn version(&self) -> Option<u64> {
        Some(self.version)
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl ResultsDocument {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            results: Vec::new(),
            last_updated: now,
            version: 0,
        }
    }

    /// Append a result, evicting the oldest beyond [`MAX_RESULTS`].
    pub fn push(&mut self, result: OperationResult) {
        self.last_updated = result.timestamp.max(self.last_updated);
        self.results.push(result);
        if self.results.len() > MAX_RESULTS {
            let excess = self.results.len() - MAX_RESULTS;
            self.results.drain(..excess);
        }
    }

    /// Most recent result for an operation.
    pub fn latest_for(&self, operation_id: &str) -> Option<&OperationResult> {
        self.results
            .iter()
            .rev()
            .find(|r| r.operation_id == operation_id)
    }
}

/// Operation count per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn increment(&mut self, status: OperationStatus) {
        *self.slot(status) += 1;
    }

    pub fn get(&self, status: OperationStatus) -> usize {
        match status {
            OperationStatus::Pending => self.pending,
            OperationStatus::InProgress => self.in_progress,
            OperationStatus::Completed => self.completed,
            OperationStatus::Failed => self.failed,
            OperationStatus::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> usize {
        OperationStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }

    fn slot(&mut self, status: OperationStatus) -> &mut usize {
        match status {
            OperationStatus::Pending => &mut self.pending,
            OperationStatus::InProgress => &mut self.in_progress,
            OperationStatus::Completed => &mut self.completed,
            OperationStatus::Failed => &mut self.failed,
            OperationStatus::Cancelled => &mut self.cancelled,
        }
    }
}

/// One entry in the recent-errors ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncError {
    pub timestamp: DateTime<Utc>,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub average_operation_time_ms: f64,
    pub throughput_per_minute: f64,
    #[serde(default)]
    pub last_batch_duration_ms: u64,
}

/// The sync-state document. Recomputed by the coordinator only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub client_online: bool,
    pub worker_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_client_heartbeat: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_worker_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub operation_counts: StatusCounts,
    #[serde(default)]
    pub active_conflicts: usize,
    #[serde(default)]
    pub recent_errors: VecDeque<SyncError>,
    #[serde(default)]
    pub performance: PerformanceMetrics,
    /// Free-form extension fields written by either peer's tooling
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
    #[serde(default)]
    pub version: u64,
}

impl MailboxDocument for SyncState {
    const KIND: DocumentKind = DocumentKind::SyncState;

    fn version(&self) -> Option<u64> {
        Some(self.version)
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            client_online: false,
            worker_online: false,
            last_sync: None,
            last_client_heartbeat: None,
            last_worker_heartbeat: None,
            operation_counts: StatusCounts::default(),
            active_conflicts: 0,
            recent_errors: VecDeque::new(),
            performance: PerformanceMetrics::default(),
            extra: BTreeMap::new(),
            version: 0,
        }
    }
}

impl SyncState {
    /// Append to the error ring, dropping the oldest beyond capacity.
    pub fn push_error(&mut self, error: SyncError) {
        self.recent_errors.push_back(error);
        while self.recent_errors.len() > MAX_RECENT_ERRORS {
            self.recent_errors.pop_front();
        }
    }
}
