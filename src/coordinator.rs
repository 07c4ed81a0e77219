//! Queue Coordinator
//!
//! Owns this peer's view of the queue and is the only path through which
//! it changes. Every mutation is a closure over a snapshot, committed with an
//! optimistic version check (see [`QueueSnapshot::commit`]). The coordinator
//! also reconciles worker results, promotes due retries, keeps conflicts
//! moving, and publishes the sync state.

pub mod ordering;
pub mod snapshot;
pub mod sync_state;

pub use ordering::{processing_cmp, processing_order};
pub use snapshot::QueueSnapshot;

use crate::config::OpsyncConfig;
use crate::conflict::resolver::auto_resolvable_ids;
use crate::conflict::{
    BatchResolution, Conflict, ConflictDetector, ConflictResolver, ResolutionOutcome,
    ResolutionStrategy,
};
use crate::error::ApiError;
use crate::mailbox::{
    MailboxConfig, QueueDocument, ResultsDocument, SyncError, SyncState,
};
use crate::operation::{
    Operation, OperationKind, OperationStatus, OperationValidator, RetryPolicy, ValidationIssue,
    DEFAULT_MAX_RETRIES,
};
use crate::store::AtomicFileStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::time::Instant;
use sync_state::{compute_sync_state, SyncInputs};
use tracing::{debug, error, info, warn};

/// Queue admission and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Live (non-terminal) operations the queue accepts
    #[serde(default = "default_max_live_operations")]
    pub max_live_operations: usize,
    /// Retry budget stamped on operations built by the CLI
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_live_operations() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_live_operations: default_max_live_operations(),
            default_max_retries: default_max_retries(),
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_live_operations == 0 {
            return Err("max_live_operations must be at least 1".to_string());
        }
        if self.retry.multiplier < 1.0 {
            return Err("retry.multiplier must be at least 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err("retry.jitter_ratio must be within [0, 1]".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err("retry.base_delay_ms cannot exceed retry.max_delay_ms".to_string());
        }
        Ok(())
    }
}

/// Polling loop and maintenance settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Re-apply attempts when the other peer wins a write race
    #[serde(default = "default_max_commit_attempts")]
    pub max_commit_attempts: u32,
    /// Resolve auto-resolvable conflicts as soon as they are detected
    #[serde(default = "default_true")]
    pub auto_resolve: bool,
    /// Resolved conflicts older than this are dropped on tick (hours)
    #[serde(default = "default_retention_hours")]
    pub resolved_conflict_retention_hours: i64,
    /// Terminal operations older than this are compacted on tick (hours)
    #[serde(default = "default_retention_hours")]
    pub operation_retention_hours: i64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_commit_attempts() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_retention_hours() -> i64 {
    24
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_commit_attempts: default_max_commit_attempts(),
            auto_resolve: default_true(),
            resolved_conflict_retention_hours: default_retention_hours(),
            operation_retention_hours: default_retention_hours(),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be positive".to_string());
        }
        if self.max_commit_attempts == 0 {
            return Err("max_commit_attempts must be at least 1".to_string());
        }
        if self.resolved_conflict_retention_hours < 0 || self.operation_retention_hours < 0 {
            return Err("retention hours cannot be negative".to_string());
        }
        Ok(())
    }
}

/// What `enqueue` did with an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOutcome {
    pub operation_id: String,
    pub warnings: Vec<ValidationIssue>,
    /// Conflicts detected against the queue, as persisted
    pub conflicts: Vec<Conflict>,
    /// Conflict ids settled automatically
    pub auto_resolved: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub retry_scheduled: Vec<String>,
    pub errors: Vec<SyncError>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactionReport {
    pub removed_operations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub reconciled: ReconcileReport,
    pub promoted: Vec<String>,
    pub new_conflicts: usize,
    pub auto_resolved: BatchResolution,
    pub cleaned_conflicts: usize,
    pub compacted: usize,
    pub duration_ms: u64,
}

pub struct QueueCoordinator {
    store: AtomicFileStore,
    snapshot: QueueSnapshot,
    validator: OperationValidator,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    retry_policy: RetryPolicy,
    queue_config: QueueConfig,
    config: CoordinatorConfig,
    mailbox: MailboxConfig,
    /// Errors not yet published in the sync state
    pending_errors: Vec<SyncError>,
}

impl QueueCoordinator {
    /// Open the mailbox under `workspace_root` with the given configuration.
    pub fn open(workspace_root: &Path, config: &OpsyncConfig) -> Result<Self, ApiError> {
        let store = AtomicFileStore::open(workspace_root, config.storage.clone())?;
        Self::with_store(store, config)
    }

    pub fn with_store(store: AtomicFileStore, config: &OpsyncConfig) -> Result<Self, ApiError> {
        match store.cleanup() {
            Ok(report) if report.total() > 0 => {
                info!(removed = report.total(), "Removed orphaned mailbox files on open")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Mailbox cleanup failed"),
        }
        let snapshot = QueueSnapshot::load(&store)?;
        let retry_policy = config.queue.retry.clone();
        info!(
            peer = %config.mailbox.peer,
            root = %store.root().display(),
            version = snapshot.last_seen_version(),
            "Queue coordinator ready"
        );
        Ok(Self {
            store,
            snapshot,
            validator: OperationValidator::new(),
            detector: ConflictDetector::new(config.detector.clone()),
            resolver: ConflictResolver::new(config.resolver.clone(), retry_policy.clone()),
            retry_policy,
            queue_config: config.queue.clone(),
            config: config.coordinator.clone(),
            mailbox: config.mailbox.clone(),
            pending_errors: Vec::new(),
        })
    }

    pub fn store(&self) -> &AtomicFileStore {
        &self.store
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn peer(&self) -> crate::operation::Origin {
        self.mailbox.peer
    }

    pub fn queue_config(&self) -> &QueueConfig {
        &self.queue_config
    }

    /// Optimistic write attempts before giving up on a contended document.
    pub fn max_commit_attempts(&self) -> u32 {
        self.config.max_commit_attempts
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.poll_interval_ms)
    }

    // ---- read-only surface ----

    /// Last queue document read or written by this peer.
    pub fn get_queue(&self) -> &QueueDocument {
        self.snapshot.document()
    }

    /// Current sync state; a default one before the first publication.
    pub fn get_sync_state(&self) -> Result<SyncState, ApiError> {
        Ok(self.store.read_or_restore::<SyncState>()?.unwrap_or_default())
    }

    /// Current results document; empty before the worker's first write.
    pub fn get_results(&self) -> Result<ResultsDocument, ApiError> {
        Ok(self
            .store
            .read_or_restore::<ResultsDocument>()?
            .unwrap_or_else(|| ResultsDocument::new(Utc::now())))
    }

    pub fn get_conflict_by_id(&self, id: &str) -> Option<&Conflict> {
        self.get_queue().get_conflict(id)
    }

    pub fn get_operation(&self, id: &str) -> Option<&Operation> {
        self.get_queue().get_operation(id)
    }

    /// Operations eligible to run now, in the order they should run.
    pub fn processing_order(&self) -> Vec<&Operation> {
        processing_order(self.get_queue(), Utc::now())
    }

    /// Pick up changes written by the other peer.
    pub fn refresh(&mut self) -> Result<&QueueDocument, ApiError> {
        self.snapshot.refresh(&self.store)?;
        Ok(self.snapshot.document())
    }

    // ---- mutating surface ----

    /// Validate, detect conflicts, persist, then auto-resolve what can be.
    pub fn enqueue(&mut self, op: Operation) -> Result<EnqueueOutcome, ApiError> {
        let now = Utc::now();
        let warnings = self.validator.validate(&op, now).into_result()?;
        self.snapshot.refresh(&self.store)?;

        let auto_resolve = self.config.auto_resolve;
        let max_live = self.queue_config.max_live_operations;
        let detector = &self.detector;
        let resolver = &self.resolver;
        let (conflict_ids, outcomes) =
            self.snapshot
                .commit(&self.store, self.config.max_commit_attempts, |queue| {
                    if queue.get_operation(&op.id).is_some() {
                        return Err(ApiError::DuplicateOperationId(op.id.clone()));
                    }
                    if let Some(missing) = op
                        .dependencies
                        .iter()
                        .find(|dep| queue.get_operation(dep).is_none())
                    {
                        return Err(ApiError::Validation(format!(
                            "Operation {} depends on unknown operation {}",
                            op.id, missing
                        )));
                    }
                    let live = queue.operations.iter().filter(|o| !o.is_terminal()).count();
                    if live >= max_live {
                        return Err(ApiError::Validation(format!(
                            "Queue is full ({} live operations)",
                            live
                        )));
                    }

                    let conflicts = detector.detect_with_conflicts(
                        &op,
                        &queue.operations,
                        &queue.conflicts,
                        now,
                    );
                    let mut candidate = op.clone();
                    link_conflicts(&mut queue.operations, &conflicts);
                    candidate
                        .conflict_ids
                        .extend(conflicts.iter().map(|c| c.id.clone()));
                    queue.operations.push(candidate);
                    let ids: Vec<String> = conflicts.iter().map(|c| c.id.clone()).collect();
                    queue.conflicts.extend(conflicts);

                    let mut outcomes = Vec::new();
                    if auto_resolve {
                        for id in &ids {
                            let auto = queue.get_conflict(id).map_or(false, |c| c.auto_resolvable);
                            if auto {
                                outcomes.push(resolver.apply(queue, id, None, "auto", now)?);
                            }
                        }
                    }
                    Ok((ids, outcomes))
                })?;

        let conflicts: Vec<Conflict> = conflict_ids
            .iter()
            .filter_map(|id| self.snapshot.document().get_conflict(id).cloned())
            .collect();
        for conflict in &conflicts {
            self.resolver.observe(conflict);
        }
        let auto_resolved = self.learn(&outcomes);
        info!(
            operation_id = %op.id,
            kind = %op.kind(),
            priority = %op.priority,
            conflicts = conflicts.len(),
            warnings = warnings.len(),
            "Enqueued operation"
        );
        Ok(EnqueueOutcome {
            operation_id: op.id,
            warnings,
            conflicts,
            auto_resolved,
        })
    }

    /// Retry an operation now.
    ///
    /// A failed operation goes back to pending and consumes one retry; a
    /// completed or cancelled one is cloned into a fresh operation. Returns
    /// the id that will run.
    pub fn retry(&mut self, id: &str) -> Result<String, ApiError> {
        self.snapshot.refresh(&self.store)?;
        let op = self
            .get_operation(id)
            .cloned()
            .ok_or_else(|| ApiError::OperationNotFound(id.to_string()))?;

        if op.is_terminal() {
            let clone = op.clone_for_retry(Utc::now());
            let outcome = self.enqueue(clone)?;
            info!(operation_id = id, retry_id = %outcome.operation_id, "Re-queued terminal operation");
            return Ok(outcome.operation_id);
        }
        if op.status != OperationStatus::Failed {
            return Err(ApiError::InvalidTransition {
                id: id.to_string(),
                from: op.status,
                to: OperationStatus::Pending,
            });
        }

        let policy = &self.retry_policy;
        let now = Utc::now();
        self.snapshot
            .commit(&self.store, self.config.max_commit_attempts, |queue| {
                let op = queue
                    .get_operation_mut(id)
                    .ok_or_else(|| ApiError::OperationNotFound(id.to_string()))?;
                // Exhausted budgets are reported by reset_for_retry itself.
                if op.status == OperationStatus::Failed
                    && op.retry_count < op.max_retries
                    && !policy.can_retry(op, now)
                {
                    return Err(ApiError::RetryRejected {
                        id: id.to_string(),
                        reason: format!(
                            "operation is older than the {}s retry horizon",
                            policy.max_age_secs
                        ),
                    });
                }
                op.reset_for_retry(None)
            })?;
        info!(operation_id = id, "Operation scheduled for retry");
        Ok(id.to_string())
    }

    /// Cancel a non-terminal operation. A worker mid-execution discards its result.
    pub fn cancel(&mut self, id: &str, reason: Option<&str>) -> Result<(), ApiError> {
        self.snapshot.refresh(&self.store)?;
        let reason = reason
            .map(str::to_string)
            .unwrap_or_else(|| format!("Cancelled by {}", self.mailbox.peer));
        let now = Utc::now();
        self.snapshot
            .commit(&self.store, self.config.max_commit_attempts, |queue| {
                let op = queue
                    .get_operation_mut(id)
                    .ok_or_else(|| ApiError::OperationNotFound(id.to_string()))?;
                op.cancel(now, reason.clone())
            })?;
        info!(operation_id = id, "Cancelled operation");
        Ok(())
    }

    pub fn resolve_conflict(
        &mut self,
        conflict_id: &str,
        strategy: Option<ResolutionStrategy>,
        resolved_by: &str,
    ) -> Result<bool, ApiError> {
        self.snapshot.refresh(&self.store)?;
        let now = Utc::now();
        let resolver = &self.resolver;
        let outcome = self
            .snapshot
            .commit(&self.store, self.config.max_commit_attempts, |queue| {
                resolver.apply(queue, conflict_id, strategy, resolved_by, now)
            })?;
        self.resolver.record(&outcome);
        Ok(outcome.resolved)
    }

    pub fn resolve_multiple_conflicts(
        &mut self,
        conflict_ids: &[String],
        strategy: Option<ResolutionStrategy>,
        resolved_by: &str,
    ) -> Result<BatchResolution, ApiError> {
        self.snapshot.refresh(&self.store)?;
        let now = Utc::now();
        let resolver = &self.resolver;
        let (batch, outcomes) =
            self.snapshot
                .commit(&self.store, self.config.max_commit_attempts, |queue| {
                    Ok(resolver.apply_many(queue, conflict_ids, strategy, resolved_by, now))
                })?;
        self.learn(&outcomes);
        Ok(batch)
    }

    /// Settle every active auto-resolvable conflict with its top recommendation.
    pub fn auto_resolve_all_conflicts(
        &mut self,
        resolved_by: &str,
    ) -> Result<BatchResolution, ApiError> {
        self.snapshot.refresh(&self.store)?;
        self.auto_resolve_loaded(resolved_by)
    }

    pub fn apply_manual_decision(
        &mut self,
        conflict_id: &str,
        keep_ids: &[String],
        resolved_by: &str,
    ) -> Result<(), ApiError> {
        self.snapshot.refresh(&self.store)?;
        let now = Utc::now();
        let resolver = &self.resolver;
        let outcome = self
            .snapshot
            .commit(&self.store, self.config.max_commit_attempts, |queue| {
                resolver.apply_manual_decision(queue, conflict_id, keep_ids, resolved_by, now)
            })?;
        self.resolver.record(&outcome);
        Ok(())
    }

    /// Drop resolved conflicts older than `max_age_hours`.
    pub fn cleanup_resolved_conflicts(&mut self, max_age_hours: i64) -> Result<usize, ApiError> {
        self.snapshot.refresh(&self.store)?;
        self.cleanup_loaded(max_age_hours)
    }

    /// Remove terminal operations older than `max_age_hours`.
    ///
    /// Operations a live operation depends on, and parties to an unresolved
    /// conflict, are kept regardless of age.
    pub fn compact(&mut self, max_age_hours: i64) -> Result<CompactionReport, ApiError> {
        self.snapshot.refresh(&self.store)?;
        self.compact_loaded(max_age_hours)
    }

    /// Apply worker results to in-progress operations.
    ///
    /// A result only applies to an operation that is still in progress and
    /// was started no later than the result's timestamp, so replays and
    /// results from earlier attempts are ignored.
    pub fn reconcile_results(&mut self) -> Result<ReconcileReport, ApiError> {
        let results = self.get_results()?;
        if results.results.is_empty() {
            return Ok(ReconcileReport::default());
        }
        let now = Utc::now();
        let policy = &self.retry_policy;
        let report = self
            .snapshot
            .commit(&self.store, self.config.max_commit_attempts, |queue| {
                let mut report = ReconcileReport::default();
                for result in &results.results {
                    let Some(op) = queue.get_operation_mut(&result.operation_id) else {
                        continue;
                    };
                    if op.status != OperationStatus::InProgress
                        || op.started_at.map_or(false, |at| result.timestamp < at)
                    {
                        continue;
                    }

                    if result.success {
                        op.complete(result.timestamp, result.data.clone())?;
                        report.completed.push(op.id.clone());
                    } else {
                        let (code, message) = match &result.error {
                            Some(err) => (err.code.clone(), err.message.clone()),
                            None => ("EXECUTION_FAILED".to_string(), result.message.clone()),
                        };
                        op.fail(result.timestamp, message.clone())?;
                        if result.retryable && policy.can_retry(op, now) {
                            op.next_retry_at =
                                Some(policy.next_retry_at(op.retry_count + 1, now));
                            report.retry_scheduled.push(op.id.clone());
                        } else {
                            op.next_retry_at = None;
                            report.failed.push(op.id.clone());
                        }
                        report.errors.push(SyncError {
                            timestamp: result.timestamp,
                            code,
                            message,
                            operation_id: Some(op.id.clone()),
                        });
                    }
                    queue
                        .processing_stats
                        .record(result.success, result.processing_time_ms);
                }
                Ok(report)
            })?;

        if !report.completed.is_empty() || !report.failed.is_empty() {
            info!(
                completed = report.completed.len(),
                failed = report.failed.len(),
                retry_scheduled = report.retry_scheduled.len(),
                "Reconciled worker results"
            );
        }
        for id in &report.failed {
            warn!(operation_id = %id, "Operation failed permanently");
        }
        self.pending_errors.extend(report.errors.iter().cloned());
        Ok(report)
    }

    /// Move failed operations whose scheduled retry time has passed back to pending.
    pub fn promote_due_retries(&mut self) -> Result<Vec<String>, ApiError> {
        let now = Utc::now();
        let policy = &self.retry_policy;
        let promoted = self
            .snapshot
            .commit(&self.store, self.config.max_commit_attempts, |queue| {
                let mut promoted = Vec::new();
                for op in queue.operations.iter_mut() {
                    if op.status == OperationStatus::Failed
                        && op.next_retry_at.is_some()
                        && policy.should_retry(op, now)
                    {
                        let at = op.next_retry_at;
                        op.reset_for_retry(at)?;
                        promoted.push(op.id.clone());
                    }
                }
                Ok(promoted)
            })?;
        for id in &promoted {
            debug!(operation_id = %id, "Promoted retry");
        }
        Ok(promoted)
    }

    /// Mark the next eligible operation this peer can execute as in progress.
    pub fn claim_next(
        &mut self,
        accepts: impl Fn(OperationKind) -> bool,
    ) -> Result<Option<Operation>, ApiError> {
        self.snapshot.refresh(&self.store)?;
        let now = Utc::now();
        let claimed = self
            .snapshot
            .commit(&self.store, self.config.max_commit_attempts, |queue| {
                let next = processing_order(queue, now)
                    .into_iter()
                    .find(|op| accepts(op.kind()))
                    .map(|op| op.id.clone());
                let Some(id) = next else {
                    return Ok(None);
                };
                match queue.get_operation_mut(&id) {
                    Some(op) => {
                        op.start(now)?;
                        Ok(Some(op.clone()))
                    }
                    None => Ok(None),
                }
            })?;
        if let Some(op) = &claimed {
            debug!(operation_id = %op.id, kind = %op.kind(), "Claimed operation");
        }
        Ok(claimed)
    }

    /// Recompute and write the sync state, recording this peer's heartbeat.
    pub fn publish_sync_state(&mut self, batch_duration_ms: u64) -> Result<SyncState, ApiError> {
        let inputs = SyncInputs {
            peer: self.mailbox.peer,
            now: Utc::now(),
            heartbeat_timeout: Duration::seconds(self.mailbox.heartbeat_timeout_secs),
            batch_duration_ms,
            errors: &self.pending_errors,
        };
        let queue = self.snapshot.document();
        let state = self.store.update_versioned(
            self.config.max_commit_attempts,
            SyncState::default,
            |state: &mut SyncState| {
                *state = compute_sync_state(std::mem::take(state), queue, &inputs);
            },
        )?;
        self.pending_errors.clear();
        Ok(state)
    }

    /// One polling cycle: read, reconcile, promote, detect, resolve, clean, publish.
    pub fn tick(&mut self) -> Result<TickReport, ApiError> {
        let started = Instant::now();
        self.snapshot.refresh(&self.store)?;

        let mut report = TickReport {
            reconciled: self.reconcile_results()?,
            promoted: self.promote_due_retries()?,
            ..TickReport::default()
        };
        report.new_conflicts = self.scan_conflicts()?;
        if self.config.auto_resolve {
            report.auto_resolved = self.auto_resolve_loaded("auto")?;
        }
        report.cleaned_conflicts =
            self.cleanup_loaded(self.config.resolved_conflict_retention_hours)?;
        report.compacted = self
            .compact_loaded(self.config.operation_retention_hours)?
            .removed_operations
            .len();

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.publish_sync_state(report.duration_ms)?;
        Ok(report)
    }

    /// Tick every poll interval until `shutdown` resolves.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), ApiError>
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!(peer = %self.mailbox.peer, interval_ms = self.config.poll_interval_ms, "Coordinator loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Coordinator loop stopping");
                    return Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick() {
                        self.record_error(&e);
                    }
                }
            }
        }
    }

    /// Remember a failed cycle for the next sync-state publication.
    pub fn record_error(&mut self, err: &ApiError) {
        let code = match err {
            ApiError::StorageError(storage) => storage.code().to_string(),
            ApiError::ConcurrentUpdate { .. } => "CONCURRENT_UPDATE".to_string(),
            _ => "COORDINATOR_ERROR".to_string(),
        };
        error!(error = %err, code = %code, "Coordinator cycle failed");
        self.pending_errors.push(SyncError {
            timestamp: Utc::now(),
            code,
            message: err.to_string(),
            operation_id: None,
        });
    }

    fn scan_conflicts(&mut self) -> Result<usize, ApiError> {
        let now = Utc::now();
        let detector = &self.detector;
        let fresh = self
            .snapshot
            .commit(&self.store, self.config.max_commit_attempts, |queue| {
                let fresh = detector.scan(&queue.operations, &queue.conflicts, now);
                link_conflicts(&mut queue.operations, &fresh);
                queue.conflicts.extend(fresh.iter().cloned());
                Ok(fresh)
            })?;
        for conflict in &fresh {
            debug!(conflict_id = %conflict.id, conflict_type = %conflict.conflict_type, "Detected conflict on scan");
            self.resolver.observe(conflict);
        }
        Ok(fresh.len())
    }

    fn auto_resolve_loaded(&mut self, resolved_by: &str) -> Result<BatchResolution, ApiError> {
        if auto_resolvable_ids(self.snapshot.document()).is_empty() {
            return Ok(BatchResolution::default());
        }
        let now = Utc::now();
        let resolver = &self.resolver;
        let (batch, outcomes) =
            self.snapshot
                .commit(&self.store, self.config.max_commit_attempts, |queue| {
                    let ids = auto_resolvable_ids(queue);
                    Ok(resolver.apply_many(queue, &ids, None, resolved_by, now))
                })?;
        self.learn(&outcomes);
        Ok(batch)
    }

    fn cleanup_loaded(&mut self, max_age_hours: i64) -> Result<usize, ApiError> {
        let now = Utc::now();
        let resolver = &self.resolver;
        self.snapshot
            .commit(&self.store, self.config.max_commit_attempts, |queue| {
                Ok(resolver.cleanup_resolved_conflicts(queue, max_age_hours, now))
            })
    }

    fn compact_loaded(&mut self, max_age_hours: i64) -> Result<CompactionReport, ApiError> {
        let cutoff = Utc::now() - Duration::hours(max_age_hours);
        let report = self
            .snapshot
            .commit(&self.store, self.config.max_commit_attempts, |queue| {
                let removable = compactable_ids(queue, cutoff);
                queue.operations.retain(|op| !removable.contains(&op.id));
                let mut removed: Vec<String> = removable.into_iter().collect();
                removed.sort();
                Ok(CompactionReport {
                    removed_operations: removed,
                })
            })?;
        if !report.removed_operations.is_empty() {
            info!(removed = report.removed_operations.len(), max_age_hours, "Compacted queue");
        }
        Ok(report)
    }

    /// Feed persisted outcomes to the resolver; returns the resolved conflict ids.
    fn learn(&mut self, outcomes: &[ResolutionOutcome]) -> Vec<String> {
        let mut resolved = Vec::new();
        for outcome in outcomes {
            self.resolver.record(outcome);
            if outcome.resolved && outcome.strategy.is_some() {
                resolved.push(outcome.conflict_id.clone());
            }
        }
        resolved
    }
}

/// Record each conflict's id on its live parties.
fn link_conflicts(operations: &mut [Operation], conflicts: &[Conflict]) {
    for conflict in conflicts {
        for op in operations.iter_mut() {
            if conflict.involves(&op.id) && !op.is_terminal() && !op.conflict_ids.contains(&conflict.id) {
                op.conflict_ids.push(conflict.id.clone());
            }
        }
    }
}

/// Terminal, aged, not depended on by a live operation, not in an active conflict.
fn compactable_ids(queue: &QueueDocument, cutoff: DateTime<Utc>) -> HashSet<String> {
    let needed: HashSet<&str> = queue
        .operations
        .iter()
        .filter(|op| !op.is_terminal())
        .flat_map(|op| op.dependencies.iter().map(String::as_str))
        .collect();
    queue
        .operations
        .iter()
        .filter(|op| op.is_terminal())
        .filter(|op| op.completed_at.unwrap_or(op.timestamp) < cutoff)
        .filter(|op| !needed.contains(op.id.as_str()))
        .filter(|op| !queue.has_active_conflict(&op.id))
        .map(|op| op.id.clone())
        .collect()
}
