//! Conflict Resolver
//!
//! Applies a [`ResolutionStrategy`] to a conflict inside a queue snapshot.
//! Application ([`ConflictResolver::apply`]) borrows the resolver immutably
//! and only touches the queue, so the coordinator can replay it after an
//! optimistic-concurrency retry. Learning (statistics, patterns, history) is
//! recorded separately once a resolution has been persisted.

use crate::conflict::merge::merge_lines;
use crate::conflict::patterns::PatternTable;
use crate::conflict::{Conflict, ConflictType, ResolutionStrategy};
use crate::error::ApiError;
use crate::mailbox::QueueDocument;
use crate::operation::params::resource_category;
use crate::operation::{
    Operation, OperationStatus, Origin, RetryPolicy, META_DEFERRED_UNTIL, META_MERGED_FROM,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// How long `defer` holds an operation back (seconds)
    #[serde(default = "default_defer_secs")]
    pub defer_window_secs: i64,
    #[serde(default = "default_pattern_capacity")]
    pub pattern_capacity: usize,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Attempts a strategy needs before its success rate affects ranking
    #[serde(default = "default_min_attempts")]
    pub min_attempts_for_ranking: u32,
}

fn default_defer_secs() -> i64 {
    300
}

fn default_pattern_capacity() -> usize {
    256
}

fn default_history_capacity() -> usize {
    100
}

fn default_min_attempts() -> u32 {
    3
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            defer_window_secs: default_defer_secs(),
            pattern_capacity: default_pattern_capacity(),
            history_capacity: default_history_capacity(),
            min_attempts_for_ranking: default_min_attempts(),
        }
    }
}

impl ResolverConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.defer_window_secs < 0 {
            return Err("defer_window_secs cannot be negative".to_string());
        }
        if self.pattern_capacity == 0 {
            return Err("pattern_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Cumulative counters since the resolver was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictStatistics {
    pub total_conflicts: u64,
    pub resolved_conflicts: u64,
    pub by_type: BTreeMap<ConflictType, u64>,
    pub by_strategy: BTreeMap<ResolutionStrategy, u64>,
}

impl ConflictStatistics {
    pub fn resolution_rate(&self) -> f64 {
        if self.total_conflicts == 0 {
            0.0
        } else {
            self.resolved_conflicts as f64 / self.total_conflicts as f64
        }
    }
}

/// Result of applying a strategy to a queue snapshot, before it is learned from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOutcome {
    pub conflict_id: String,
    pub conflict_type: ConflictType,
    pub resource_category: &'static str,
    /// `None` when nothing was attempted
    pub strategy: Option<ResolutionStrategy>,
    pub resolved: bool,
    pub resolved_by: String,
    pub timestamp: DateTime<Utc>,
}

/// Bounded history entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRecord {
    pub conflict_id: String,
    pub conflict_type: ConflictType,
    pub strategy: ResolutionStrategy,
    pub success: bool,
    pub resolved_by: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchResolution {
    pub resolved: Vec<String>,
    /// Conflict id and why it stayed unresolved
    pub failed: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct ConflictResolver {
    config: ResolverConfig,
    retry_policy: RetryPolicy,
    patterns: PatternTable,
    statistics: ConflictStatistics,
    history: VecDeque<ResolutionRecord>,
}

impl ConflictResolver {
    pub fn new(config: ResolverConfig, retry_policy: RetryPolicy) -> Self {
        let patterns = PatternTable::new(config.pattern_capacity);
        Self {
            config,
            retry_policy,
            patterns,
            statistics: ConflictStatistics::default(),
            history: VecDeque::new(),
        }
    }

    pub fn statistics(&self) -> &ConflictStatistics {
        &self.statistics
    }

    pub fn history(&self) -> impl Iterator<Item = &ResolutionRecord> {
        self.history.iter()
    }

    pub fn patterns(&self) -> &PatternTable {
        &self.patterns
    }

    /// Count a newly detected conflict.
    pub fn observe(&mut self, conflict: &Conflict) {
        self.statistics.total_conflicts += 1;
        *self
            .statistics
            .by_type
            .entry(conflict.conflict_type)
            .or_default() += 1;
        self.patterns.observe(
            conflict.conflict_type,
            resource_category(&conflict.resource_path),
            conflict.detected_at,
        );
    }

    /// Learn from a persisted outcome.
    pub fn record(&mut self, outcome: &ResolutionOutcome) {
        let Some(strategy) = outcome.strategy else {
            return;
        };
        self.patterns.record_attempt(
            outcome.conflict_type,
            outcome.resource_category,
            strategy,
            outcome.resolved,
            outcome.timestamp,
        );
        if outcome.resolved {
            self.statistics.resolved_conflicts += 1;
            *self.statistics.by_strategy.entry(strategy).or_default() += 1;
        }
        self.history.push_back(ResolutionRecord {
            conflict_id: outcome.conflict_id.clone(),
            conflict_type: outcome.conflict_type,
            strategy,
            success: outcome.resolved,
            resolved_by: outcome.resolved_by.clone(),
            timestamp: outcome.timestamp,
        });
        while self.history.len() > self.config.history_capacity {
            self.history.pop_front();
        }
    }

    /// The detector's recommendations, re-ranked by recorded success.
    pub fn recommend_strategies(&self, conflict: &Conflict) -> Vec<ResolutionStrategy> {
        self.patterns.rank(
            conflict.conflict_type,
            resource_category(&conflict.resource_path),
            &conflict.recommendations,
            self.config.min_attempts_for_ranking,
        )
    }

    /// Apply and learn in one step.
    pub fn resolve_conflict(
        &mut self,
        queue: &mut QueueDocument,
        conflict_id: &str,
        strategy: Option<ResolutionStrategy>,
        resolved_by: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, ApiError> {
        let outcome = self.apply(queue, conflict_id, strategy, resolved_by, now)?;
        self.record(&outcome);
        Ok(outcome.resolved)
    }

    pub fn resolve_multiple_conflicts(
        &mut self,
        queue: &mut QueueDocument,
        conflict_ids: &[String],
        strategy: Option<ResolutionStrategy>,
        resolved_by: &str,
        now: DateTime<Utc>,
    ) -> BatchResolution {
        let (batch, outcomes) = self.apply_many(queue, conflict_ids, strategy, resolved_by, now);
        for outcome in &outcomes {
            self.record(outcome);
        }
        batch
    }

    pub fn auto_resolve_all_conflicts(
        &mut self,
        queue: &mut QueueDocument,
        resolved_by: &str,
        now: DateTime<Utc>,
    ) -> BatchResolution {
        let ids = auto_resolvable_ids(queue);
        self.resolve_multiple_conflicts(queue, &ids, None, resolved_by, now)
    }

    /// Apply a strategy to the snapshot without learning from it.
    ///
    /// Unknown id is an error; an already-resolved conflict is a successful
    /// no-op. A failed strategy leaves every operation untouched.
    pub fn apply(
        &self,
        queue: &mut QueueDocument,
        conflict_id: &str,
        strategy: Option<ResolutionStrategy>,
        resolved_by: &str,
        now: DateTime<Utc>,
    ) -> Result<ResolutionOutcome, ApiError> {
        let conflict = queue
            .get_conflict(conflict_id)
            .cloned()
            .ok_or_else(|| ApiError::ConflictNotFound(conflict_id.to_string()))?;
        let mut outcome = ResolutionOutcome {
            conflict_id: conflict.id.clone(),
            conflict_type: conflict.conflict_type,
            resource_category: resource_category(&conflict.resource_path),
            strategy: None,
            resolved: conflict.resolved,
            resolved_by: resolved_by.to_string(),
            timestamp: now,
        };
        if conflict.resolved {
            debug!(conflict_id, "Conflict already resolved");
            return Ok(outcome);
        }

        let chosen = match strategy {
            Some(strategy) => strategy,
            None if conflict.auto_resolvable => {
                match self.recommend_strategies(&conflict).into_iter().next() {
                    Some(strategy) => strategy,
                    None => return Ok(outcome),
                }
            }
            None => {
                mark_manual(queue, conflict_id);
                return Ok(outcome);
            }
        };
        outcome.strategy = Some(chosen);

        let resolved = self.run_strategy(queue, &conflict, chosen, now)?;
        if resolved {
            if let Some(record) = queue.get_conflict_mut(conflict_id) {
                record.resolved = true;
                record.resolution = Some(chosen);
                record.resolved_by = Some(resolved_by.to_string());
                record.resolved_at = Some(now);
                record.requires_manual = false;
            }
            info!(
                conflict_id,
                conflict_type = %conflict.conflict_type,
                strategy = %chosen,
                resolved_by,
                "Resolved conflict"
            );
        } else {
            debug!(conflict_id, strategy = %chosen, "Strategy did not resolve conflict");
        }
        outcome.resolved = resolved;
        Ok(outcome)
    }

    /// Apply one strategy to several conflicts; unknown ids are reported as failures.
    pub fn apply_many(
        &self,
        queue: &mut QueueDocument,
        conflict_ids: &[String],
        strategy: Option<ResolutionStrategy>,
        resolved_by: &str,
        now: DateTime<Utc>,
    ) -> (BatchResolution, Vec<ResolutionOutcome>) {
        let mut batch = BatchResolution::default();
        let mut outcomes = Vec::new();
        for id in conflict_ids {
            match self.apply(queue, id, strategy, resolved_by, now) {
                Ok(outcome) => {
                    if outcome.resolved {
                        batch.resolved.push(id.clone());
                    } else {
                        let reason = match outcome.strategy {
                            Some(s) => format!("strategy {} did not resolve the conflict", s),
                            None => "conflict requires a manual decision".to_string(),
                        };
                        batch.failed.push((id.clone(), reason));
                    }
                    outcomes.push(outcome);
                }
                Err(e) => batch.failed.push((id.clone(), e.to_string())),
            }
        }
        (batch, outcomes)
    }

    /// Settle a conflict by an external decision: keep `keep_ids`, cancel the
    /// other live parties.
    pub fn apply_manual_decision(
        &self,
        queue: &mut QueueDocument,
        conflict_id: &str,
        keep_ids: &[String],
        resolved_by: &str,
        now: DateTime<Utc>,
    ) -> Result<ResolutionOutcome, ApiError> {
        let conflict = queue
            .get_conflict(conflict_id)
            .cloned()
            .ok_or_else(|| ApiError::ConflictNotFound(conflict_id.to_string()))?;
        if conflict.resolved {
            debug!(conflict_id, "Conflict already resolved, manual decision ignored");
            return Ok(ResolutionOutcome {
                resource_category: resource_category(&conflict.resource_path),
                strategy: None,
                resolved: true,
                resolved_by: conflict.resolved_by.clone().unwrap_or_default(),
                timestamp: conflict.resolved_at.unwrap_or(now),
                conflict_id: conflict.id,
                conflict_type: conflict.conflict_type,
            });
        }
        if let Some(stranger) = keep_ids.iter().find(|id| !conflict.involves(id)) {
            return Err(ApiError::Validation(format!(
                "Operation {} is not a party to conflict {}",
                stranger, conflict_id
            )));
        }

        let losers: Vec<String> = conflict
            .operation_ids
            .iter()
            .filter(|id| !keep_ids.contains(id))
            .cloned()
            .collect();
        cancel_live(
            queue,
            &losers,
            now,
            &format!("Cancelled by manual decision on conflict {}", conflict_id),
        )?;

        if let Some(record) = queue.get_conflict_mut(conflict_id) {
            record.resolved = true;
            record.resolution = Some(ResolutionStrategy::Manual);
            record.resolved_by = Some(resolved_by.to_string());
            record.resolved_at = Some(now);
            record.requires_manual = false;
        }
        info!(conflict_id, kept = keep_ids.len(), resolved_by, "Applied manual decision");
        Ok(ResolutionOutcome {
            conflict_id: conflict.id,
            conflict_type: conflict.conflict_type,
            resource_category: resource_category(&conflict.resource_path),
            strategy: Some(ResolutionStrategy::Manual),
            resolved: true,
            resolved_by: resolved_by.to_string(),
            timestamp: now,
        })
    }

    /// Drop resolved conflicts older than `max_age_hours`. Active ones are kept.
    pub fn cleanup_resolved_conflicts(
        &self,
        queue: &mut QueueDocument,
        max_age_hours: i64,
        now: DateTime<Utc>,
    ) -> usize {
        let cutoff = now - Duration::hours(max_age_hours);
        let before = queue.conflicts.len();
        queue.conflicts.retain(|c| {
            !(c.resolved && c.resolved_at.unwrap_or(c.detected_at) < cutoff)
        });
        let removed = before - queue.conflicts.len();
        if removed > 0 {
            debug!(removed, max_age_hours, "Removed resolved conflicts");
        }
        removed
    }

    fn run_strategy(
        &self,
        queue: &mut QueueDocument,
        conflict: &Conflict,
        strategy: ResolutionStrategy,
        now: DateTime<Utc>,
    ) -> Result<bool, ApiError> {
        let reason_prefix = format!("Conflict {} ({})", conflict.id, conflict.conflict_type);
        match strategy {
            ResolutionStrategy::Manual => {
                mark_manual(queue, &conflict.id);
                Ok(false)
            }
            ResolutionStrategy::AutoMerge => {
                if conflict.conflict_type == ConflictType::ConcurrentModification {
                    return self.run_strategy(queue, conflict, ResolutionStrategy::Merge, now);
                }
                let fallback = self.recommend_strategies(conflict).into_iter().find(|s| {
                    !matches!(s, ResolutionStrategy::Manual | ResolutionStrategy::AutoMerge)
                });
                match fallback {
                    Some(next) => self.run_strategy(queue, conflict, next, now),
                    None => Ok(false),
                }
            }
            ResolutionStrategy::CancelConflicting => {
                let survivors = non_cancelled(queue, conflict);
                let Some(keep) = survivors.iter().min_by(|a, b| by_age(a, b)) else {
                    return Ok(true);
                };
                let keep_id = keep.id.clone();
                let losers = ids_except(&survivors, &keep_id);
                cancel_live(
                    queue,
                    &losers,
                    now,
                    &format!("{}: cancelled in favor of {}", reason_prefix, keep_id),
                )?;
                Ok(true)
            }
            ResolutionStrategy::PreferNewer | ResolutionStrategy::PreferOlder => {
                let survivors = non_cancelled(queue, conflict);
                let keep = if strategy == ResolutionStrategy::PreferNewer {
                    survivors.iter().max_by(|a, b| by_age(a, b))
                } else {
                    survivors.iter().min_by(|a, b| by_age(a, b))
                };
                let Some(keep) = keep else {
                    return Ok(true);
                };
                let keep_id = keep.id.clone();
                let losers = ids_except(&survivors, &keep_id);
                cancel_live(
                    queue,
                    &losers,
                    now,
                    &format!("{}: superseded by {}", reason_prefix, keep_id),
                )?;
                Ok(true)
            }
            ResolutionStrategy::ClientWins | ResolutionStrategy::WorkerWins => {
                let winner = if strategy == ResolutionStrategy::ClientWins {
                    Origin::Client
                } else {
                    Origin::Worker
                };
                let live = live_parties(queue, conflict);
                let has = |origin: Origin| live.iter().any(|op| op.origin == origin);
                if !has(winner) || !has(winner.other()) {
                    return Ok(false);
                }
                let losers: Vec<String> = live
                    .iter()
                    .filter(|op| op.origin != winner)
                    .map(|op| op.id.clone())
                    .collect();
                cancel_live(
                    queue,
                    &losers,
                    now,
                    &format!("{}: resolved in favor of {}", reason_prefix, winner),
                )?;
                Ok(true)
            }
            ResolutionStrategy::Retry => self.retry_parties(queue, conflict, now),
            ResolutionStrategy::Defer => self.defer_party(queue, conflict, now),
            ResolutionStrategy::Reorder => reorder_parties(queue, conflict),
            ResolutionStrategy::Merge => merge_parties(queue, conflict, now),
        }
    }

    fn retry_parties(
        &self,
        queue: &mut QueueDocument,
        conflict: &Conflict,
        now: DateTime<Utc>,
    ) -> Result<bool, ApiError> {
        let parties = parties(queue, conflict);
        let mut targets: Vec<&Operation> = parties
            .iter()
            .filter(|op| op.status == OperationStatus::Failed)
            .collect();
        if targets.is_empty() {
            targets = parties
                .iter()
                .filter(|op| op.status == OperationStatus::Pending)
                .max_by(|a, b| by_age(a, b))
                .into_iter()
                .collect();
        }
        if targets.is_empty() || targets.iter().any(|op| op.retry_count >= op.max_retries) {
            return Ok(false);
        }

        let schedule: Vec<(String, DateTime<Utc>)> = targets
            .iter()
            .map(|op| {
                (
                    op.id.clone(),
                    self.retry_policy.next_retry_at(op.retry_count + 1, now),
                )
            })
            .collect();
        for (id, at) in schedule {
            if let Some(op) = queue.get_operation_mut(&id) {
                op.reset_for_retry(Some(at))?;
            }
        }
        Ok(true)
    }

    fn defer_party(
        &self,
        queue: &mut QueueDocument,
        conflict: &Conflict,
        now: DateTime<Utc>,
    ) -> Result<bool, ApiError> {
        let target = live_parties(queue, conflict)
            .into_iter()
            .min_by(|a, b| a.priority.cmp(&b.priority).then_with(|| by_age(b, a)))
            .map(|op| op.id.clone());
        let Some(target) = target else {
            return Ok(false);
        };
        let until = now + Duration::seconds(self.config.defer_window_secs);
        if let Some(op) = queue.get_operation_mut(&target) {
            op.priority = op.priority.lowered();
            op.metadata.insert(
                META_DEFERRED_UNTIL.to_string(),
                Value::String(until.to_rfc3339()),
            );
            debug!(operation_id = %op.id, until = %until, "Deferred operation");
        }
        Ok(true)
    }
}

/// Active conflicts that may be settled without a human.
pub fn auto_resolvable_ids(queue: &QueueDocument) -> Vec<String> {
    queue
        .active_conflicts()
        .filter(|c| c.auto_resolvable)
        .map(|c| c.id.clone())
        .collect()
}

fn mark_manual(queue: &mut QueueDocument, conflict_id: &str) {
    if let Some(record) = queue.get_conflict_mut(conflict_id) {
        record.requires_manual = true;
    }
}

/// Creation order, id as tie-breaker.
fn by_age(a: &Operation, b: &Operation) -> std::cmp::Ordering {
    a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id))
}

fn parties(queue: &QueueDocument, conflict: &Conflict) -> Vec<Operation> {
    conflict
        .operation_ids
        .iter()
        .filter_map(|id| queue.get_operation(id).cloned())
        .collect()
}

fn live_parties(queue: &QueueDocument, conflict: &Conflict) -> Vec<Operation> {
    parties(queue, conflict)
        .into_iter()
        .filter(|op| !op.is_terminal())
        .collect()
}

fn non_cancelled(queue: &QueueDocument, conflict: &Conflict) -> Vec<Operation> {
    parties(queue, conflict)
        .into_iter()
        .filter(|op| op.status != OperationStatus::Cancelled)
        .collect()
}

fn ids_except(ops: &[Operation], keep_id: &str) -> Vec<String> {
    ops.iter()
        .filter(|op| op.id != keep_id)
        .map(|op| op.id.clone())
        .collect()
}

/// Cancel the listed operations that are not terminal yet.
fn cancel_live(
    queue: &mut QueueDocument,
    ids: &[String],
    now: DateTime<Utc>,
    reason: &str,
) -> Result<(), ApiError> {
    for id in ids {
        if let Some(op) = queue.get_operation_mut(id) {
            if !op.is_terminal() {
                op.cancel(now, reason)?;
                debug!(operation_id = %op.id, reason, "Cancelled operation");
            }
        }
    }
    Ok(())
}

/// Higher priority first without breaking dependencies among the parties.
fn reorder_parties(queue: &mut QueueDocument, conflict: &Conflict) -> Result<bool, ApiError> {
    let live = live_parties(queue, conflict);
    if live.len() < 2 {
        return Ok(true);
    }

    let index: HashMap<&str, usize> = live
        .iter()
        .enumerate()
        .map(|(i, op)| (op.id.as_str(), i))
        .collect();
    let mut blockers: Vec<usize> = live
        .iter()
        .map(|op| {
            op.dependencies
                .iter()
                .filter(|dep| index.contains_key(dep.as_str()))
                .count()
        })
        .collect();

    let mut order: Vec<usize> = Vec::with_capacity(live.len());
    let mut placed = vec![false; live.len()];
    while order.len() < live.len() {
        let next = (0..live.len())
            .filter(|&i| !placed[i] && blockers[i] == 0)
            .min_by(|&a, &b| {
                live[b]
                    .priority
                    .cmp(&live[a].priority)
                    .then_with(|| by_age(&live[a], &live[b]))
            });
        let Some(next) = next else {
            warn!(conflict_id = %conflict.id, "Cannot reorder parties with a dependency cycle");
            return Ok(false);
        };
        placed[next] = true;
        order.push(next);
        for (i, op) in live.iter().enumerate() {
            if op.dependencies.iter().any(|dep| dep == &live[next].id) {
                blockers[i] = blockers[i].saturating_sub(1);
            }
        }
    }

    let mut slots: Vec<DateTime<Utc>> = live.iter().map(|op| op.timestamp).collect();
    slots.sort();
    for (slot, position) in slots.into_iter().zip(order) {
        if let Some(op) = queue.get_operation_mut(&live[position].id) {
            op.timestamp = slot;
        }
    }
    Ok(true)
}

/// Union the two parties' content into the later one and cancel the earlier.
fn merge_parties(
    queue: &mut QueueDocument,
    conflict: &Conflict,
    now: DateTime<Utc>,
) -> Result<bool, ApiError> {
    if conflict.conflict_type != ConflictType::ConcurrentModification {
        return Ok(false);
    }
    let mut live = live_parties(queue, conflict);
    if live.len() != 2 {
        return Ok(false);
    }
    live.sort_by(by_age);
    let (earlier, later) = (&live[0], &live[1]);
    let (Some(left), Some(right)) = (earlier.params.content(), later.params.content()) else {
        return Ok(false);
    };
    let Some(merged) = merge_lines(left, right) else {
        debug!(conflict_id = %conflict.id, "Merge irreconcilable, edits overlap");
        return Ok(false);
    };

    let (earlier_id, later_id) = (earlier.id.clone(), later.id.clone());
    if let Some(op) = queue.get_operation_mut(&later_id) {
        if let Some(content) = op.params.content_mut() {
            *content = merged;
        }
        op.metadata
            .insert(META_MERGED_FROM.to_string(), Value::String(earlier_id.clone()));
    }
    cancel_live(
        queue,
        &[earlier_id],
        now,
        &format!("Conflict {}: merged into {}", conflict.id, later_id),
    )?;
    Ok(true)
}
