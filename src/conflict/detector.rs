//! Conflict Detector
//!
//! Pairwise rules between a candidate operation and the operations already
//! queued. Detection never mutates operations; it only mints [`Conflict`]
//! records for the coordinator to persist.

use crate::conflict::similarity;
use crate::conflict::{Conflict, ConflictType};
use crate::operation::{Operation, OperationKind, OperationStatus, Priority};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Two content edits closer than this are concurrent (seconds)
    #[serde(default = "default_window_secs")]
    pub concurrent_window_secs: i64,
    /// A pending operation older than this is outdated (seconds)
    #[serde(default = "default_stale_secs")]
    pub stale_after_secs: i64,
    /// Minimum similarity for two operations to count as duplicates
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f64,
}

fn default_window_secs() -> i64 {
    60
}

fn default_stale_secs() -> i64 {
    300
}

fn default_threshold() -> f64 {
    0.95
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            concurrent_window_secs: default_window_secs(),
            stale_after_secs: default_stale_secs(),
            similarity_threshold: default_threshold(),
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(format!(
                "similarity_threshold must be within [0, 1], got {}",
                self.similarity_threshold
            ));
        }
        if self.concurrent_window_secs < 0 || self.stale_after_secs < 0 {
            return Err("detector windows cannot be negative".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    config: DetectorConfig,
}

impl ConflictDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Conflicts between `candidate` and `existing`.
    pub fn detect_conflicts(
        &self,
        candidate: &Operation,
        existing: &[Operation],
        now: DateTime<Utc>,
    ) -> Vec<Conflict> {
        self.detect_with_conflicts(candidate, existing, &[], now)
    }

    /// Like [`detect_conflicts`](Self::detect_conflicts), with the queue's
    /// current conflicts so dependency rules can see unresolved parties.
    pub fn detect_with_conflicts(
        &self,
        candidate: &Operation,
        existing: &[Operation],
        conflicts: &[Conflict],
        now: DateTime<Utc>,
    ) -> Vec<Conflict> {
        let conflicted: HashSet<&str> = conflicts
            .iter()
            .filter(|c| !c.resolved)
            .flat_map(|c| c.operation_ids.iter().map(String::as_str))
            .collect();

        let mut found = Vec::new();
        for other in existing.iter().filter(|op| op.id != candidate.id) {
            self.detect_pair(candidate, other, &conflicted, now, &mut found);
        }
        if let Some(cycle) = find_cycle(candidate, existing) {
            found.push(self.finish(
                Conflict::new(
                    ConflictType::CircularDependency,
                    candidate.resource_path(),
                    format!("Circular dependency: {}", cycle.join(" -> ")),
                    cycle_parties(&cycle),
                    now,
                ),
                candidate,
                existing,
            ));
        }

        if !found.is_empty() {
            debug!(
                operation_id = %candidate.id,
                conflicts = found.len(),
                "Detected conflicts for operation"
            );
        }
        found
    }

    /// Re-run detection over a whole queue, skipping pairs already recorded.
    ///
    /// Catches conflicts that arise over time (a dependency failing, a pending
    /// operation going stale).
    pub fn scan(
        &self,
        operations: &[Operation],
        conflicts: &[Conflict],
        now: DateTime<Utc>,
    ) -> Vec<Conflict> {
        let mut fresh: Vec<Conflict> = Vec::new();
        for (index, candidate) in operations.iter().enumerate() {
            if candidate.is_terminal() {
                continue;
            }
            let earlier = &operations[..index];
            for conflict in self.detect_with_conflicts(candidate, earlier, conflicts, now) {
                let known = conflicts.iter().any(|c| c.same_parties(&conflict))
                    || fresh.iter().any(|c| c.same_parties(&conflict));
                if !known {
                    fresh.push(conflict);
                }
            }
        }
        fresh
    }

    fn detect_pair(
        &self,
        candidate: &Operation,
        other: &Operation,
        conflicted: &HashSet<&str>,
        now: DateTime<Utc>,
        found: &mut Vec<Conflict>,
    ) {
        if candidate.kind() == OperationKind::Heartbeat || other.kind() == OperationKind::Heartbeat
        {
            return;
        }

        let both_live = !candidate.is_terminal() && !other.is_terminal();
        let same_resource = candidate.resource_path() == other.resource_path();
        let parties = || vec![other.id.clone(), candidate.id.clone()];
        let resource = candidate.resource_path();

        let duplicate = both_live
            && same_resource
            && candidate.kind() == other.kind()
            && self.is_duplicate(candidate, other);
        if duplicate {
            found.push(self.finish_pair(
                Conflict::new(
                    ConflictType::Duplicate,
                    &resource,
                    format!("{} duplicates {}", candidate.id, other.id),
                    parties(),
                    now,
                ),
                candidate,
                other,
            ));
        }

        if both_live
            && same_resource
            && !duplicate
            && candidate.kind().is_content_mutating()
            && other.kind().is_content_mutating()
            && (candidate.timestamp - other.timestamp).num_seconds().abs()
                <= self.config.concurrent_window_secs
        {
            found.push(self.finish_pair(
                Conflict::new(
                    ConflictType::ConcurrentModification,
                    &resource,
                    format!(
                        "{} and {} modify {} within {}s",
                        other.id, candidate.id, resource, self.config.concurrent_window_secs
                    ),
                    parties(),
                    now,
                ),
                candidate,
                other,
            ));
        }

        if !duplicate
            && !candidate.is_terminal()
            && other.kind().is_exclusive()
            && other.status.is_active()
            && candidate.params.spec_id().is_some()
            && candidate.params.spec_id() == other.params.spec_id()
        {
            found.push(self.finish_pair(
                Conflict::new(
                    ConflictType::ResourceLocked,
                    other.resource_path(),
                    format!("{} is locked by {} ({})", resource, other.id, other.kind()),
                    parties(),
                    now,
                ),
                candidate,
                other,
            ));
        }

        if candidate.dependencies.iter().any(|dep| dep == &other.id) {
            let reason = match other.status {
                OperationStatus::Failed => Some("failed"),
                OperationStatus::Cancelled => Some("was cancelled"),
                _ if conflicted.contains(other.id.as_str()) => Some("has an unresolved conflict"),
                _ => None,
            };
            if let Some(reason) = reason {
                found.push(self.finish_pair(
                    Conflict::new(
                        ConflictType::DependencyConflict,
                        &resource,
                        format!("{} depends on {}, which {}", candidate.id, other.id, reason),
                        parties(),
                        now,
                    ),
                    candidate,
                    other,
                ));
            }
        }

        if both_live && same_resource {
            if let (Some(mine), Some(theirs)) = (candidate.params.version(), other.params.version())
            {
                if mine != theirs {
                    found.push(self.finish_pair(
                        Conflict::new(
                            ConflictType::VersionMismatch,
                            &resource,
                            format!(
                                "{} expects version {} but {} expects version {}",
                                candidate.id, mine, other.id, theirs
                            ),
                            parties(),
                            now,
                        ),
                        candidate,
                        other,
                    ));
                }
            }
        }

        if same_resource && priority_inverted(candidate, other) {
            found.push(self.finish_pair(
                Conflict::new(
                    ConflictType::PriorityConflict,
                    &resource,
                    format!(
                        "Lower-priority work on {} is running ahead of higher-priority work",
                        resource
                    ),
                    parties(),
                    now,
                ),
                candidate,
                other,
            ));
        }

        if !candidate.is_terminal()
            && same_resource
            && candidate.kind() == other.kind()
            && other.status == OperationStatus::Pending
            && now - other.timestamp > Duration::seconds(self.config.stale_after_secs)
        {
            found.push(self.finish_pair(
                Conflict::new(
                    ConflictType::OutdatedOperation,
                    &resource,
                    format!(
                        "{} has been pending since {} and is superseded by {}",
                        other.id,
                        other.timestamp.to_rfc3339(),
                        candidate.id
                    ),
                    parties(),
                    now,
                ),
                candidate,
                other,
            ));
        }
    }

    fn is_duplicate(&self, a: &Operation, b: &Operation) -> bool {
        let threshold = self.config.similarity_threshold;
        match (a.params.content(), b.params.content()) {
            (Some(left), Some(right)) => similarity::is_similar(left, right, threshold),
            // Structured parameters are identifiers; near-equal ids name different targets.
            _ => a.params.fingerprint() == b.params.fingerprint(),
        }
    }

    fn finish_pair(&self, conflict: Conflict, a: &Operation, b: &Operation) -> Conflict {
        if a.priority == Priority::Urgent || b.priority == Priority::Urgent {
            let severity = conflict.severity.escalated();
            conflict.with_severity(severity)
        } else {
            conflict
        }
    }

    fn finish(&self, conflict: Conflict, candidate: &Operation, existing: &[Operation]) -> Conflict {
        let urgent = candidate.priority == Priority::Urgent
            || existing
                .iter()
                .filter(|op| conflict.involves(&op.id))
                .any(|op| op.priority == Priority::Urgent);
        if urgent {
            let severity = conflict.severity.escalated();
            conflict.with_severity(severity)
        } else {
            conflict
        }
    }
}

/// One side in progress at lower priority while the other waits at higher.
fn priority_inverted(a: &Operation, b: &Operation) -> bool {
    let inverted = |running: &Operation, waiting: &Operation| {
        running.status == OperationStatus::InProgress
            && waiting.status == OperationStatus::Pending
            && running.priority < waiting.priority
    };
    inverted(a, b) || inverted(b, a)
}

/// Path from the candidate back to itself through dependency edges, if any.
fn find_cycle(candidate: &Operation, existing: &[Operation]) -> Option<Vec<String>> {
    if candidate.dependencies.is_empty() {
        return None;
    }
    let mut graph: HashMap<&str, &[String]> = existing
        .iter()
        .map(|op| (op.id.as_str(), op.dependencies.as_slice()))
        .collect();
    graph.insert(candidate.id.as_str(), candidate.dependencies.as_slice());

    // Iterative DFS carrying the path.
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<(&str, Vec<&str>)> = candidate
        .dependencies
        .iter()
        .map(|dep| (dep.as_str(), vec![candidate.id.as_str(), dep.as_str()]))
        .collect();
    while let Some((node, path)) = stack.pop() {
        if node == candidate.id {
            return Some(path.into_iter().map(str::to_string).collect());
        }
        if !visited.insert(node) {
            continue;
        }
        if let Some(deps) = graph.get(node) {
            for dep in deps.iter() {
                let mut next = path.clone();
                next.push(dep.as_str());
                stack.push((dep.as_str(), next));
            }
        }
    }
    None
}

/// Cycle path minus the repeated closing id.
fn cycle_parties(cycle: &[String]) -> Vec<String> {
    let mut parties: Vec<String> = Vec::new();
    for id in cycle {
        if !parties.contains(id) {
            parties.push(id.clone());
        }
    }
    parties
}
