//! Processing order and eligibility.

use crate::mailbox::QueueDocument;
use crate::operation::{Operation, OperationStatus};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Priority descending, then creation ascending, then id.
pub fn processing_cmp(a: &Operation, b: &Operation) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.timestamp.cmp(&b.timestamp))
        .then_with(|| a.id.cmp(&b.id))
}

/// Operations that may run now, in processing order.
///
/// Eligible means pending, every dependency completed (or compacted away),
/// not party to an unresolved conflict, and past any retry or defer time.
pub fn processing_order(queue: &QueueDocument, now: DateTime<Utc>) -> Vec<&Operation> {
    let statuses: HashMap<&str, OperationStatus> = queue
        .operations
        .iter()
        .map(|op| (op.id.as_str(), op.status))
        .collect();
    let conflicted: HashSet<&str> = queue
        .active_conflicts()
        .flat_map(|c| c.operation_ids.iter().map(String::as_str))
        .collect();

    let mut eligible: Vec<&Operation> = queue
        .operations
        .iter()
        .filter(|op| is_eligible(op, &statuses, &conflicted, now))
        .collect();
    eligible.sort_by(|a, b| processing_cmp(a, b));
    eligible
}

fn is_eligible(
    op: &Operation,
    statuses: &HashMap<&str, OperationStatus>,
    conflicted: &HashSet<&str>,
    now: DateTime<Utc>,
) -> bool {
    op.status == OperationStatus::Pending
        && op.dependencies.iter().all(|dep| {
            statuses
                .get(dep.as_str())
                .map_or(true, |status| *status == OperationStatus::Completed)
        })
        && !conflicted.contains(op.id.as_str())
        && op.next_retry_at.map_or(true, |at| now >= at)
        && op.deferred_until().map_or(true, |until| now >= until)
}
