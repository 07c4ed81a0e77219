//! Integration tests for conflict detection

use super::test_utils::update_requirements;
use chrono::{Duration, Utc};
use opsync::conflict::similarity::similarity;
use opsync::conflict::{ConflictDetector, ConflictType, DetectorConfig, ResolutionStrategy, Severity};
use opsync::operation::{Operation, OperationParams, OperationStatus, Origin, Priority};

fn detector() -> ConflictDetector {
    ConflictDetector::new(DetectorConfig::default())
}

fn spec_ops(count: usize) -> Vec<Operation> {
    let now = Utc::now();
    (0..count)
        .map(|i| {
            update_requirements(
                &format!("spec-{}", i),
                &format!("# Requirements for spec {}\n- item {}", i, i),
                now,
            )
        })
        .collect()
}

#[test]
fn test_one_duplicate_among_a_thousand() {
    let now = Utc::now();
    let existing = spec_ops(1000);
    let original = &existing[500];
    let candidate = update_requirements(
        "spec-500",
        original.params.content().unwrap(),
        now,
    );

    let mut orders = vec![existing.clone()];
    let mut reversed = existing.clone();
    reversed.reverse();
    orders.push(reversed);
    let mut rotated = existing.clone();
    rotated.rotate_left(377);
    orders.push(rotated);

    for ops in orders {
        let conflicts = detector().detect_conflicts(&candidate, &ops, now);
        assert_eq!(conflicts.len(), 1, "{:?}", conflicts);
        let conflict = &conflicts[0];
        assert_eq!(conflict.conflict_type, ConflictType::Duplicate);
        assert!(conflict.auto_resolvable);
        assert!(conflict.involves(&original.id));
        assert!(conflict.involves(&candidate.id));
        assert_eq!(conflict.recommendations[0], ResolutionStrategy::CancelConflicting);
    }
}

#[test]
fn test_identical_params_are_fully_similar() {
    let text = "Line1\nLine2\nLine3";
    assert_eq!(similarity(text, text), 1.0);
    assert_eq!(similarity("", ""), 1.0);
    assert!(similarity("Line1\nLine2", "Line1\nLine3") < 0.95);
}

#[test]
fn test_concurrent_modification_on_spec_a() {
    let t0 = Utc::now();
    let first = update_requirements("spec-a", "Line1\nLine2", t0);
    let second = update_requirements("spec-a", "Line1\nLine3", t0 + Duration::seconds(30));

    let conflicts = detector().detect_conflicts(&second, &[first.clone()], t0 + Duration::seconds(30));
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.conflict_type, ConflictType::ConcurrentModification);
    assert_eq!(conflict.severity, Severity::High);
    assert_eq!(conflict.resource_path, "specs/spec-a/requirements.md");
    assert_eq!(
        conflict.recommendations,
        vec![
            ResolutionStrategy::Merge,
            ResolutionStrategy::PreferNewer,
            ResolutionStrategy::Manual
        ]
    );
    assert!(!conflict.auto_resolvable);
}

#[test]
fn test_edits_outside_window_do_not_conflict() {
    let t0 = Utc::now();
    let first = update_requirements("spec-a", "Line1\nLine2", t0 - Duration::seconds(120));
    let second = update_requirements("spec-a", "Line1\nLine3", t0);
    let conflicts = detector().detect_conflicts(&second, &[first], t0);
    assert!(conflicts
        .iter()
        .all(|c| c.conflict_type != ConflictType::ConcurrentModification));
}

#[test]
fn test_urgent_priority_escalates_severity() {
    let t0 = Utc::now();
    let first = update_requirements("spec-a", "alpha\nbeta", t0);
    let second = update_requirements("spec-a", "gamma\ndelta", t0).with_priority(Priority::Urgent);

    let conflicts = detector().detect_conflicts(&second, &[first], t0);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].severity, Severity::Critical);
}

#[test]
fn test_delete_locks_the_spec() {
    let now = Utc::now();
    let delete = Operation::new(
        OperationParams::DeleteSpec {
            spec_id: "spec-a".to_string(),
        },
        Origin::Worker,
    );
    let edit = update_requirements("spec-a", "new body", now);
    let elsewhere = update_requirements("spec-b", "new body", now);

    let conflicts = detector().detect_conflicts(&edit, &[delete.clone()], now);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::ResourceLocked);
    assert_eq!(
        conflicts[0].recommendations,
        vec![ResolutionStrategy::Defer, ResolutionStrategy::Retry]
    );

    assert!(detector().detect_conflicts(&elsewhere, &[delete], now).is_empty());
}

#[test]
fn test_dependency_on_failed_operation() {
    let now = Utc::now();
    let mut base = update_requirements("spec-a", "body", now);
    base.status = OperationStatus::Failed;
    let dependent = Operation::new(
        OperationParams::SetCurrentSpec {
            spec_id: "spec-a".to_string(),
        },
        Origin::Client,
    )
    .with_dependencies(vec![base.id.clone()]);

    let conflicts = detector().detect_conflicts(&dependent, &[base], now);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::DependencyConflict);
    assert_eq!(conflicts[0].recommendations[0], ResolutionStrategy::Reorder);
}

#[test]
fn test_dependency_cycle_requires_manual() {
    let now = Utc::now();
    let first_id = "op-cycle-first-0001";
    let second = Operation::new(OperationParams::SyncStatus {}, Origin::Client)
        .with_id("op-cycle-second-0002")
        .with_dependencies(vec![first_id.to_string()]);
    let first = Operation::new(OperationParams::SyncStatus {}, Origin::Client)
        .with_id(first_id)
        .with_dependencies(vec![second.id.clone()]);

    let conflicts = detector().detect_conflicts(&first, &[second], now);
    let cycle = conflicts
        .iter()
        .find(|c| c.conflict_type == ConflictType::CircularDependency)
        .expect("cycle detected");
    assert_eq!(cycle.severity, Severity::Critical);
    assert!(cycle.requires_manual);
    assert_eq!(cycle.recommendations, vec![ResolutionStrategy::Manual]);
}

#[test]
fn test_heartbeats_never_conflict() {
    let now = Utc::now();
    let a = Operation::new(OperationParams::Heartbeat {}, Origin::Client);
    let b = Operation::new(OperationParams::Heartbeat {}, Origin::Client);
    assert!(detector().detect_conflicts(&a, &[b], now).is_empty());
}

#[test]
fn test_scan_skips_known_conflicts() {
    let now = Utc::now();
    let first = update_requirements("spec-a", "same body", now);
    let second = update_requirements("spec-a", "same body", now);
    let ops = vec![first, second];

    let found = detector().scan(&ops, &[], now);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].conflict_type, ConflictType::Duplicate);

    assert!(detector().scan(&ops, &found, now).is_empty());
}

#[test]
fn test_scan_finds_stale_pending_work() {
    let now = Utc::now();
    let stale = Operation::new_at(
        OperationParams::SetCurrentSpec {
            spec_id: "spec-a".to_string(),
        },
        Origin::Client,
        now - Duration::minutes(10),
    );
    let fresh = Operation::new_at(
        OperationParams::SetCurrentSpec {
            spec_id: "spec-b".to_string(),
        },
        Origin::Client,
        now,
    );

    let found = detector().scan(&[stale.clone(), fresh], &[], now);
    let outdated = found
        .iter()
        .find(|c| c.conflict_type == ConflictType::OutdatedOperation)
        .expect("outdated conflict");
    assert!(outdated.involves(&stale.id));
    assert_eq!(outdated.severity, Severity::Low);
}
