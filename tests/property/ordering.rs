//! Property-based tests for processing order

use chrono::{Duration, Utc};
use opsync::coordinator::{processing_cmp, processing_order};
use opsync::mailbox::QueueDocument;
use opsync::operation::{Operation, OperationParams, OperationStatus, Origin, Priority};
use proptest::prelude::*;

fn priority(index: u8) -> Priority {
    match index % 4 {
        0 => Priority::Low,
        1 => Priority::Normal,
        2 => Priority::High,
        _ => Priority::Urgent,
    }
}

fn status(index: u8) -> OperationStatus {
    OperationStatus::ALL[index as usize % OperationStatus::ALL.len()]
}

/// Eligible operations come out pending and sorted, whatever the stored order.
#[test]
fn test_order_is_sorted_and_input_independent() {
    let mut runner = proptest::test_runner::TestRunner::default();
    let specs = proptest::collection::vec((any::<u8>(), any::<u8>(), 0i64..600), 0..30);

    runner
        .run(&(specs, any::<usize>()), |(specs, rotation)| {
            let now = Utc::now();
            let mut queue = QueueDocument::new(now);
            for (p, s, age) in specs {
                let mut op = Operation::new_at(
                    OperationParams::SyncStatus {},
                    Origin::Client,
                    now - Duration::seconds(age),
                )
                .with_priority(priority(p));
                op.status = status(s);
                queue.operations.push(op);
            }

            let ordered: Vec<String> = processing_order(&queue, now)
                .into_iter()
                .map(|op| op.id.clone())
                .collect();
            let pending = queue
                .operations
                .iter()
                .filter(|op| op.status == OperationStatus::Pending)
                .count();
            prop_assert_eq!(ordered.len(), pending);

            let eligible = processing_order(&queue, now);
            for pair in eligible.windows(2) {
                prop_assert_ne!(processing_cmp(pair[0], pair[1]), std::cmp::Ordering::Greater);
            }

            if !queue.operations.is_empty() {
                let shift = rotation % queue.operations.len();
                queue.operations.rotate_left(shift);
            }
            let rotated: Vec<String> = processing_order(&queue, now)
                .into_iter()
                .map(|op| op.id.clone())
                .collect();
            prop_assert_eq!(rotated, ordered);
            Ok(())
        })
        .unwrap();
}
