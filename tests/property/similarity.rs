//! Property-based tests for text similarity and line merging

use opsync::conflict::merge::merge_lines;
use opsync::conflict::similarity::{bounded_levenshtein, levenshtein, similarity};
use proptest::prelude::*;

/// Identical strings are fully similar; similarity is symmetric and within [0, 1].
#[test]
fn test_similarity_properties() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&("[a-z \n]{0,40}", "[a-z \n]{0,40}"), |(a, b)| {
            prop_assert_eq!(similarity(&a, &a), 1.0);
            let ab = similarity(&a, &b);
            prop_assert!((0.0..=1.0).contains(&ab));
            prop_assert!((ab - similarity(&b, &a)).abs() < 1e-12);
            if a != b {
                prop_assert!(ab < 1.0);
            }
            Ok(())
        })
        .unwrap();
}

/// The bounded distance agrees with the full one whenever it answers.
#[test]
fn test_bounded_levenshtein_agrees() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&("[abc]{0,20}", "[abc]{0,20}", 0usize..25), |(a, b, max)| {
            let full = levenshtein(&a, &b);
            match bounded_levenshtein(&a, &b, max) {
                Some(d) => {
                    prop_assert_eq!(d, full);
                    prop_assert!(d <= max);
                }
                None => prop_assert!(full > max),
            }
            Ok(())
        })
        .unwrap();
}

/// Appending lines on one side only always merges, and keeps every line of both sides.
#[test]
fn test_one_sided_append_merges() {
    let mut runner = proptest::test_runner::TestRunner::default();
    let lines = proptest::collection::vec("[a-z]{1,6}", 0..8);

    runner
        .run(&(lines.clone(), lines), |(base, added)| {
            let earlier = base.join("\n");
            let later = base
                .iter()
                .chain(added.iter())
                .cloned()
                .collect::<Vec<_>>()
                .join("\n");
            let merged = merge_lines(&earlier, &later);
            prop_assert_eq!(merged.as_deref(), Some(later.as_str()));
            Ok(())
        })
        .unwrap();
}
