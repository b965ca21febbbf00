#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Property-based tests for garbage, levels, score saturation and
//! checkpoint monotonicity.

use proptest::prelude::*;
use stackfall_server::garbage::garbage_for;
use stackfall_server::run::{Checkpoint, StartRunRequest};
use stackfall_server::scoring::{apply_checkpoint, level_for, SCORE_CEILING};
use stackfall_server::{MatchMode, MemoryRunStore, RunStore, RunTokenSigner, RunVerifier};

fn any_multiplier() -> impl Strategy<Value = f64> {
    prop_oneof![
        0.0f64..10.0,
        Just(f64::MAX),
        Just(f64::INFINITY),
        Just(f64::NAN),
        Just(-1.0),
        any::<f64>(),
    ]
}

/// Property: standard garbage follows the clear table, clamped at its end
#[test]
fn prop_standard_garbage_table() {
    proptest!(|(lines in any::<i64>())| {
        let expected = match lines {
            i64::MIN..=1 => 0,
            2 => 1,
            3 => 2,
            _ => 4,
        };
        prop_assert_eq!(garbage_for(MatchMode::StandardVersus, lines), expected);
    });
}

/// Property: progression garbage is the line count floored at zero
#[test]
fn prop_progression_garbage_is_floored_identity() {
    proptest!(|(lines in -1_000i64..1_000_000)| {
        let expected = u32::try_from(lines.max(0)).unwrap();
        prop_assert_eq!(garbage_for(MatchMode::ProgressionVersus, lines), expected);
    });
}

/// Property: level is floor(lines / 10) + 1, never below 1
#[test]
fn prop_level_formula() {
    proptest!(|(lines in 0u64..10_000_000)| {
        let level = level_for(lines);
        prop_assert!(level >= 1);
        prop_assert_eq!(level, lines / 10 + 1);
    });
}

/// Property: any sequence of reports keeps score within [0, ceiling] and
/// never lets score or lines decrease
#[test]
fn prop_score_saturates_and_never_decreases() {
    proptest!(|(steps in prop::collection::vec((any::<u64>(), any_multiplier()), 1..40))| {
        let (mut score, mut lines) = (0u64, 0u64);
        for (reported, multiplier) in steps {
            let update = apply_checkpoint(score, lines, reported, multiplier);
            prop_assert!(update.score <= SCORE_CEILING);
            prop_assert!(update.score >= score);
            prop_assert!(update.lines >= lines);
            prop_assert_eq!(update.level, level_for(update.lines));
            score = update.score;
            lines = update.lines;
        }
    });
}

/// Property: through the verifier, stored lines track the running maximum
/// of reports and a smaller report changes nothing
#[test]
fn prop_verifier_checkpoints_are_monotonic() {
    proptest!(ProptestConfig::with_cases(64), |(reports in prop::collection::vec(0u64..500, 1..20))| {
        tokio_test::block_on(async {
            let v = RunVerifier::new(MemoryRunStore::new(), RunTokenSigner::new("prop"));
            let started = v
                .start(1, StartRunRequest { seed: "P".into(), state: None })
                .await
                .unwrap();
            let id = started.run.id.as_str();
            let token = Some(started.run_token.as_str());

            let mut high = 0u64;
            for reported in reports {
                let before = v.store().get(id).await.unwrap().unwrap();
                let outcome = v.checkpoint(1, id, token, Checkpoint::lines(reported)).await.unwrap();
                high = high.max(reported);
                assert_eq!(outcome.lines, high);
                assert_eq!(outcome.score, (high * 100).to_string());
                assert_eq!(outcome.level, high / 10 + 1);
                if reported <= before.lines {
                    assert_eq!(outcome.score, before.score.to_string());
                }
            }
        });
    });
}
