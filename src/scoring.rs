//! Server-side score arithmetic for runs.
//!
//! Every function here is pure. Scores are integers in `0..=SCORE_CEILING`;
//! anything that would leave that range clamps instead of wrapping, whatever
//! multiplier the client reports.

use crate::run::RunStatus;

/// Largest storable score (the largest signed 64-bit integer).
pub const SCORE_CEILING: u64 = i64::MAX as u64;

/// Base points per newly cleared line, before the multiplier.
pub const POINTS_PER_LINE: f64 = 100.0;

/// Lines needed per level.
pub const LINES_PER_LEVEL: u64 = 10;

/// Mutation that doubles the checkpoint multiplier while no bombs are held.
pub const ZERO_BOMB_BOOST: &str = "zero_bomb_boost";

/// Mutation that doubles the final score of a run finished without bombs.
pub const NO_BOMB_RUN: &str = "no_bomb_run";

/// Result of applying one checkpoint to a stored run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreUpdate {
    pub score: u64,
    pub lines: u64,
    pub level: u64,
}

/// `max(1, floor(lines / 10) + 1)`.
pub fn level_for(lines: u64) -> u64 {
    (lines / LINES_PER_LEVEL).saturating_add(1)
}

/// Clamp a floating-point amount into the storable score range.
///
/// NaN and negatives become zero.
pub fn clamp_score(value: f64) -> u64 {
    if value.is_nan() || value <= 0.0 {
        return 0;
    }
    if value >= SCORE_CEILING as f64 {
        return SCORE_CEILING;
    }
    // In range and non-negative; `as` truncates the fraction only.
    value as u64
}

/// Saturating add kept under the ceiling.
pub fn add_points(score: u64, points: u64) -> u64 {
    score.saturating_add(points).min(SCORE_CEILING)
}

/// Multiplier actually applied to a checkpoint.
pub fn effective_multiplier(score_multiplier: f64, mutations: &[String], bombs: u64) -> f64 {
    let boosted = bombs == 0 && mutations.iter().any(|m| m == ZERO_BOMB_BOOST);
    if boosted {
        score_multiplier * 2.0
    } else {
        score_multiplier
    }
}

/// Points for `delta_lines` new lines, rounded to the nearest integer.
pub fn points_for(delta_lines: u64, multiplier: f64) -> u64 {
    let raw = delta_lines as f64 * POINTS_PER_LINE * multiplier;
    clamp_score(raw.round())
}

/// Apply a reported line count to a stored score and line count.
///
/// A report below the stored count is ignored: lines never decrease and no
/// points are awarded.
pub fn apply_checkpoint(
    stored_score: u64,
    stored_lines: u64,
    reported_lines: u64,
    multiplier: f64,
) -> ScoreUpdate {
    let lines = stored_lines.max(reported_lines);
    let delta = lines - stored_lines;
    let score = if delta == 0 {
        stored_score.min(SCORE_CEILING)
    } else {
        add_points(stored_score, points_for(delta, multiplier))
    };
    ScoreUpdate {
        score,
        lines,
        level: level_for(lines),
    }
}

/// Score stored when a run ends with `status`.
pub fn final_score(score: u64, status: RunStatus, mutations: &[String], bombs_used: u64) -> u64 {
    let bonus = status == RunStatus::Finished
        && bombs_used == 0
        && mutations.iter().any(|m| m == NO_BOMB_RUN);
    if bonus {
        score.saturating_mul(2).min(SCORE_CEILING)
    } else {
        score.min(SCORE_CEILING)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn muts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn level_examples() {
        assert_eq!(level_for(0), 1);
        assert_eq!(level_for(9), 1);
        assert_eq!(level_for(10), 2);
        assert_eq!(level_for(95), 10);
        assert_eq!(level_for(u64::MAX), u64::MAX / 10 + 1);
    }

    #[test]
    fn ten_lines_at_unit_multiplier() {
        let update = apply_checkpoint(0, 0, 10, 1.0);
        assert_eq!(
            update,
            ScoreUpdate {
                score: 1000,
                lines: 10,
                level: 2
            }
        );
    }

    #[test]
    fn regression_changes_nothing() {
        let update = apply_checkpoint(1000, 10, 5, 1.0);
        assert_eq!(update.score, 1000);
        assert_eq!(update.lines, 10);
        assert_eq!(update.level, 2);
    }

    #[test]
    fn multiplier_result_is_rounded() {
        assert_eq!(points_for(1, 1.234), 123);
        assert_eq!(points_for(1, 1.236), 124);
        assert_eq!(points_for(3, 0.333), 100);
    }

    #[test]
    fn adversarial_multipliers_clamp() {
        assert_eq!(points_for(1, f64::MAX), SCORE_CEILING);
        assert_eq!(points_for(1, f64::INFINITY), SCORE_CEILING);
        assert_eq!(points_for(1, -5.0), 0);
        assert_eq!(points_for(1, f64::NAN), 0);
        assert_eq!(add_points(SCORE_CEILING - 1, 10), SCORE_CEILING);
    }

    #[test]
    fn zero_bomb_boost_needs_zero_bombs() {
        let boost = muts(&[ZERO_BOMB_BOOST]);
        assert!((effective_multiplier(1.5, &boost, 0) - 3.0).abs() < f64::EPSILON);
        assert!((effective_multiplier(1.5, &boost, 1) - 1.5).abs() < f64::EPSILON);
        assert!((effective_multiplier(1.5, &[], 0) - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn no_bomb_run_doubles_only_clean_finishes() {
        let bonus = muts(&[NO_BOMB_RUN]);
        assert_eq!(final_score(500, RunStatus::Finished, &bonus, 0), 1000);
        assert_eq!(final_score(500, RunStatus::Finished, &bonus, 1), 500);
        assert_eq!(final_score(500, RunStatus::Abandoned, &bonus, 0), 500);
        assert_eq!(final_score(500, RunStatus::Finished, &[], 0), 500);
        assert_eq!(
            final_score(SCORE_CEILING, RunStatus::Finished, &bonus, 0),
            SCORE_CEILING
        );
    }
}
