//! Garbage owed to the opponent for a line clear.

use crate::protocol::MatchMode;

/// Standard versus table, indexed by cleared lines. Counts past the end
/// clamp to the last entry.
const STANDARD_TABLE: [u32; 5] = [0, 0, 1, 2, 4];

/// Garbage rows inflicted on the other participant when the sender clears
/// `lines` rows. Pure; negative inputs yield zero.
pub fn garbage_for(mode: MatchMode, lines: i64) -> u32 {
    if lines <= 0 {
        return 0;
    }
    match mode {
        MatchMode::StandardVersus => {
            let index = usize::try_from(lines).unwrap_or(usize::MAX);
            STANDARD_TABLE
                .get(index)
                .or_else(|| STANDARD_TABLE.last())
                .copied()
                .unwrap_or(0)
        }
        MatchMode::ProgressionVersus => u32::try_from(lines).unwrap_or(u32::MAX),
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

    #[test]
    fn standard_table() {
        let got: Vec<u32> = (0..=5)
            .map(|n| garbage_for(MatchMode::StandardVersus, n))
            .collect();
        assert_eq!(got, vec![0, 0, 1, 2, 4, 4]);
    }

    #[test]
    fn standard_clamps_huge_and_negative_counts() {
        assert_eq!(garbage_for(MatchMode::StandardVersus, i64::MAX), 4);
        assert_eq!(garbage_for(MatchMode::StandardVersus, -3), 0);
    }

    #[test]
    fn progression_is_identity_floored_at_zero() {
        assert_eq!(garbage_for(MatchMode::ProgressionVersus, 0), 0);
        assert_eq!(garbage_for(MatchMode::ProgressionVersus, 3), 3);
        assert_eq!(garbage_for(MatchMode::ProgressionVersus, 9), 9);
        assert_eq!(garbage_for(MatchMode::ProgressionVersus, -2), 0);
        assert_eq!(garbage_for(MatchMode::ProgressionVersus, i64::MAX), u32::MAX);
    }
}
