//! Piece bags: unbiased permutations of the seven-piece alphabet.
//!
//! Fairness comes from delivering the *same* array to every participant of a
//! match, not from seeding. Bags are drawn from a general-purpose RNG and no
//! per-match RNG state is kept.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::protocol::Piece;

/// Number of pieces in one bag.
pub const BAG_SIZE: usize = Piece::ALL.len();

/// Bags concatenated into the opening sequence sent with `start`.
pub const OPENING_BAGS: usize = 3;

/// Bags appended to every queue on each `lines_cleared` event.
pub const REFILL_BAGS: usize = 1;

/// Draw one bag: a uniformly random permutation of [`Piece::ALL`].
pub fn draw_bag<R: Rng + ?Sized>(rng: &mut R) -> [Piece; BAG_SIZE] {
    let mut bag = Piece::ALL;
    bag.shuffle(rng);
    bag
}

/// Concatenate `bags` independently drawn bags.
pub fn draw_sequence<R: Rng + ?Sized>(rng: &mut R, bags: usize) -> Vec<Piece> {
    let mut sequence = Vec::with_capacity(bags * BAG_SIZE);
    for _ in 0..bags {
        sequence.extend_from_slice(&draw_bag(rng));
    }
    sequence
}

/// Opening sequence for a match start, using the thread-local RNG.
pub fn opening_sequence() -> Vec<Piece> {
    draw_sequence(&mut rand::thread_rng(), OPENING_BAGS)
}

/// Refill sequence pushed after a clear, using the thread-local RNG.
pub fn refill_sequence() -> Vec<Piece> {
    draw_sequence(&mut rand::thread_rng(), REFILL_BAGS)
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
    use std::collections::HashSet;

    fn is_permutation(chunk: &[Piece]) -> bool {
        let distinct: HashSet<_> = chunk.iter().copied().collect();
        chunk.len() == BAG_SIZE && distinct.len() == BAG_SIZE
    }

    #[test]
    fn opening_sequence_is_three_full_bags() {
        let sequence = opening_sequence();
        assert_eq!(sequence.len(), 21);
        for chunk in sequence.chunks(BAG_SIZE) {
            assert!(is_permutation(chunk), "not a bag: {chunk:?}");
        }
    }

    #[test]
    fn refill_is_one_full_bag() {
        let refill = refill_sequence();
        assert!(is_permutation(&refill));
    }

    #[test]
    fn shuffle_reaches_every_first_piece() {
        // 7 outcomes, 2_000 draws: missing one has probability ~7 * (6/7)^2000.
        let mut rng = rand::thread_rng();
        let firsts: HashSet<Piece> = (0..2_000).map(|_| draw_bag(&mut rng)[0]).collect();
        assert_eq!(firsts.len(), BAG_SIZE);
    }
}
