//! Seeded level assignment for new nodes.
//!
//! Levels follow the exponential draw `⌊−ln(U(0,1)) · mL⌋` with
//! `mL = 1/ln(M)`, capped by the configured maximum. The xorshift state is
//! seeded from the builder options, so a serialized rebuild with the same
//! seed reproduces the same level sequence.

use std::sync::atomic::{AtomicU64, Ordering};

/// Deterministic level generator shared by all inserting threads.
#[derive(Debug)]
pub struct LevelGenerator {
    state: AtomicU64,
    mult: f64,
    max_level: u8,
}

/// Advances an xorshift64 state.
#[inline]
pub(crate) fn xorshift64(mut state: u64) -> u64 {
    if state == 0 {
        state = 0x853c_49e6_748f_ea9b;
    }
    state ^= state << 13;
    state ^= state >> 7;
    state ^= state << 17;
    state
}

impl LevelGenerator {
    /// Creates a generator for degree bound `m` seeded with `seed`.
    #[must_use]
    pub fn new(seed: u64, mult: f64, max_level: usize) -> Self {
        Self {
            state: AtomicU64::new(if seed == 0 { 0x853c_49e6_748f_ea9b } else { seed }),
            mult,
            max_level: u8::try_from(max_level.min(63)).expect("max_level <= 63"),
        }
    }

    /// Draws the next level.
    // Casts: -ln(uniform) is non-negative and the result is capped well
    // below u8::MAX before conversion.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn draw(&self) -> u8 {
        let state = self
            .state
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| {
                Some(xorshift64(s))
            })
            .map(xorshift64)
            .unwrap_or_else(|s| s);
        let uniform = ((state as f64) / (u64::MAX as f64)).max(f64::MIN_POSITIVE);
        let level = (-uniform.ln() * self.mult).floor() as usize;
        level.min(usize::from(self.max_level)) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_for_seed() {
        let mult = 1.0 / 16.0_f64.ln();
        let a = LevelGenerator::new(42, mult, 16);
        let b = LevelGenerator::new(42, mult, 16);
        let seq_a: Vec<u8> = (0..100).map(|_| a.draw()).collect();
        let seq_b: Vec<u8> = (0..100).map(|_| b.draw()).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn test_distribution_is_mostly_level_zero() {
        let mult = 1.0 / 16.0_f64.ln();
        let generator = LevelGenerator::new(7, mult, 16);
        let draws: Vec<u8> = (0..10_000).map(|_| generator.draw()).collect();
        let zeros = draws.iter().filter(|&&l| l == 0).count();
        // P(level = 0) = 1 - 1/M = 93.75% for M = 16.
        assert!(zeros > 9_000, "only {zeros} zero draws");
        assert!(draws.iter().all(|&l| l <= 16));
    }

    #[test]
    fn test_cap_respected() {
        let generator = LevelGenerator::new(3, 100.0, 4);
        assert!((0..1000).map(|_| generator.draw()).all(|l| l <= 4));
    }
}
