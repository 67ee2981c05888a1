//! The single random stream of a run.
//!
//! Weight initialisation, learning-rate probing and epoch shuffling all draw from one seeded
//! generator, so a seed reproduces a run. The stream can be reset to a seed and skipped ahead.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::Real;

#[derive(Debug, Clone)]
pub struct Random {
    rng: StdRng,
}

impl Random {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Restart the stream from `seed`.
    pub fn reset(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Discard the next `n` draws.
    pub fn skip(&mut self, n: usize) {
        for _ in 0..n {
            let _: u64 = self.rng.r#gen();
        }
    }

    /// Fill `out` with samples from N(mean, sd²).
    pub fn gaussian(&mut self, mean: Real, sd: Real, out: &mut [Real]) {
        assert!(
            sd.is_finite() && sd >= 0.0,
            "standard deviation must be finite and >= 0, got {sd}"
        );
        let normal = Normal::new(mean, sd).expect("validated normal parameters");
        for v in out {
            *v = normal.sample(&mut self.rng);
        }
    }

    /// Uniform integer in `0..n`.
    pub fn uniform(&mut self, n: usize) -> usize {
        assert!(n > 0, "uniform range must be non-empty");
        self.rng.gen_range(0..n)
    }

    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }
}

/// Mix `value` into `seed` (boost-style `hash_combine`).
pub fn hash_combine(seed: u64, value: u64) -> u64 {
    seed ^ value
        .wrapping_add(0x9e37_79b9)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_reproduces_the_stream() {
        let mut random = Random::new(7);
        let mut a = [0.0; 5];
        random.gaussian(0.0, 0.1, &mut a);
        random.reset(7);
        let mut b = [0.0; 5];
        random.gaussian(0.0, 0.1, &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn skip_advances_the_stream() {
        let mut a = Random::new(3);
        let mut b = Random::new(3);
        b.skip(1);
        let _: u64 = a.rng.r#gen();
        assert_eq!(a.uniform(1_000_000), b.uniform(1_000_000));
    }

    #[test]
    fn hash_combine_depends_on_both_inputs() {
        assert_ne!(hash_combine(1, 0), hash_combine(1, 1));
        assert_ne!(hash_combine(1, 1), hash_combine(2, 1));
        assert_eq!(hash_combine(5, 9), hash_combine(5, 9));
    }
}
