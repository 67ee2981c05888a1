//! Metrics.
//!
//! Language model quality is reported as perplexity: `exp(-log P / N)` over the `N` predicted
//! (running) words of a corpus. Metrics are evaluation helpers; they do not participate in
//! backprop.

use std::ops::AddAssign;

use crate::Real;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
/// Running sum of natural-log probabilities.
pub struct LogProbability {
    log_probability: Real,
    num_running_words: usize,
}

impl LogProbability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the log probability of `num_words` predictions.
    pub fn add(&mut self, log_probability: Real, num_words: usize) {
        self.log_probability += log_probability;
        self.num_running_words += num_words;
    }

    pub fn log_probability(&self) -> Real {
        self.log_probability
    }

    pub fn num_running_words(&self) -> usize {
        self.num_running_words
    }

    /// `exp(-log P / N)`. NaN when nothing has been added.
    pub fn perplexity(&self) -> Real {
        (-self.log_probability / self.num_running_words as Real).exp()
    }
}

impl AddAssign for LogProbability {
    fn add_assign(&mut self, other: Self) {
        self.add(other.log_probability, other.num_running_words);
    }
}

/// `x` is neither infinite, NaN, nor below the smallest positive normal value.
pub fn is_finite_number(x: Real) -> bool {
    x.is_finite() && x >= Real::MIN_POSITIVE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perplexity_of_uniform_predictions_is_the_vocabulary_size() {
        let mut metric = LogProbability::new();
        metric.add(3.0 * (0.25_f64).ln(), 3);
        metric += LogProbability {
            log_probability: (0.25_f64).ln(),
            num_running_words: 1,
        };
        assert_eq!(metric.num_running_words(), 4);
        assert!((metric.perplexity() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn finite_numbers_exclude_nan_infinity_and_underflow() {
        assert!(is_finite_number(12.5));
        assert!(!is_finite_number(Real::NAN));
        assert!(!is_finite_number(Real::INFINITY));
        assert!(!is_finite_number(0.0));
        assert!(LogProbability::new().perplexity().is_nan());
    }
}
