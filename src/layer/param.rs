//! Learnable arrays.
//!
//! Every weight array is paired with a momentum accumulator of the same shape. The update pass
//! only ever adds `-learning_rate · gradient` to the accumulator; [`Param::apply_momentum`] then
//! moves the accumulated step into the weights and decays it for the next batch.

use std::io::{self, Read, Write};

use crate::Real;
use crate::random::Random;

/// Standard deviation of the initial weights.
pub const INIT_STDDEV: Real = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    weights: Vec<Real>,
    momentum: Vec<Real>,
}

impl Param {
    pub fn zeros(len: usize) -> Self {
        Self {
            weights: vec![0.0; len],
            momentum: vec![0.0; len],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    #[inline]
    pub fn weights(&self) -> &[Real] {
        &self.weights
    }

    #[inline]
    pub fn weights_mut(&mut self) -> &mut [Real] {
        &mut self.weights
    }

    #[inline]
    pub fn momentum(&self) -> &[Real] {
        &self.momentum
    }

    #[inline]
    pub fn momentum_mut(&mut self) -> &mut [Real] {
        &mut self.momentum
    }

    /// `w += m; m *= momentum`.
    pub fn apply_momentum(&mut self, momentum: Real) {
        for (w, m) in self.weights.iter_mut().zip(self.momentum.iter_mut()) {
            *w += *m;
            *m *= momentum;
        }
    }

    pub fn reset_momentum(&mut self) {
        self.momentum.fill(0.0);
    }

    pub fn randomize(&mut self, random: &mut Random) {
        random.gaussian(0.0, INIT_STDDEV, &mut self.weights);
        self.reset_momentum();
    }

    /// Weights, then momentum, as little-endian `f64`.
    pub(crate) fn write(&self, writer: &mut dyn Write) -> io::Result<()> {
        for v in self.weights.iter().chain(&self.momentum) {
            writer.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    pub(crate) fn read(&mut self, reader: &mut dyn Read) -> io::Result<()> {
        read_reals(reader, &mut self.weights)?;
        read_reals(reader, &mut self.momentum)
    }
}

fn read_reals(reader: &mut dyn Read, out: &mut [Real]) -> io::Result<()> {
    let mut buf = vec![0u8; out.len() * size_of::<Real>()];
    reader.read_exact(&mut buf)?;
    for (v, bytes) in out.iter_mut().zip(buf.chunks_exact(size_of::<Real>())) {
        let mut raw = [0u8; size_of::<Real>()];
        raw.copy_from_slice(bytes);
        *v = Real::from_le_bytes(raw);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_momentum_moves_the_step_then_decays() {
        let mut p = Param::zeros(2);
        p.weights_mut().copy_from_slice(&[1.0, 2.0]);
        p.momentum_mut().copy_from_slice(&[0.5, -1.0]);

        p.apply_momentum(0.9);
        assert_eq!(p.weights(), &[1.5, 1.0]);
        assert_eq!(p.momentum(), &[0.45, -0.9]);

        p.reset_momentum();
        assert_eq!(p.momentum(), &[0.0, 0.0]);
    }

    #[test]
    fn randomize_is_seeded_and_clears_momentum() {
        let mut a = Param::zeros(16);
        a.momentum_mut().fill(3.0);
        a.randomize(&mut Random::new(1));
        let mut b = Param::zeros(16);
        b.randomize(&mut Random::new(1));
        assert_eq!(a, b);
        assert!(a.weights().iter().any(|&w| w != 0.0));
        assert!(a.momentum().iter().all(|&m| m == 0.0));
    }

    #[test]
    fn binary_round_trip_is_bit_exact() {
        let mut p = Param::zeros(5);
        p.randomize(&mut Random::new(9));
        p.momentum_mut()[3] = -1.0 / 3.0;

        let mut bytes = Vec::new();
        p.write(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 2 * 5 * 8);

        let mut q = Param::zeros(5);
        q.read(&mut bytes.as_slice()).unwrap();
        assert_eq!(p, q);
        assert!(q.read(&mut &bytes[..8]).is_err());
    }
}
