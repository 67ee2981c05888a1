//! Recurrent connection `h_{t-1} → z_t` shared by [`Linear`](super::Linear) and
//! [`TableLookup`](super::TableLookup).
//!
//! The helper owns only the recurrent matrix. The owning layer passes its own activation and
//! delta arenas together with the slot of the current timestep.

use crate::Real;
use crate::buffer::TimeBuffer;
use crate::kernel;
use crate::layer::Param;

#[derive(Debug, Clone, PartialEq)]
pub struct Recurrency {
    dim: usize,
    weights: Param,
}

impl Recurrency {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            weights: Param::zeros(dim * dim),
        }
    }

    pub fn weights(&self) -> &Param {
        &self.weights
    }

    pub(crate) fn weights_mut(&mut self) -> &mut Param {
        &mut self.weights
    }

    /// Add `W_rec · h_{t-1}` to the pre-activations in slot `t` of `b`. No-op at slot 0.
    pub fn evaluate(&self, batch: usize, b: &mut TimeBuffer, t: usize) {
        if t == 0 {
            return;
        }
        let (previous, current) = b.previous_and_current(t);
        kernel::affine(batch, self.dim, self.dim, self.weights.weights(), previous, current);
    }

    /// Add `W_recᵀ · δ_{t+1}` to the delta in slot `s` of `delta`. Slot `s - 1` holds the delta
    /// of the following timestep; no-op when `s` is 0 (the last timestep).
    pub fn compute_delta(&self, batch: usize, delta: &mut TimeBuffer, s: usize) {
        if s == 0 {
            return;
        }
        let (next, current) = delta.previous_and_current(s);
        kernel::affine_transpose(batch, self.dim, self.dim, self.weights.weights(), next, current);
    }

    /// Accumulate `-learning_rate · δ_t · h_{t-1}ᵀ`. No-op at activation slot 0.
    pub fn update_weights(
        &mut self,
        batch: usize,
        learning_rate: Real,
        delta: &[Real],
        b: &TimeBuffer,
        t: usize,
    ) {
        if t == 0 {
            return;
        }
        kernel::accumulate_outer(
            batch,
            self.dim,
            self.dim,
            -learning_rate,
            delta,
            b.slot(t - 1),
            self.weights.momentum_mut(),
        );
    }
}
