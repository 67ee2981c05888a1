//! Time arenas.
//!
//! Every per-timestep quantity of a layer (activations, deltas, cell state, gate outputs) lives
//! in one [`TimeBuffer`]: `max_sequence_length` slots of `dim × max_batch_size` values, allocated
//! once. Layers walk it with an explicit slot index instead of allocating per step.
//!
//! The forward cursor advances on evaluate and retreats on compute-delta. Deltas are written in
//! reverse time order, so the delta cursor advances during the backward pass and retreats again
//! during the update pass; slot `delta_t - 1` always holds the delta of timestep `t + 1`.

use crate::Real;

#[derive(Debug, Clone, PartialEq)]
pub struct TimeBuffer {
    data: Vec<Real>,
    stride: usize,
}

impl TimeBuffer {
    /// `num_slots` slots of `stride` zeros.
    pub fn new(stride: usize, num_slots: usize) -> Self {
        Self {
            data: vec![0.0; stride * num_slots],
            stride,
        }
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub fn num_slots(&self) -> usize {
        if self.stride == 0 {
            0
        } else {
            self.data.len() / self.stride
        }
    }

    #[inline]
    pub fn slot(&self, t: usize) -> &[Real] {
        assert!(
            t < self.num_slots(),
            "slot {t} out of range ({} slots)",
            self.num_slots()
        );
        &self.data[t * self.stride..(t + 1) * self.stride]
    }

    #[inline]
    pub fn slot_mut(&mut self, t: usize) -> &mut [Real] {
        assert!(
            t < self.num_slots(),
            "slot {t} out of range ({} slots)",
            self.num_slots()
        );
        &mut self.data[t * self.stride..(t + 1) * self.stride]
    }

    /// Slot `t - 1` (read) and slot `t` (write) at once.
    pub fn previous_and_current(&mut self, t: usize) -> (&[Real], &mut [Real]) {
        assert!(t >= 1, "slot 0 has no predecessor");
        assert!(
            t < self.num_slots(),
            "slot {t} out of range ({} slots)",
            self.num_slots()
        );
        let (left, right) = self.data.split_at_mut(t * self.stride);
        (&left[(t - 1) * self.stride..], &mut right[..self.stride])
    }

    pub fn fill_zero(&mut self) {
        self.data.fill(0.0);
    }

    /// Copy slot `from` into slot 0 and zero every other slot.
    pub fn carry_over(&mut self, from: usize) {
        if from > 0 {
            let (head, tail) = self.data.split_at_mut(self.stride);
            head.copy_from_slice(&tail[(from - 1) * self.stride..from * self.stride]);
        }
        self.data[self.stride..].fill(0.0);
    }

    pub fn as_slice(&self) -> &[Real] {
        &self.data
    }
}

/// Position of a layer's forward and delta cursors, in slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub activation: usize,
    pub delta: usize,
}
