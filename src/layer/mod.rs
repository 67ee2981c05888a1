//! The layer contract and the closed set of layer kinds.
//!
//! A layer owns one [`TimeBuffer`](crate::buffer::TimeBuffer) per per-timestep quantity and two
//! cursors into them. One batch runs in three passes:
//!
//! 1. forward: [`Function::evaluate`] once per timestep, first to last; each call writes the
//!    timestep's activations and advances the activation cursor.
//! 2. backward: [`Function::compute_delta`] once per timestep, last to first; each call retreats
//!    the activation cursor, pulls the downstream delta in through the downstream layer's
//!    [`Function::add_delta`], adds the recurrent delta of timestep `t + 1` and multiplies by
//!    the activation derivative.
//! 3. update: [`Function::update_weights`] once per timestep, first to last; each call retreats
//!    the delta cursor and accumulates `-learning_rate · gradient` into the momentum buffers.
//!
//! After the three passes the delta cursor is back at slot 0 and the activation cursor is where
//! the forward pass left it. [`Function::update_momentum_weights`] then applies the step.
//!
//! Shape and cursor violations are programmer errors and panic.

use std::io::{self, Read, Write};

use rayon::prelude::*;

use crate::Real;
use crate::buffer::Cursor;
use crate::random::Random;

pub mod linear;
pub mod lstm;
pub mod output;
pub mod param;
pub mod recurrency;
pub mod table_lookup;

pub use linear::Linear;
pub use lstm::Lstm;
pub use output::Output;
pub use param::Param;
pub use recurrency::Recurrency;
pub use table_lookup::TableLookup;

/// Input of one timestep.
#[derive(Debug, Clone, Copy)]
pub enum Input<'a> {
    /// Word indices of the active sequences (table lookup only).
    Words(&'a [usize]),
    /// Activations of the layer below, one `input_dimension` row per sequence.
    Activations(&'a [Real]),
}

impl<'a> Input<'a> {
    pub fn words(self) -> &'a [usize] {
        match self {
            Input::Words(words) => words,
            Input::Activations(_) => panic!("layer expects word indices, got activations"),
        }
    }

    pub fn activations(self) -> &'a [Real] {
        match self {
            Input::Activations(x) => x,
            Input::Words(_) => panic!("layer expects activations, got word indices"),
        }
    }
}

/// Recurrent state of one layer, as needed to resume evaluation of a single sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerState {
    pub hidden: Vec<Real>,
    pub cell: Vec<Real>,
    pub histories: Vec<Vec<usize>>,
}

/// Recurrent state of a whole net, one entry per layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    pub layers: Vec<LayerState>,
}

/// Operations shared by every layer.
pub trait Function {
    fn input_dimension(&self) -> usize;

    fn output_dimension(&self) -> usize;

    /// Forward step for the sequences in `slice` (targets of this timestep).
    fn evaluate(&mut self, slice: &[usize], x: Input<'_>);

    /// Activations written by the latest `evaluate` or `update_weights` call.
    fn output(&self) -> &[Real];

    /// Backward step. `downstream` is the layer above, `None` for the output layer.
    fn compute_delta(&mut self, slice: &[usize], downstream: Option<&mut Layer>);

    /// Add this layer's current delta, propagated through its input weights, into `delta`
    /// (the delta of the layer below), then advance the delta cursor.
    fn add_delta(&mut self, slice: &[usize], delta: &mut [Real]);

    /// Accumulate the gradient step of one timestep into the momentum buffers.
    fn update_weights(&mut self, slice: &[usize], learning_rate: Real, x: Input<'_>);

    /// Named learnable arrays, in checkpoint order.
    fn params(&self) -> Vec<(&'static str, &Param)>;

    /// Same order as [`Function::params`].
    fn params_mut(&mut self) -> Vec<&mut Param>;

    /// Rewind all cursors for a new batch. With `is_dependent`, recurrent layers carry the
    /// latest timestep over as timestep -1 (batch size 1 only).
    fn reset(&mut self, is_dependent: bool);

    fn cursor(&self) -> Cursor;

    fn reset_histories(&mut self) {}

    fn extract_state(&self) -> LayerState {
        LayerState::default()
    }

    fn set_state(&mut self, _state: &LayerState) {}

    fn update_momentum_weights(&mut self, momentum: Real) {
        self.params_mut()
            .into_par_iter()
            .for_each(|p| p.apply_momentum(momentum));
    }

    fn reset_momentum(&mut self) {
        self.params_mut().into_iter().for_each(Param::reset_momentum);
    }

    fn randomize_weights(&mut self, random: &mut Random) {
        for p in self.params_mut() {
            p.randomize(random);
        }
    }

    fn read(&mut self, reader: &mut dyn Read) -> io::Result<()> {
        self.params_mut().into_iter().try_for_each(|p| p.read(reader))
    }

    fn write(&self, writer: &mut dyn Write) -> io::Result<()> {
        self.params().into_iter().try_for_each(|(_, p)| p.write(writer))
    }
}

/// The layer kinds a net is built from.
#[derive(Debug, Clone)]
pub enum Layer {
    TableLookup(TableLookup),
    Linear(Linear),
    Lstm(Lstm),
    Output(Output),
}

macro_rules! dispatch {
    ($self:expr, $layer:ident => $body:expr) => {
        match $self {
            Layer::TableLookup($layer) => $body,
            Layer::Linear($layer) => $body,
            Layer::Lstm($layer) => $body,
            Layer::Output($layer) => $body,
        }
    };
}

impl Layer {
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::TableLookup(_) => "table-lookup",
            Layer::Linear(_) => "linear",
            Layer::Lstm(_) => "lstm",
            Layer::Output(_) => "output",
        }
    }

    pub fn as_output(&self) -> Option<&Output> {
        match self {
            Layer::Output(output) => Some(output),
            _ => None,
        }
    }

    pub fn as_lstm(&self) -> Option<&Lstm> {
        match self {
            Layer::Lstm(lstm) => Some(lstm),
            _ => None,
        }
    }

    pub fn as_table_lookup(&self) -> Option<&TableLookup> {
        match self {
            Layer::TableLookup(table) => Some(table),
            _ => None,
        }
    }

    pub fn as_linear(&self) -> Option<&Linear> {
        match self {
            Layer::Linear(linear) => Some(linear),
            _ => None,
        }
    }
}

impl Function for Layer {
    fn input_dimension(&self) -> usize {
        dispatch!(self, l => l.input_dimension())
    }

    fn output_dimension(&self) -> usize {
        dispatch!(self, l => l.output_dimension())
    }

    fn evaluate(&mut self, slice: &[usize], x: Input<'_>) {
        dispatch!(self, l => l.evaluate(slice, x))
    }

    fn output(&self) -> &[Real] {
        dispatch!(self, l => l.output())
    }

    fn compute_delta(&mut self, slice: &[usize], downstream: Option<&mut Layer>) {
        dispatch!(self, l => l.compute_delta(slice, downstream))
    }

    fn add_delta(&mut self, slice: &[usize], delta: &mut [Real]) {
        dispatch!(self, l => l.add_delta(slice, delta))
    }

    fn update_weights(&mut self, slice: &[usize], learning_rate: Real, x: Input<'_>) {
        dispatch!(self, l => l.update_weights(slice, learning_rate, x))
    }

    fn params(&self) -> Vec<(&'static str, &Param)> {
        dispatch!(self, l => l.params())
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        dispatch!(self, l => l.params_mut())
    }

    fn reset(&mut self, is_dependent: bool) {
        dispatch!(self, l => l.reset(is_dependent))
    }

    fn cursor(&self) -> Cursor {
        dispatch!(self, l => l.cursor())
    }

    fn reset_histories(&mut self) {
        dispatch!(self, l => l.reset_histories())
    }

    fn extract_state(&self) -> LayerState {
        dispatch!(self, l => l.extract_state())
    }

    fn set_state(&mut self, state: &LayerState) {
        dispatch!(self, l => l.set_state(state))
    }
}
