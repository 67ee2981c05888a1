use rayon::prelude::*;

use crate::Real;
use crate::activation::Activation;
use crate::buffer::{Cursor, TimeBuffer};
use crate::kernel;
use crate::layer::{Function, Input, Layer, LayerState, Param, Recurrency};

/// Input layer: the embedding rows of the last `order` words of every sequence, concatenated.
///
/// Each active sequence keeps a history of its last `order` input words, newest first. The
/// output row of a sequence is `order` blocks of `output_dim / order` values, block `k` holding
/// `bias + E[history[k]]`, optionally plus a recurrent term, then the activation.
///
/// The embedding table `E` has one row per vocabulary word. There is nothing below this layer,
/// so [`Function::add_delta`] does nothing and the delta cursor advances in
/// [`Function::compute_delta`] instead.
#[derive(Debug, Clone)]
pub struct TableLookup {
    vocabulary_size: usize,
    output_dim: usize,
    word_dim: usize,
    order: usize,
    max_batch_size: usize,
    is_feedforward: bool,
    activation: Activation,
    weights: Param,
    bias: Option<Param>,
    recurrency: Option<Recurrency>,
    b: TimeBuffer,
    delta: TimeBuffer,
    b_t: usize,
    delta_t: usize,
    histories: Vec<Vec<usize>>,
}

impl TableLookup {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vocabulary_size: usize,
        output_dim: usize,
        order: usize,
        max_batch_size: usize,
        max_sequence_length: usize,
        activation: Activation,
        use_bias: bool,
        is_recurrent: bool,
        is_feedforward: bool,
    ) -> Self {
        assert!(order >= 1, "n-gram order must be >= 1");
        assert_eq!(
            output_dim % order,
            0,
            "dimension {output_dim} is not divisible by order {order}"
        );
        let word_dim = output_dim / order;
        let stride = output_dim * max_batch_size;
        Self {
            vocabulary_size,
            output_dim,
            word_dim,
            order,
            max_batch_size,
            is_feedforward,
            activation,
            weights: Param::zeros(vocabulary_size * word_dim),
            bias: use_bias.then(|| Param::zeros(word_dim)),
            recurrency: is_recurrent.then(|| Recurrency::new(output_dim)),
            b: TimeBuffer::new(stride, max_sequence_length),
            delta: TimeBuffer::new(stride, max_sequence_length),
            b_t: 0,
            delta_t: 0,
            histories: Vec::new(),
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn word_dimension(&self) -> usize {
        self.word_dim
    }

    pub fn is_recurrent(&self) -> bool {
        self.recurrency.is_some()
    }

    pub fn histories(&self) -> &[Vec<usize>] {
        &self.histories
    }

    fn last_slot(&self) -> usize {
        self.b_t.saturating_sub(1)
    }

    /// Shift the current words into the histories. The first call of a batch sees the widest
    /// slice and creates one history per sequence, filled with the current word.
    fn update_histories(&mut self, words: &[usize]) {
        if self.histories.is_empty() {
            self.histories = words.iter().map(|&w| vec![w; self.order]).collect();
            return;
        }
        assert!(
            words.len() <= self.histories.len(),
            "slice of {} grew beyond {} histories",
            words.len(),
            self.histories.len()
        );
        for (history, &word) in self.histories.iter_mut().zip(words) {
            history.pop();
            history.insert(0, word);
        }
    }
}

impl Function for TableLookup {
    fn input_dimension(&self) -> usize {
        self.vocabulary_size
    }

    fn output_dimension(&self) -> usize {
        self.output_dim
    }

    fn evaluate(&mut self, slice: &[usize], x: Input<'_>) {
        let n = slice.len();
        assert!(
            n <= self.max_batch_size,
            "slice of {n} exceeds max batch size {}",
            self.max_batch_size
        );
        let words = &x.words()[..n];
        assert!(
            words.iter().all(|&w| w < self.vocabulary_size),
            "word index out of vocabulary"
        );
        self.update_histories(words);
        let t = self.b_t;

        let (word_dim, order) = (self.word_dim, self.order);
        let (table, bias, histories) = (
            self.weights.weights(),
            self.bias.as_ref().map(Param::weights),
            &self.histories,
        );
        self.b.slot_mut(t)[..n * self.output_dim]
            .par_chunks_mut(word_dim)
            .enumerate()
            .for_each(|(k, block)| {
                let word = histories[k / order][k % order];
                let row = &table[word * word_dim..(word + 1) * word_dim];
                match bias {
                    Some(bias) => {
                        for ((v, &e), &b) in block.iter_mut().zip(row).zip(bias) {
                            *v = e + b;
                        }
                    }
                    None => block.copy_from_slice(row),
                }
            });

        if let Some(recurrency) = &self.recurrency {
            recurrency.evaluate(n, &mut self.b, t);
        }
        self.activation
            .evaluate(self.output_dim, n, self.b.slot_mut(t));
        self.b_t += 1;
    }

    fn output(&self) -> &[Real] {
        self.b.slot(self.last_slot())
    }

    fn compute_delta(&mut self, slice: &[usize], downstream: Option<&mut Layer>) {
        assert!(self.b_t > 0, "compute_delta without a matching evaluate");
        self.b_t -= 1;
        let n = slice.len();
        let s = self.delta_t;

        let downstream = downstream.expect("table lookup needs a layer above it");
        downstream.add_delta(slice, self.delta.slot_mut(s));
        if let Some(recurrency) = &self.recurrency {
            recurrency.compute_delta(n, &mut self.delta, s);
        }
        self.activation.multiply_derivative(
            self.output_dim,
            n,
            self.b.slot(self.b_t),
            self.delta.slot_mut(s),
        );
        self.delta_t += 1;
    }

    fn add_delta(&mut self, _slice: &[usize], _delta: &mut [Real]) {}

    fn update_weights(&mut self, slice: &[usize], learning_rate: Real, x: Input<'_>) {
        let n = slice.len();
        assert!(self.delta_t > 0, "update_weights without a matching compute_delta");
        self.delta_t -= 1;
        if !self.is_feedforward {
            self.update_histories(&x.words()[..n]);
        }
        let t = self.b_t;
        let word_dim = self.word_dim;
        let d = &self.delta.slot(self.delta_t)[..n * self.output_dim];

        if let Some(bias) = &mut self.bias {
            kernel::column_sum_into(n * self.order, -learning_rate, d, bias.momentum_mut());
        }
        // Rows of repeated words receive several contributions, so this stays sequential.
        let momentum = self.weights.momentum_mut();
        for (k, block) in d.chunks_exact(word_dim).enumerate() {
            let word = self.histories[k / self.order][k % self.order];
            kernel::axpy(
                -learning_rate,
                block,
                &mut momentum[word * word_dim..(word + 1) * word_dim],
            );
        }
        if let Some(recurrency) = &mut self.recurrency {
            recurrency.update_weights(n, learning_rate, d, &self.b, t);
        }
        self.b_t += 1;
    }

    fn params(&self) -> Vec<(&'static str, &Param)> {
        let mut params = vec![("weights", &self.weights)];
        params.extend(self.bias.as_ref().map(|b| ("bias", b)));
        params.extend(self.recurrency.as_ref().map(|r| ("recurrent", r.weights())));
        params
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = vec![&mut self.weights];
        params.extend(self.bias.as_mut());
        params.extend(self.recurrency.as_mut().map(Recurrency::weights_mut));
        params
    }

    fn reset(&mut self, is_dependent: bool) {
        if is_dependent && self.is_recurrent() {
            assert_eq!(
                self.max_batch_size, 1,
                "dependent reset requires batch size 1"
            );
            self.b.carry_over(self.last_slot());
            self.b_t = 1;
        } else {
            self.b.fill_zero();
            self.b_t = 0;
        }
        self.delta.fill_zero();
        self.delta_t = 0;
    }

    fn cursor(&self) -> Cursor {
        Cursor {
            activation: self.b_t,
            delta: self.delta_t,
        }
    }

    fn reset_histories(&mut self) {
        self.histories.clear();
    }

    fn extract_state(&self) -> LayerState {
        let hidden = if self.is_recurrent() {
            assert_eq!(self.max_batch_size, 1, "state extraction requires batch size 1");
            self.output().to_vec()
        } else {
            Vec::new()
        };
        LayerState {
            hidden,
            histories: self.histories.clone(),
            ..LayerState::default()
        }
    }

    fn set_state(&mut self, state: &LayerState) {
        if self.is_recurrent() {
            assert_eq!(self.max_batch_size, 1, "state restoration requires batch size 1");
            self.b.slot_mut(0).copy_from_slice(&state.hidden);
            self.b_t = 1;
            self.delta_t = 0;
        }
        assert!(
            state.histories.iter().all(|h| h.len() == self.order),
            "history length does not match order {}",
            self.order
        );
        self.histories = state.histories.clone();
    }
}
