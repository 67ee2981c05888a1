//! Class-factored softmax output layer.
//!
//! `P(w | h) = P(class(w) | h) · P(w | class(w), h)`. The class distribution is a dense softmax
//! over all classes. The word distribution is a softmax over the members of the target's class
//! only, computed from that class's rows of the word weight matrix. Shortlist (singleton) classes
//! have no word rows: their word probability is 1.
//!
//! Each activation slot holds `max_batch_size` class rows of `num_classes` values, followed by
//! `max_batch_size` word rows of `max_class_size` values.

use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;

use crate::Real;
use crate::activation::Activation;
use crate::buffer::{Cursor, TimeBuffer};
use crate::kernel;
use crate::layer::{Function, Input, Layer, Param};
use crate::vocabulary::Vocabulary;

#[derive(Debug, Clone)]
pub struct Output {
    input_dim: usize,
    num_classes: usize,
    max_class_size: usize,
    max_batch_size: usize,
    num_oovs: usize,
    vocabulary: Arc<Vocabulary>,
    class_weights: Param,
    word_weights: Option<Param>,
    class_bias: Option<Param>,
    word_bias: Option<Param>,
    b: TimeBuffer,
    delta: TimeBuffer,
    b_t: usize,
    delta_t: usize,
}

/// Where a target word lives in the word part of the layer.
#[derive(Debug, Clone, Copy)]
struct Target {
    class: usize,
    /// Members of the class; 1 for shortlist words.
    class_size: usize,
    /// First word row of the class in the word weights.
    offset: usize,
    /// Position of the word inside its class.
    position: usize,
}

impl Output {
    pub fn new(
        input_dim: usize,
        max_batch_size: usize,
        max_sequence_length: usize,
        num_oovs: usize,
        use_bias: bool,
        vocabulary: Arc<Vocabulary>,
    ) -> Self {
        let num_classes = vocabulary.num_classes();
        let max_class_size = vocabulary.max_class_size();
        let num_words = vocabulary.len() - vocabulary.shortlist_size();
        let has_words = num_words > 0;
        let stride = (num_classes + max_class_size) * max_batch_size;
        Self {
            input_dim,
            num_classes,
            max_class_size,
            max_batch_size,
            num_oovs,
            class_weights: Param::zeros(num_classes * input_dim),
            word_weights: has_words.then(|| Param::zeros(num_words * input_dim)),
            class_bias: use_bias.then(|| Param::zeros(num_classes)),
            word_bias: (use_bias && has_words).then(|| Param::zeros(num_words)),
            b: TimeBuffer::new(stride, max_sequence_length),
            delta: TimeBuffer::new(stride, max_sequence_length),
            b_t: 0,
            delta_t: 0,
            vocabulary,
        }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn max_class_size(&self) -> usize {
        self.max_class_size
    }

    /// Class distributions of the latest timestep, one `num_classes` row per sequence.
    pub fn class_probabilities(&self) -> &[Real] {
        &self.output()[..self.num_classes * self.max_batch_size]
    }

    /// Within-class word distributions of the latest timestep, one `max_class_size` row per
    /// sequence. Only the first `class_size` entries of a row are meaningful, and rows of
    /// shortlist targets are left untouched.
    pub fn word_probabilities(&self) -> &[Real] {
        &self.output()[self.num_classes * self.max_batch_size..]
    }

    fn target(&self, word: usize) -> Target {
        let vocabulary = &self.vocabulary;
        let class = vocabulary.class_of(word);
        let class_size = vocabulary.class_size(class);
        let offset = vocabulary.word_offset(class);
        let position = if class_size > 1 {
            word - vocabulary.shortlist_size() - offset
        } else {
            0
        };
        Target {
            class,
            class_size,
            offset,
            position,
        }
    }

    fn class_region_len(&self) -> usize {
        self.num_classes * self.max_batch_size
    }

    /// `log P(slice | x)` for the activations `x` of one timestep (as returned by
    /// [`Function::output`]). The unknown token's probability is divided by `num_oovs + 1`
    /// since it stands for that many words. With `probabilities`, each sequence's target
    /// probability is pushed to its entry.
    pub fn compute_log_probability(
        &self,
        slice: &[usize],
        x: &[Real],
        verbose: bool,
        mut probabilities: Option<&mut [Vec<Real>]>,
    ) -> Real {
        let (c, m) = (self.num_classes, self.max_class_size);
        let word_region = self.class_region_len();
        let mut log_probability = 0.0;
        for (i, &word) in slice.iter().enumerate() {
            let target = self.target(word);
            let mut probability = x[i * c + target.class];
            if self.vocabulary.unk() == Some(word) {
                probability /= (self.num_oovs + 1) as Real;
            }
            log_probability += probability.ln();
            if target.class_size > 1 {
                let word_probability = x[word_region + i * m + target.position];
                probability *= word_probability;
                log_probability += word_probability.ln();
            }
            if let Some(probabilities) = probabilities.as_deref_mut() {
                probabilities[i].push(probability);
            }
            if verbose {
                debug!(
                    "\tp( {} | ... ) \t = [1gram] {:.8} [ {:.5} ]",
                    self.vocabulary.word(word),
                    probability,
                    probability.log10()
                );
            }
        }
        log_probability
    }
}

impl Function for Output {
    fn input_dimension(&self) -> usize {
        self.input_dim
    }

    fn output_dimension(&self) -> usize {
        self.vocabulary.len() + self.num_classes - self.vocabulary.shortlist_size()
    }

    fn evaluate(&mut self, slice: &[usize], x: Input<'_>) {
        let x = x.activations();
        let n = slice.len();
        assert!(
            n <= self.max_batch_size,
            "slice of {n} exceeds max batch size {}",
            self.max_batch_size
        );
        let (input_dim, c, m) = (self.input_dim, self.num_classes, self.max_class_size);
        let targets: Vec<Target> = slice.iter().map(|&w| self.target(w)).collect();
        let split = self.class_region_len();
        let (class_b, word_b) = self.b.slot_mut(self.b_t).split_at_mut(split);

        kernel::fill_rows(n, self.class_bias.as_ref().map(Param::weights), class_b, c);
        kernel::affine(n, c, input_dim, self.class_weights.weights(), x, class_b);
        Activation::Softmax.evaluate(c, n, class_b);

        let word_weights = self.word_weights.as_ref().map(Param::weights);
        let word_bias = self.word_bias.as_ref().map(Param::weights);
        word_b[..n * m]
            .par_chunks_mut(m)
            .zip(x.par_chunks(input_dim))
            .zip(targets.par_iter())
            .for_each(|((row, x_i), target)| {
                let Some(weights) = word_weights.filter(|_| target.class_size > 1) else {
                    return;
                };
                let (offset, size) = (target.offset, target.class_size);
                let row = &mut row[..size];
                kernel::fill_rows(1, word_bias.map(|b| &b[offset..offset + size]), row, size);
                kernel::affine(
                    1,
                    size,
                    input_dim,
                    &weights[offset * input_dim..(offset + size) * input_dim],
                    x_i,
                    row,
                );
                Activation::Softmax.evaluate(size, 1, row);
            });
        self.b_t += 1;
    }

    fn output(&self) -> &[Real] {
        self.b.slot(self.b_t.saturating_sub(1))
    }

    fn compute_delta(&mut self, slice: &[usize], downstream: Option<&mut Layer>) {
        assert!(downstream.is_none(), "output layer must be the last layer");
        assert!(self.b_t > 0, "compute_delta without a matching evaluate");
        self.b_t -= 1;
        let n = slice.len();
        let (c, m) = (self.num_classes, self.max_class_size);
        let targets: Vec<Target> = slice.iter().map(|&w| self.target(w)).collect();
        let split = self.class_region_len();
        let (class_b, word_b) = self.b.slot(self.b_t).split_at(split);
        let (class_d, word_d) = self.delta.slot_mut(self.delta_t).split_at_mut(split);

        // One-hot targets, then the softmax/cross-entropy shortcut `y - target`.
        class_d[..n * c]
            .par_chunks_mut(c)
            .zip(word_d[..n * m].par_chunks_mut(m))
            .zip(class_b.par_chunks(c).zip(word_b.par_chunks(m)))
            .zip(targets.par_iter())
            .for_each(|(((class_row, word_row), (class_y, word_y)), target)| {
                class_row[target.class] = 1.0;
                Activation::Softmax.multiply_derivative(c, 1, class_y, class_row);
                if target.class_size > 1 {
                    word_row[target.position] = 1.0;
                    Activation::Softmax.multiply_derivative(
                        target.class_size,
                        1,
                        word_y,
                        word_row,
                    );
                }
            });
    }

    fn add_delta(&mut self, slice: &[usize], delta: &mut [Real]) {
        let n = slice.len();
        let (input_dim, c, m) = (self.input_dim, self.num_classes, self.max_class_size);
        let targets: Vec<Target> = slice.iter().map(|&w| self.target(w)).collect();
        let (class_d, word_d) = self
            .delta
            .slot(self.delta_t)
            .split_at(self.class_region_len());

        kernel::affine_transpose(n, c, input_dim, self.class_weights.weights(), class_d, delta);
        if let Some(word_weights) = &self.word_weights {
            let weights = word_weights.weights();
            delta[..n * input_dim]
                .par_chunks_mut(input_dim)
                .zip(word_d.par_chunks(m))
                .zip(targets.par_iter())
                .filter(|(_, target)| target.class_size > 1)
                .for_each(|((dx, d), target)| {
                    let (offset, size) = (target.offset, target.class_size);
                    kernel::affine_transpose(
                        1,
                        size,
                        input_dim,
                        &weights[offset * input_dim..(offset + size) * input_dim],
                        &d[..size],
                        dx,
                    );
                });
        }
        self.delta_t += 1;
    }

    fn update_weights(&mut self, slice: &[usize], learning_rate: Real, x: Input<'_>) {
        let x = x.activations();
        let n = slice.len();
        assert!(self.delta_t > 0, "update_weights without a matching compute_delta");
        self.delta_t -= 1;
        let (input_dim, c, m) = (self.input_dim, self.num_classes, self.max_class_size);
        let targets: Vec<Target> = slice.iter().map(|&w| self.target(w)).collect();
        let split = self.class_region_len();
        let Self {
            class_weights,
            word_weights,
            class_bias,
            word_bias,
            delta,
            delta_t,
            ..
        } = &mut *self;
        let (class_d, word_d) = delta.slot(*delta_t).split_at(split);

        rayon::join(
            || {
                if let Some(bias) = class_bias {
                    kernel::column_sum_into(n, -learning_rate, class_d, bias.momentum_mut());
                }
                kernel::accumulate_outer(
                    n,
                    c,
                    input_dim,
                    -learning_rate,
                    class_d,
                    x,
                    class_weights.momentum_mut(),
                );
            },
            || {
                let Some(word_weights) = word_weights else {
                    return;
                };
                // Sequences with the same class touch the same rows, so this stays sequential.
                for ((d, x_i), target) in word_d.chunks(m).zip(x.chunks(input_dim)).zip(&targets)
                {
                    if target.class_size == 1 {
                        continue;
                    }
                    let (offset, size) = (target.offset, target.class_size);
                    let d = &d[..size];
                    if let Some(bias) = word_bias.as_mut() {
                        kernel::axpy(
                            -learning_rate,
                            d,
                            &mut bias.momentum_mut()[offset..offset + size],
                        );
                    }
                    kernel::accumulate_outer(
                        1,
                        size,
                        input_dim,
                        -learning_rate,
                        d,
                        x_i,
                        &mut word_weights.momentum_mut()
                            [offset * input_dim..(offset + size) * input_dim],
                    );
                }
            },
        );
        self.b_t += 1;
    }

    fn params(&self) -> Vec<(&'static str, &Param)> {
        let mut params = vec![("class_weights", &self.class_weights)];
        params.extend(self.word_weights.as_ref().map(|w| ("word_weights", w)));
        params.extend(self.class_bias.as_ref().map(|b| ("class_bias", b)));
        params.extend(self.word_bias.as_ref().map(|b| ("word_bias", b)));
        params
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = vec![&mut self.class_weights];
        params.extend(self.word_weights.as_mut());
        params.extend(self.class_bias.as_mut());
        params.extend(self.word_bias.as_mut());
        params
    }

    fn reset(&mut self, _is_dependent: bool) {
        self.b.fill_zero();
        self.delta.fill_zero();
        self.b_t = 0;
        self.delta_t = 0;
    }

    fn cursor(&self) -> Cursor {
        Cursor {
            activation: self.b_t,
            delta: self.delta_t,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::Random;

    /// `c` and `<sb>` are shortlist words (indices 0 and 1), `a` and `b` share a class.
    fn vocabulary() -> Arc<Vocabulary> {
        let entries = [("a", 0), ("b", 0), ("c", 1)];
        Arc::new(Vocabulary::from_word_classes(entries, "<sb>", Some("<unk>")).unwrap())
    }

    fn random_output(batch: usize, num_oovs: usize) -> Output {
        let mut output = Output::new(3, batch, 2, num_oovs, true, vocabulary());
        output.randomize_weights(&mut Random::new(7));
        output
    }

    fn assert_close(a: Real, b: Real) {
        assert!((a - b).abs() < 1e-12, "{a} != {b}");
    }

    #[test]
    fn distributions_are_normalised() {
        let mut output = random_output(2, 0);
        let a = output.vocabulary().index("a").unwrap();
        let c = output.vocabulary().index("c").unwrap();
        output.evaluate(&[a, c], Input::Activations(&[0.3, -0.2, 0.9, 1.0, 0.0, -1.0]));

        let classes = output.num_classes();
        for row in output.class_probabilities()[..2 * classes].chunks(classes) {
            assert_close(row.iter().sum(), 1.0);
        }
        let m = output.max_class_size();
        assert_close(output.word_probabilities()[..m].iter().sum(), 1.0);
        // Shortlist targets leave their word row untouched.
        assert!(output.word_probabilities()[m..2 * m].iter().all(|&p| p == 0.0));
    }

    #[test]
    fn log_probability_factors_into_class_and_word() {
        let mut output = random_output(1, 0);
        let b = output.vocabulary().index("b").unwrap();
        output.evaluate(&[b], Input::Activations(&[0.5, 0.5, -0.5]));

        let target = output.target(b);
        let p_class = output.class_probabilities()[target.class];
        let p_word = output.word_probabilities()[target.position];
        let mut sink = vec![Vec::new()];
        let log_p =
            output.compute_log_probability(&[b], output.output(), false, Some(&mut sink[..]));
        assert_close(log_p, (p_class * p_word).ln());
        assert_close(sink[0][0], p_class * p_word);
    }

    #[test]
    fn unknown_word_mass_is_shared_among_oovs() {
        let mut output = random_output(1, 3);
        let unk = output.vocabulary().unk().unwrap();
        output.evaluate(&[unk], Input::Activations(&[0.1, 0.2, 0.3]));
        let p_class = output.class_probabilities()[output.target(unk).class];
        let log_p = output.compute_log_probability(&[unk], output.output(), false, None);
        assert_close(log_p, (p_class / 4.0).ln());
    }

    #[test]
    fn delta_is_output_minus_one_hot() {
        let mut output = random_output(1, 0);
        let a = output.vocabulary().index("a").unwrap();
        output.evaluate(&[a], Input::Activations(&[0.2, 0.1, 0.0]));
        let y = output.output().to_vec();
        output.compute_delta(&[a], None);

        let target = output.target(a);
        let delta = output.delta.slot(0);
        for k in 0..output.num_classes() {
            let one_hot = if k == target.class { 1.0 } else { 0.0 };
            assert_close(delta[k], y[k] - one_hot);
        }
        let word = output.class_region_len() + target.position;
        assert_close(delta[word], y[word] - 1.0);
        assert_eq!(output.cursor(), Cursor::default());
    }

    #[test]
    fn shortlist_only_vocabulary_has_no_word_weights() {
        let vocabulary =
            Arc::new(Vocabulary::from_word_classes([("x", 0), ("y", 1)], "<sb>", None).unwrap());
        let output = Output::new(2, 1, 2, 0, true, vocabulary);
        let names: Vec<_> = output.params().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["class_weights", "class_bias"]);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn verbose_trace(output: &Output, slice: &[usize], level: tracing::Level) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            output.compute_log_probability(slice, output.output(), true, None);
        });
        let bytes = captured.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn word_trace_is_debug_output() {
        let mut output = random_output(1, 0);
        let b = output.vocabulary().index("b").unwrap();
        output.evaluate(&[b], Input::Activations(&[0.5, 0.5, -0.5]));

        assert!(!verbose_trace(&output, &[b], tracing::Level::INFO).contains("p( b"));
        assert!(verbose_trace(&output, &[b], tracing::Level::DEBUG).contains("p( b | ... )"));
    }
}
