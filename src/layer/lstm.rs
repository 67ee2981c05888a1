//! LSTM layer with peephole connections.
//!
//! Per timestep, for every active sequence:
//!
//! ```text
//! i_t = σ(W_i x_t + R_i h_{t-1} + p_i ⊙ c_{t-1} + b_i)
//! f_t = σ(W_f x_t + R_f h_{t-1} + p_f ⊙ c_{t-1} + b_f)
//! g_t = tanh(W_g x_t + R_g h_{t-1} + b_g)
//! c_t = i_t ⊙ g_t + f_t ⊙ c_{t-1}
//! o_t = σ(W_o x_t + R_o h_{t-1} + p_o ⊙ c_t + b_o)
//! h_t = o_t ⊙ tanh(c_t)
//! ```
//!
//! Terms with `t - 1` vanish at the first timestep of a batch. The input and forget gates are
//! independent and run concurrently; the cell state needs both, and the output gate needs the
//! cell state.

use crate::Real;
use crate::activation::Activation;
use crate::buffer::{Cursor, TimeBuffer};
use crate::kernel;
use crate::layer::{Function, Input, Layer, LayerState, Param};

/// One of the four affine units of the cell.
#[derive(Debug, Clone)]
pub struct Gate {
    activation: Activation,
    weights: Param,
    recurrent: Param,
    peephole: Option<Param>,
    bias: Option<Param>,
    b: TimeBuffer,
    delta: TimeBuffer,
}

impl Gate {
    fn new(
        input_dim: usize,
        dim: usize,
        max_batch_size: usize,
        max_sequence_length: usize,
        activation: Activation,
        use_bias: bool,
        has_peephole: bool,
    ) -> Self {
        let stride = dim * max_batch_size;
        Self {
            activation,
            weights: Param::zeros(dim * input_dim),
            recurrent: Param::zeros(dim * dim),
            peephole: has_peephole.then(|| Param::zeros(dim)),
            bias: use_bias.then(|| Param::zeros(dim)),
            b: TimeBuffer::new(stride, max_sequence_length),
            delta: TimeBuffer::new(stride, max_sequence_length),
        }
    }

    /// Activations of every timestep.
    pub fn activations(&self) -> &TimeBuffer {
        &self.b
    }

    /// Pre-activation deltas, in reverse time order.
    pub fn deltas(&self) -> &TimeBuffer {
        &self.delta
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate(
        &mut self,
        t: usize,
        n: usize,
        input_dim: usize,
        dim: usize,
        x: &[Real],
        h_previous: Option<&[Real]>,
        cell: Option<&[Real]>,
    ) {
        let y = self.b.slot_mut(t);
        kernel::fill_rows(n, self.bias.as_ref().map(Param::weights), y, dim);
        kernel::affine(n, dim, input_dim, self.weights.weights(), x, y);
        if let Some(h) = h_previous {
            kernel::affine(n, dim, dim, self.recurrent.weights(), h, y);
        }
        if let (Some(peephole), Some(cell)) = (&self.peephole, cell) {
            add_diagonal(n, dim, peephole.weights(), cell, y);
        }
        self.activation.evaluate(dim, n, y);
    }

    #[allow(clippy::too_many_arguments)]
    fn update(
        &mut self,
        s: usize,
        n: usize,
        input_dim: usize,
        dim: usize,
        learning_rate: Real,
        x: &[Real],
        h_previous: Option<&[Real]>,
        cell: Option<&[Real]>,
    ) {
        let d = self.delta.slot(s);
        if let Some(bias) = &mut self.bias {
            kernel::column_sum_into(n, -learning_rate, d, bias.momentum_mut());
        }
        kernel::accumulate_outer(
            n,
            dim,
            input_dim,
            -learning_rate,
            d,
            x,
            self.weights.momentum_mut(),
        );
        if let Some(h) = h_previous {
            kernel::accumulate_outer(
                n,
                dim,
                dim,
                -learning_rate,
                d,
                h,
                self.recurrent.momentum_mut(),
            );
        }
        if let (Some(peephole), Some(cell)) = (&mut self.peephole, cell) {
            let momentum = peephole.momentum_mut();
            for (d_row, c_row) in d[..n * dim].chunks_exact(dim).zip(cell.chunks_exact(dim)) {
                for ((m, &dv), &cv) in momentum.iter_mut().zip(d_row).zip(c_row) {
                    *m -= learning_rate * dv * cv;
                }
            }
        }
    }
}

/// `y_i += p ⊙ v_i` for the first `n` rows.
fn add_diagonal(n: usize, dim: usize, p: &[Real], v: &[Real], y: &mut [Real]) {
    for (y_row, v_row) in y[..n * dim].chunks_exact_mut(dim).zip(v.chunks_exact(dim)) {
        for ((yv, &vv), &pv) in y_row.iter_mut().zip(v_row).zip(p) {
            *yv = pv.mul_add(vv, *yv);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Lstm {
    input_dim: usize,
    dim: usize,
    max_batch_size: usize,
    cell_input: Gate,
    input_gate: Gate,
    forget_gate: Gate,
    output_gate: Gate,
    /// Cell outputs `h`.
    b: TimeBuffer,
    /// Cell states `c`.
    cec: TimeBuffer,
    /// Cell state errors, in reverse time order.
    cec_epsilon: TimeBuffer,
    /// Delta on `h_t` of the current backward step.
    output_delta: Vec<Real>,
    b_t: usize,
    delta_t: usize,
}

impl Lstm {
    pub fn new(
        input_dim: usize,
        dim: usize,
        max_batch_size: usize,
        max_sequence_length: usize,
        use_bias: bool,
    ) -> Self {
        let gate = |activation, has_peephole| {
            Gate::new(
                input_dim,
                dim,
                max_batch_size,
                max_sequence_length,
                activation,
                use_bias,
                has_peephole,
            )
        };
        let stride = dim * max_batch_size;
        Self {
            input_dim,
            dim,
            max_batch_size,
            cell_input: gate(Activation::Tanh, false),
            input_gate: gate(Activation::Sigmoid, true),
            forget_gate: gate(Activation::Sigmoid, true),
            output_gate: gate(Activation::Sigmoid, true),
            b: TimeBuffer::new(stride, max_sequence_length),
            cec: TimeBuffer::new(stride, max_sequence_length),
            cec_epsilon: TimeBuffer::new(stride, max_sequence_length),
            output_delta: vec![0.0; stride],
            b_t: 0,
            delta_t: 0,
        }
    }

    pub fn cell_input(&self) -> &Gate {
        &self.cell_input
    }

    pub fn input_gate(&self) -> &Gate {
        &self.input_gate
    }

    pub fn forget_gate(&self) -> &Gate {
        &self.forget_gate
    }

    pub fn output_gate(&self) -> &Gate {
        &self.output_gate
    }

    pub fn cell_states(&self) -> &TimeBuffer {
        &self.cec
    }

    fn last_slot(&self) -> usize {
        self.b_t.saturating_sub(1)
    }

    fn gates(&self) -> [&Gate; 4] {
        [
            &self.cell_input,
            &self.input_gate,
            &self.forget_gate,
            &self.output_gate,
        ]
    }
}

impl Function for Lstm {
    fn input_dimension(&self) -> usize {
        self.input_dim
    }

    fn output_dimension(&self) -> usize {
        self.dim
    }

    fn evaluate(&mut self, slice: &[usize], x: Input<'_>) {
        let x = x.activations();
        let n = slice.len();
        assert!(
            n <= self.max_batch_size,
            "slice of {n} exceeds max batch size {}",
            self.max_batch_size
        );
        let t = self.b_t;
        let (input_dim, dim) = (self.input_dim, self.dim);
        let Self {
            cell_input,
            input_gate,
            forget_gate,
            output_gate,
            b,
            cec,
            ..
        } = &mut *self;

        let h_previous = (t > 0).then(|| b.slot(t - 1));
        let c_previous = (t > 0).then(|| cec.slot(t - 1));
        rayon::join(
            || input_gate.evaluate(t, n, input_dim, dim, x, h_previous, c_previous),
            || forget_gate.evaluate(t, n, input_dim, dim, x, h_previous, c_previous),
        );
        cell_input.evaluate(t, n, input_dim, dim, x, h_previous, None);

        let len = n * dim;
        let (i, f, g) = (
            input_gate.b.slot(t),
            forget_gate.b.slot(t),
            cell_input.b.slot(t),
        );
        if t > 0 {
            let (c_prev, c) = cec.previous_and_current(t);
            for k in 0..len {
                c[k] = i[k].mul_add(g[k], f[k] * c_prev[k]);
            }
        } else {
            let c = cec.slot_mut(t);
            for k in 0..len {
                c[k] = i[k] * g[k];
            }
        }

        output_gate.evaluate(t, n, input_dim, dim, x, h_previous, Some(cec.slot(t)));
        let (o, c) = (output_gate.b.slot(t), cec.slot(t));
        let h = b.slot_mut(t);
        for k in 0..len {
            h[k] = o[k] * c[k].tanh();
        }
        self.b_t += 1;
    }

    fn output(&self) -> &[Real] {
        self.b.slot(self.last_slot())
    }

    fn compute_delta(&mut self, slice: &[usize], downstream: Option<&mut Layer>) {
        assert!(self.b_t > 0, "compute_delta without a matching evaluate");
        self.b_t -= 1;
        let t = self.b_t;
        let s = self.delta_t;
        let n = slice.len();
        let dim = self.dim;
        let len = n * dim;
        let Self {
            cell_input,
            input_gate,
            forget_gate,
            output_gate,
            cec,
            cec_epsilon,
            output_delta,
            ..
        } = &mut *self;

        // Delta on h_t: from the layer above, plus every unit's recurrent path from t + 1.
        let dh = &mut output_delta[..len];
        dh.fill(0.0);
        downstream
            .expect("lstm layer needs a layer above it")
            .add_delta(slice, dh);
        if s > 0 {
            for gate in [&*cell_input, &*input_gate, &*forget_gate, &*output_gate] {
                kernel::affine_transpose(
                    n,
                    dim,
                    dim,
                    gate.recurrent.weights(),
                    gate.delta.slot(s - 1),
                    dh,
                );
            }
        }
        let dh = &*dh;

        let (epsilon_next, epsilon) = if s > 0 {
            let (next, current) = cec_epsilon.previous_and_current(s);
            (Some(next), current)
        } else {
            (None, cec_epsilon.slot_mut(s))
        };

        // Split into the output gate delta and the direct cell state error.
        let c = cec.slot(t);
        let o = output_gate.b.slot(t);
        let d_o = output_gate.delta.slot_mut(s);
        for k in 0..len {
            let tanh_c = c[k].tanh();
            epsilon[k] = o[k] * dh[k] * (1.0 - tanh_c * tanh_c);
            d_o[k] = tanh_c * dh[k] * o[k] * (1.0 - o[k]);
        }
        if let Some(peephole) = &output_gate.peephole {
            add_diagonal(n, dim, peephole.weights(), d_o, epsilon);
        }

        // Cell state error inherited from t + 1.
        if let Some(epsilon_next) = epsilon_next {
            let f_next = forget_gate.b.slot(t + 1);
            for k in 0..len {
                epsilon[k] = f_next[k].mul_add(epsilon_next[k], epsilon[k]);
            }
            if let Some(peephole) = &input_gate.peephole {
                add_diagonal(n, dim, peephole.weights(), input_gate.delta.slot(s - 1), epsilon);
            }
            if let Some(peephole) = &forget_gate.peephole {
                add_diagonal(n, dim, peephole.weights(), forget_gate.delta.slot(s - 1), epsilon);
            }
        }
        let epsilon = &*epsilon;

        let (i, g) = (input_gate.b.slot(t), cell_input.b.slot(t));
        let d_g = cell_input.delta.slot_mut(s);
        for k in 0..len {
            d_g[k] = i[k] * epsilon[k] * (1.0 - g[k] * g[k]);
        }

        let c_previous = (t > 0).then(|| cec.slot(t - 1));
        rayon::join(
            || {
                if let Some(c_previous) = c_previous {
                    let f = forget_gate.b.slot(t);
                    let d_f = forget_gate.delta.slot_mut(s);
                    for k in 0..len {
                        d_f[k] = c_previous[k] * epsilon[k] * f[k] * (1.0 - f[k]);
                    }
                }
            },
            || {
                let d_i = input_gate.delta.slot_mut(s);
                for k in 0..len {
                    d_i[k] = epsilon[k] * g[k] * i[k] * (1.0 - i[k]);
                }
            },
        );
    }

    fn add_delta(&mut self, slice: &[usize], delta: &mut [Real]) {
        let n = slice.len();
        let s = self.delta_t;
        for gate in self.gates() {
            kernel::affine_transpose(
                n,
                self.dim,
                self.input_dim,
                gate.weights.weights(),
                gate.delta.slot(s),
                delta,
            );
        }
        self.delta_t += 1;
    }

    fn update_weights(&mut self, slice: &[usize], learning_rate: Real, x: Input<'_>) {
        let x = x.activations();
        let n = slice.len();
        assert!(self.delta_t > 0, "update_weights without a matching compute_delta");
        self.delta_t -= 1;
        let (s, t) = (self.delta_t, self.b_t);
        let (input_dim, dim) = (self.input_dim, self.dim);
        let Self {
            cell_input,
            input_gate,
            forget_gate,
            output_gate,
            b,
            cec,
            ..
        } = &mut *self;

        let h_previous = (t > 0).then(|| b.slot(t - 1));
        let c_previous = (t > 0).then(|| cec.slot(t - 1));
        let c = cec.slot(t);
        let lr = learning_rate;
        rayon::join(
            || {
                rayon::join(
                    || cell_input.update(s, n, input_dim, dim, lr, x, h_previous, None),
                    || input_gate.update(s, n, input_dim, dim, lr, x, h_previous, c_previous),
                )
            },
            || {
                rayon::join(
                    || forget_gate.update(s, n, input_dim, dim, lr, x, h_previous, c_previous),
                    || output_gate.update(s, n, input_dim, dim, lr, x, h_previous, Some(c)),
                )
            },
        );
        self.b_t += 1;
    }

    fn params(&self) -> Vec<(&'static str, &Param)> {
        let mut params = vec![
            ("cell_input.weights", &self.cell_input.weights),
            ("input_gate.weights", &self.input_gate.weights),
            ("forget_gate.weights", &self.forget_gate.weights),
            ("output_gate.weights", &self.output_gate.weights),
            ("cell_input.recurrent", &self.cell_input.recurrent),
            ("input_gate.recurrent", &self.input_gate.recurrent),
            ("forget_gate.recurrent", &self.forget_gate.recurrent),
            ("output_gate.recurrent", &self.output_gate.recurrent),
        ];
        let peepholes = [
            ("input_gate.peephole", &self.input_gate.peephole),
            ("forget_gate.peephole", &self.forget_gate.peephole),
            ("output_gate.peephole", &self.output_gate.peephole),
        ];
        params.extend(peepholes.into_iter().filter_map(|(n, p)| p.as_ref().map(|p| (n, p))));
        let biases = [
            ("cell_input.bias", &self.cell_input.bias),
            ("input_gate.bias", &self.input_gate.bias),
            ("forget_gate.bias", &self.forget_gate.bias),
            ("output_gate.bias", &self.output_gate.bias),
        ];
        params.extend(biases.into_iter().filter_map(|(n, p)| p.as_ref().map(|p| (n, p))));
        params
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let Self {
            cell_input: g,
            input_gate: i,
            forget_gate: f,
            output_gate: o,
            ..
        } = self;
        let mut params = vec![
            &mut g.weights,
            &mut i.weights,
            &mut f.weights,
            &mut o.weights,
            &mut g.recurrent,
            &mut i.recurrent,
            &mut f.recurrent,
            &mut o.recurrent,
        ];
        params.extend(i.peephole.as_mut());
        params.extend(f.peephole.as_mut());
        params.extend(o.peephole.as_mut());
        params.extend(g.bias.as_mut());
        params.extend(i.bias.as_mut());
        params.extend(f.bias.as_mut());
        params.extend(o.bias.as_mut());
        params
    }

    fn reset(&mut self, is_dependent: bool) {
        if is_dependent {
            assert_eq!(
                self.max_batch_size, 1,
                "dependent reset requires batch size 1"
            );
            let last = self.last_slot();
            self.b.carry_over(last);
            self.cec.carry_over(last);
            self.b_t = 1;
        } else {
            self.b.fill_zero();
            self.cec.fill_zero();
            self.b_t = 0;
        }
        for gate in [
            &mut self.cell_input,
            &mut self.input_gate,
            &mut self.forget_gate,
            &mut self.output_gate,
        ] {
            gate.b.fill_zero();
            gate.delta.fill_zero();
        }
        self.cec_epsilon.fill_zero();
        self.output_delta.fill(0.0);
        self.delta_t = 0;
    }

    fn cursor(&self) -> Cursor {
        Cursor {
            activation: self.b_t,
            delta: self.delta_t,
        }
    }

    fn extract_state(&self) -> LayerState {
        assert_eq!(self.max_batch_size, 1, "state extraction requires batch size 1");
        let last = self.last_slot();
        LayerState {
            hidden: self.b.slot(last).to_vec(),
            cell: self.cec.slot(last).to_vec(),
            ..LayerState::default()
        }
    }

    fn set_state(&mut self, state: &LayerState) {
        assert_eq!(self.max_batch_size, 1, "state restoration requires batch size 1");
        self.b.slot_mut(0).copy_from_slice(&state.hidden);
        self.cec.slot_mut(0).copy_from_slice(&state.cell);
        self.b_t = 1;
        self.delta_t = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::sigmoid;

    /// Scalar cell with only biases set.
    fn bias_only_cell() -> Lstm {
        let mut lstm = Lstm::new(1, 1, 1, 3, true);
        {
            let mut params = lstm.params_mut();
            // 4 weights, 4 recurrent, 3 peepholes, then biases g, i, f, o.
            params[11].weights_mut()[0] = 0.5;
            params[12].weights_mut()[0] = 1.0;
            params[13].weights_mut()[0] = -1.0;
            params[14].weights_mut()[0] = 2.0;
        }
        lstm
    }

    #[test]
    fn cell_state_accumulates_through_the_forget_gate() {
        let mut lstm = bias_only_cell();
        let (g, i, f, o) = (0.5_f64.tanh(), sigmoid(1.0), sigmoid(-1.0), sigmoid(2.0));

        lstm.evaluate(&[0], Input::Activations(&[3.0]));
        let c0 = i * g;
        assert!((lstm.cell_states().slot(0)[0] - c0).abs() < 1e-12);
        assert!((lstm.output()[0] - o * c0.tanh()).abs() < 1e-12);

        lstm.evaluate(&[0], Input::Activations(&[-3.0]));
        let c1 = i * g + f * c0;
        assert!((lstm.cell_states().slot(1)[0] - c1).abs() < 1e-12);
        assert!((lstm.output()[0] - o * c1.tanh()).abs() < 1e-12);
        assert_eq!(lstm.cursor(), Cursor { activation: 2, delta: 0 });
    }

    #[test]
    fn params_follow_checkpoint_order() {
        let lstm = Lstm::new(2, 3, 1, 2, true);
        let names: Vec<_> = lstm.params().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names.len(), 15);
        assert_eq!(names[0], "cell_input.weights");
        assert_eq!(names[8], "input_gate.peephole");
        assert_eq!(names[14], "output_gate.bias");

        let without_bias = Lstm::new(2, 3, 1, 2, false);
        assert_eq!(without_bias.params().len(), 11);
    }

    #[test]
    fn dependent_reset_carries_hidden_and_cell_state() {
        let mut lstm = bias_only_cell();
        lstm.evaluate(&[0], Input::Activations(&[1.0]));
        let state = lstm.extract_state();

        lstm.reset(true);
        assert_eq!(lstm.cursor(), Cursor { activation: 1, delta: 0 });
        assert_eq!(lstm.extract_state(), state);

        lstm.reset(false);
        let mut restored = lstm.clone();
        restored.set_state(&state);
        assert_eq!(restored.extract_state(), state);
    }
}
