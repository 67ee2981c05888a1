use crate::Real;
use crate::activation::Activation;
use crate::buffer::{Cursor, TimeBuffer};
use crate::kernel;
use crate::layer::{Function, Input, Layer, LayerState, Param, Recurrency};

/// Dense layer `y_t = f(b + W x_t [+ W_rec y_{t-1}])`.
///
/// Weights are row-major with shape `(output_dim, input_dim)`.
#[derive(Debug, Clone)]
pub struct Linear {
    input_dim: usize,
    output_dim: usize,
    max_batch_size: usize,
    activation: Activation,
    weights: Param,
    bias: Option<Param>,
    recurrency: Option<Recurrency>,
    b: TimeBuffer,
    delta: TimeBuffer,
    b_t: usize,
    delta_t: usize,
}

impl Linear {
    pub fn new(
        input_dim: usize,
        output_dim: usize,
        max_batch_size: usize,
        max_sequence_length: usize,
        activation: Activation,
        use_bias: bool,
        is_recurrent: bool,
    ) -> Self {
        let stride = output_dim * max_batch_size;
        Self {
            input_dim,
            output_dim,
            max_batch_size,
            activation,
            weights: Param::zeros(output_dim * input_dim),
            bias: use_bias.then(|| Param::zeros(output_dim)),
            recurrency: is_recurrent.then(|| Recurrency::new(output_dim)),
            b: TimeBuffer::new(stride, max_sequence_length),
            delta: TimeBuffer::new(stride, max_sequence_length),
            b_t: 0,
            delta_t: 0,
        }
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn is_recurrent(&self) -> bool {
        self.recurrency.is_some()
    }

    fn last_slot(&self) -> usize {
        self.b_t.saturating_sub(1)
    }
}

impl Function for Linear {
    fn input_dimension(&self) -> usize {
        self.input_dim
    }

    fn output_dimension(&self) -> usize {
        self.output_dim
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

        let y = self.b.slot_mut(t);
        kernel::fill_rows(n, self.bias.as_ref().map(Param::weights), y, self.output_dim);
        kernel::affine(n, self.output_dim, self.input_dim, self.weights.weights(), x, y);
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

        let downstream = downstream.expect("linear layer needs a layer above it");
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
    }

    fn add_delta(&mut self, slice: &[usize], delta: &mut [Real]) {
        kernel::affine_transpose(
            slice.len(),
            self.output_dim,
            self.input_dim,
            self.weights.weights(),
            self.delta.slot(self.delta_t),
            delta,
        );
        self.delta_t += 1;
    }

    fn update_weights(&mut self, slice: &[usize], learning_rate: Real, x: Input<'_>) {
        let x = x.activations();
        let n = slice.len();
        assert!(self.delta_t > 0, "update_weights without a matching compute_delta");
        self.delta_t -= 1;
        let t = self.b_t;
        let d = self.delta.slot(self.delta_t);

        if let Some(bias) = &mut self.bias {
            kernel::column_sum_into(n, -learning_rate, d, bias.momentum_mut());
        }
        kernel::accumulate_outer(
            n,
            self.output_dim,
            self.input_dim,
            -learning_rate,
            d,
            x,
            self.weights.momentum_mut(),
        );
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

    fn extract_state(&self) -> LayerState {
        if !self.is_recurrent() {
            return LayerState::default();
        }
        assert_eq!(self.max_batch_size, 1, "state extraction requires batch size 1");
        LayerState {
            hidden: self.output().to_vec(),
            ..LayerState::default()
        }
    }

    fn set_state(&mut self, state: &LayerState) {
        if !self.is_recurrent() {
            return;
        }
        assert_eq!(self.max_batch_size, 1, "state restoration requires batch size 1");
        self.b.slot_mut(0).copy_from_slice(&state.hidden);
        self.b_t = 1;
        self.delta_t = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_layer(recurrent: bool) -> Linear {
        let mut layer = Linear::new(2, 2, 2, 3, Activation::Identity, true, recurrent);
        {
            let mut params = layer.params_mut();
            params[0]
                .weights_mut()
                .copy_from_slice(&[1.0, 0.0, 0.0, 2.0]);
            params[1].weights_mut().copy_from_slice(&[0.5, -0.5]);
            if recurrent {
                params[2].weights_mut().copy_from_slice(&[1.0, 1.0, 0.0, 0.0]);
            }
        }
        layer
    }

    #[test]
    fn evaluate_is_bias_plus_product_per_sequence() {
        let mut layer = identity_layer(false);
        layer.evaluate(&[0, 0], Input::Activations(&[1.0, 1.0, 3.0, -1.0]));
        assert_eq!(&layer.output()[..4], &[1.5, 1.5, 3.5, -2.5]);
        assert_eq!(layer.cursor(), Cursor { activation: 1, delta: 0 });
    }

    #[test]
    fn recurrence_adds_previous_activation() {
        let mut layer = identity_layer(true);
        layer.evaluate(&[0], Input::Activations(&[1.0, 1.0, 0.0, 0.0]));
        assert_eq!(&layer.output()[..2], &[1.5, 1.5]);
        layer.evaluate(&[0], Input::Activations(&[0.0, 0.0, 0.0, 0.0]));
        // bias + [1 1; 0 0] · [1.5, 1.5]
        assert_eq!(&layer.output()[..2], &[3.5, -0.5]);
    }

    #[test]
    fn add_delta_propagates_through_transposed_weights_and_advances() {
        let mut layer = identity_layer(false);
        layer.delta.slot_mut(0)[..2].copy_from_slice(&[1.0, 1.0]);
        let mut below = [0.0; 2];
        layer.add_delta(&[0], &mut below);
        assert_eq!(below, [1.0, 2.0]);
        assert_eq!(layer.cursor().delta, 1);
    }

    #[test]
    fn params_list_follows_checkpoint_order() {
        let layer = identity_layer(true);
        let names: Vec<_> = layer.params().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["weights", "bias", "recurrent"]);
    }

    #[test]
    #[should_panic]
    fn slice_larger_than_batch_panics() {
        let mut layer = identity_layer(false);
        layer.evaluate(&[0, 0, 0], Input::Activations(&[0.0; 6]));
    }
}
