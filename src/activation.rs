//! Activation functions.
//!
//! A layer computes a pre-activation value `z = W x + b` into its activation slot and then
//! applies the activation in place, one `dim`-sized row per active sequence: `y = activation(z)`.
//!
//! Only the post-activation outputs `y` are kept. During backprop the delta `dL/dy` is turned
//! into `dL/dz` using `y`, which is why the derivative is expressed in terms of the output.

use rayon::prelude::*;

use crate::Real;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Activation applied to the first `batch` rows of a buffer.
pub enum Activation {
    Identity,
    Tanh,
    Sigmoid,
    /// Normalises each row to a probability distribution.
    Softmax,
}

impl Activation {
    /// Apply the activation to rows `0..batch` of `b` (row length `dim`).
    pub fn evaluate(self, dim: usize, batch: usize, b: &mut [Real]) {
        let b = &mut b[..dim * batch];
        match self {
            Activation::Identity => {}
            Activation::Tanh => b.par_chunks_mut(dim).for_each(|row| {
                row.iter_mut().for_each(|v| *v = v.tanh());
            }),
            Activation::Sigmoid => b.par_chunks_mut(dim).for_each(|row| {
                row.iter_mut().for_each(|v| *v = sigmoid(*v));
            }),
            Activation::Softmax => b.par_chunks_mut(dim).for_each(softmax),
        }
    }

    /// Turn `dL/dy` in `delta` into `dL/dz` given the outputs `b`.
    ///
    /// Softmax uses the cross-entropy shortcut: `delta` must hold the one-hot targets on
    /// entry and becomes `y - target`.
    pub fn multiply_derivative(self, dim: usize, batch: usize, b: &[Real], delta: &mut [Real]) {
        let n = dim * batch;
        let (b, delta) = (&b[..n], &mut delta[..n]);
        match self {
            Activation::Identity => {}
            Activation::Softmax => {
                for (d, &y) in delta.iter_mut().zip(b) {
                    *d = y - *d;
                }
            }
            Activation::Tanh | Activation::Sigmoid => {
                for (d, &y) in delta.iter_mut().zip(b) {
                    *d *= self.grad_from_output(y);
                }
            }
        }
    }

    /// Derivative of the activation with respect to its input, expressed in terms
    /// of the cached post-activation output `y`.
    #[inline]
    pub(crate) fn grad_from_output(self, y: Real) -> Real {
        match self {
            Activation::Tanh => 1.0 - y * y,
            Activation::Sigmoid => y * (1.0 - y),
            Activation::Identity => 1.0,
            Activation::Softmax => unreachable!("softmax has no element-wise derivative"),
        }
    }
}

#[inline]
pub(crate) fn sigmoid(x: Real) -> Real {
    // Numerically stable sigmoid.
    if x >= 0.0 {
        let z = (-x).exp();
        1.0 / (1.0 + z)
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

fn softmax(row: &mut [Real]) {
    let max = row.iter().copied().fold(Real::NEG_INFINITY, Real::max);
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    let inv = 1.0 / sum;
    row.iter_mut().for_each(|v| *v *= inv);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_basic_values() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
        assert!(sigmoid(10.0) > 0.9999);
        assert!(sigmoid(-10.0) < 0.0001);
        assert!(sigmoid(-800.0).is_finite());
    }

    #[test]
    fn softmax_rows_sum_to_one_and_leave_padding_alone() {
        let mut b = vec![1.0, 2.0, 3.0, -1000.0, 0.0, 1000.0, 7.0, 7.0, 7.0];
        Activation::Softmax.evaluate(3, 2, &mut b);
        for row in b[..6].chunks(3) {
            let sum: Real = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-12);
        }
        assert_eq!(&b[6..], &[7.0, 7.0, 7.0]);
    }

    #[test]
    fn softmax_derivative_is_output_minus_target() {
        let b = [0.2, 0.3, 0.5];
        let mut delta = [0.0, 1.0, 0.0];
        Activation::Softmax.multiply_derivative(3, 1, &b, &mut delta);
        assert!((delta[0] - 0.2).abs() < 1e-12);
        assert!((delta[1] + 0.7).abs() < 1e-12);
        assert!((delta[2] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn tanh_and_sigmoid_gradients_from_output() {
        let mut b = [0.3, 0.0];
        Activation::Tanh.evaluate(1, 1, &mut b);
        Activation::Sigmoid.evaluate(1, 2, &mut b[..]);
        let mut delta = [2.0, 2.0];
        Activation::Sigmoid.multiply_derivative(1, 2, &b, &mut delta);
        assert!((delta[1] - 0.5).abs() < 1e-12);
        let y = b[0];
        assert!((delta[0] - 2.0 * y * (1.0 - y)).abs() < 1e-12);
    }
}
