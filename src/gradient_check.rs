//! Finite-difference check of the backward pass.
//!
//! For every parameter array of every layer, the analytic gradient of `-log P(training data)` is
//! read off one training epoch as `(w_before - w_after) / learning_rate` and compared with the
//! symmetric difference quotient `(F(w + ε) - F(w - ε)) / 2ε`.
//!
//! The analytic side equals the gradient only when the epoch is a single weight update, so the
//! training data should form one batch (in feed-forward mode, sequences are cut to one step).
//! Run it in `f64`; single precision does not carry enough digits.

use tracing::{debug, info};

use crate::layer::Function;
use crate::trainer::Trainer;
use crate::{Error, Real, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientCheck {
    pub epsilon: Real,
    pub significant_digits: i32,
}

impl Default for GradientCheck {
    fn default() -> Self {
        Self {
            epsilon: 1e-5,
            significant_digits: 6,
        }
    }
}

/// One weight whose analytic and numeric derivatives disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub layer: usize,
    pub kind: &'static str,
    pub param: &'static str,
    pub index: usize,
    pub analytic: Real,
    pub numeric: Real,
    pub threshold: Real,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradientReport {
    pub num_checked: usize,
    pub mismatches: Vec<Mismatch>,
}

impl GradientReport {
    pub fn is_ok(&self) -> bool {
        self.mismatches.is_empty()
    }
}

impl GradientCheck {
    pub fn new(epsilon: Real, significant_digits: i32) -> Self {
        Self {
            epsilon,
            significant_digits,
        }
    }

    /// Largest tolerated difference: `significant_digits` digits relative to the leading digit
    /// of the smaller magnitude, but never looser than absolute `10^-significant_digits`.
    pub fn threshold(&self, analytic: Real, numeric: Real) -> Real {
        let magnitude = analytic.abs().min(numeric.abs()).log10().ceil().max(0.0);
        10.0_f64.powf(magnitude - Real::from(self.significant_digits))
    }

    /// Compare every derivative of the trainer's net. The net (weights, momentum and scalar
    /// state) is left as it was found.
    pub fn run(&self, trainer: &mut Trainer) -> Result<GradientReport> {
        if !(self.epsilon > 0.0) {
            return Err(Error::InvalidConfig("epsilon must be > 0".to_owned()));
        }
        let learning_rate = trainer.net().learning_rate();
        if !(learning_rate > 0.0) {
            return Err(Error::InvalidConfig(
                "gradient check needs a positive learning rate".to_owned(),
            ));
        }
        if trainer.net().is_feedforward() {
            if trainer.training_data().sequences().iter().any(|s| s.len() < 2) {
                return Err(Error::InvalidData(
                    "every sequence needs at least two tokens".to_owned(),
                ));
            }
            trainer.training_data_mut().truncate_sequences(2);
        }
        if trainer.training_data().num_batches() > 1 {
            info!(
                batches = trainer.training_data().num_batches(),
                "training data spans several batches; analytic gradients are approximate"
            );
        }

        info!("testing gradient implementation");
        let saved = trainer.net().clone();
        let analytic = self.analytic_gradients(trainer, learning_rate);
        *trainer.net_mut() = saved;

        let mut report = GradientReport::default();
        let num_layers = trainer.net().layers().len();
        for layer in 0..num_layers {
            let kind = trainer.net().layers()[layer].kind();
            info!(layer, kind, "testing layer");
            let names: Vec<_> = trainer.net().layers()[layer]
                .params()
                .into_iter()
                .map(|(name, _)| name)
                .collect();
            for (p, name) in names.into_iter().enumerate() {
                let numeric = self.difference_quotients(trainer, layer, p);
                for (index, (&a, &n)) in analytic[layer][p].iter().zip(&numeric).enumerate() {
                    debug!("{name}[{index}]: dF/dw = {a:11.7}, ΔF/Δw = {n:11.7}");
                    let threshold = self.threshold(a, n);
                    report.num_checked += 1;
                    if !((a - n).abs() < threshold) {
                        report.mismatches.push(Mismatch {
                            layer,
                            kind,
                            param: name,
                            index,
                            analytic: a,
                            numeric: n,
                            threshold,
                        });
                    }
                }
            }
        }

        if report.is_ok() {
            info!(weights = report.num_checked, "gradient test succeeded");
        }
        Ok(report)
    }

    /// One epoch of training; returns `(w_before - w_after) / lr` per layer and parameter.
    fn analytic_gradients(&self, trainer: &mut Trainer, learning_rate: Real) -> Vec<Vec<Vec<Real>>> {
        trainer.net_mut().reset_momentum();
        let before = snapshot(trainer);
        trainer.train_epoch();
        let after = snapshot(trainer);
        before
            .into_iter()
            .zip(after)
            .map(|(layer_before, layer_after)| {
                layer_before
                    .into_iter()
                    .zip(layer_after)
                    .map(|(w0, w1)| {
                        w0.iter()
                            .zip(&w1)
                            .map(|(a, b)| (a - b) / learning_rate)
                            .collect()
                    })
                    .collect()
            })
            .collect()
    }

    fn difference_quotients(&self, trainer: &mut Trainer, layer: usize, param: usize) -> Vec<Real> {
        let len = trainer.net().layers()[layer].params()[param].1.len();
        let mut quotients = Vec::with_capacity(len);
        for i in 0..len {
            let w = weight_mut(trainer, layer, param, i);
            let original = *w;
            *w = original + self.epsilon;
            let f1 = -trainer.training_log_probability().log_probability();
            *weight_mut(trainer, layer, param, i) = original - self.epsilon;
            let f0 = -trainer.training_log_probability().log_probability();
            *weight_mut(trainer, layer, param, i) = original;
            quotients.push((f1 - f0) / (2.0 * self.epsilon));
        }
        quotients
    }
}

fn weight_mut(trainer: &mut Trainer, layer: usize, param: usize, index: usize) -> &mut Real {
    let mut params = trainer.net_mut().layers_mut()[layer].params_mut();
    let param = params.swap_remove(param);
    &mut param.weights_mut()[index]
}

fn snapshot(trainer: &Trainer) -> Vec<Vec<Vec<Real>>> {
    trainer
        .net()
        .layers()
        .iter()
        .map(|layer| {
            layer
                .params()
                .into_iter()
                .map(|(_, p)| p.weights().to_vec())
                .collect()
        })
        .collect()
}
