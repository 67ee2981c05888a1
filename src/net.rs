//! A linear stack of layers ending in the class-factored output layer.
//!
//! The net forwards every layer operation in the right order: `evaluate` and `update_weights`
//! bottom to top, `compute_delta` top to bottom. It also owns the training scalars that are
//! checkpointed together with the weights.
//!
//! # Checkpoint layout
//!
//! All values little-endian, no header or version:
//!
//! ```text
//! epoch: i32 | learning_rate: f64 | best_perplexity: f64 | layer 0 params | layer 1 params | ...
//! ```
//!
//! Each layer writes its [`Param`](crate::layer::Param)s in [`Function::params`] order, each as
//! its weights followed by its momentum.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::layer::{Function, Input, Layer, Output, State};
use crate::random::Random;
use crate::vocabulary::Vocabulary;
use crate::{Error, Real, Result};

/// Training scalars stored with the weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hyperparameters {
    pub epoch: usize,
    pub learning_rate: Real,
    pub momentum: Real,
    pub best_perplexity: Real,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            epoch: 0,
            learning_rate: 0.1,
            momentum: 0.0,
            best_perplexity: Real::MAX,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Net {
    layers: Vec<Layer>,
    vocabulary: Arc<Vocabulary>,
    max_batch_size: usize,
    is_feedforward: bool,
    hyperparameters: Hyperparameters,
}

impl Net {
    /// Compose `layers`, which must start with a table lookup and end with the output layer.
    pub fn new(
        layers: Vec<Layer>,
        vocabulary: Arc<Vocabulary>,
        max_batch_size: usize,
        is_feedforward: bool,
        hyperparameters: Hyperparameters,
    ) -> Self {
        assert!(
            matches!(layers.first(), Some(Layer::TableLookup(_))),
            "the first layer must be a table lookup"
        );
        assert!(
            matches!(layers.last(), Some(Layer::Output(_))),
            "the last layer must be the output layer"
        );
        for pair in layers.windows(2) {
            assert_eq!(
                pair[0].output_dimension(),
                pair[1].input_dimension(),
                "{} -> {} dimension mismatch",
                pair[0].kind(),
                pair[1].kind()
            );
        }
        Self {
            layers,
            vocabulary,
            max_batch_size,
            is_feedforward,
            hyperparameters,
        }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }

    pub fn output_layer(&self) -> &Output {
        self.layers
            .last()
            .and_then(Layer::as_output)
            .expect("a net always ends with the output layer")
    }

    pub fn vocabulary(&self) -> &Arc<Vocabulary> {
        &self.vocabulary
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn is_feedforward(&self) -> bool {
        self.is_feedforward
    }

    pub fn hyperparameters(&self) -> Hyperparameters {
        self.hyperparameters
    }

    pub fn epoch(&self) -> usize {
        self.hyperparameters.epoch
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.hyperparameters.epoch = epoch;
    }

    pub fn learning_rate(&self) -> Real {
        self.hyperparameters.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: Real) {
        self.hyperparameters.learning_rate = learning_rate;
    }

    pub fn momentum(&self) -> Real {
        self.hyperparameters.momentum
    }

    pub fn set_momentum(&mut self, momentum: Real) {
        self.hyperparameters.momentum = momentum;
    }

    pub fn best_perplexity(&self) -> Real {
        self.hyperparameters.best_perplexity
    }

    pub fn set_best_perplexity(&mut self, best_perplexity: Real) {
        self.hyperparameters.best_perplexity = best_perplexity;
    }

    /// Number of learnable values (momentum excluded).
    pub fn num_weights(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|layer| layer.params())
            .map(|(_, p)| p.len())
            .sum()
    }

    /// Forward one timestep. `input` holds the input word of each sequence in `slice` (the
    /// targets of this timestep).
    pub fn evaluate(&mut self, slice: &[usize], input: &[usize]) {
        let (first, rest) = self
            .layers
            .split_first_mut()
            .expect("a net has at least two layers");
        first.evaluate(slice, Input::Words(input));
        let mut below: &Layer = first;
        for layer in rest {
            layer.evaluate(slice, Input::Activations(below.output()));
            below = layer;
        }
    }

    /// Activations of the output layer at the latest timestep.
    pub fn output(&self) -> &[Real] {
        self.output_layer().output()
    }

    /// Backward one timestep, top layer first.
    pub fn compute_delta(&mut self, slice: &[usize]) {
        for i in (0..self.layers.len()).rev() {
            let (below, above) = self.layers.split_at_mut(i + 1);
            below[i].compute_delta(slice, above.first_mut());
        }
    }

    /// Accumulate one timestep's update at the net's learning rate.
    pub fn update_weights(&mut self, slice: &[usize], input: &[usize]) {
        let learning_rate = self.learning_rate();
        self.update_weights_with_rate(slice, learning_rate, input);
    }

    pub fn update_weights_with_rate(
        &mut self,
        slice: &[usize],
        learning_rate: Real,
        input: &[usize],
    ) {
        let (first, rest) = self
            .layers
            .split_first_mut()
            .expect("a net has at least two layers");
        first.update_weights(slice, learning_rate, Input::Words(input));
        let mut below: &Layer = first;
        for layer in rest {
            layer.update_weights(slice, learning_rate, Input::Activations(below.output()));
            below = layer;
        }
    }

    /// `log P(slice)` from the output activations `x` of one timestep.
    pub fn compute_log_probability(
        &self,
        slice: &[usize],
        x: &[Real],
        verbose: bool,
        probabilities: Option<&mut [Vec<Real>]>,
    ) -> Real {
        self.output_layer()
            .compute_log_probability(slice, x, verbose, probabilities)
    }

    pub fn reset(&mut self, is_dependent: bool) {
        assert!(
            !is_dependent || self.max_batch_size == 1,
            "dependent reset requires batch size 1"
        );
        for layer in &mut self.layers {
            layer.reset(is_dependent);
        }
    }

    pub fn reset_histories(&mut self) {
        for layer in &mut self.layers {
            layer.reset_histories();
        }
    }

    /// Apply the accumulated updates, then decay the momentum buffers by the net's momentum.
    pub fn update_momentum_weights(&mut self) {
        let momentum = self.momentum();
        for layer in &mut self.layers {
            layer.update_momentum_weights(momentum);
        }
    }

    pub fn reset_momentum(&mut self) {
        for layer in &mut self.layers {
            layer.reset_momentum();
        }
    }

    pub fn randomize_weights(&mut self, random: &mut Random) {
        for layer in &mut self.layers {
            layer.randomize_weights(random);
        }
    }

    pub fn extract_state(&self) -> State {
        State {
            layers: self.layers.iter().map(Function::extract_state).collect(),
        }
    }

    pub fn set_state(&mut self, state: &State) {
        assert_eq!(
            state.layers.len(),
            self.layers.len(),
            "state does not match the number of layers"
        );
        for (layer, layer_state) in self.layers.iter_mut().zip(&state.layers) {
            layer.set_state(layer_state);
        }
    }

    pub fn write_to(&self, writer: &mut dyn Write) -> io::Result<()> {
        let epoch = i32::try_from(self.epoch())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "epoch exceeds i32"))?;
        writer.write_all(&epoch.to_le_bytes())?;
        writer.write_all(&self.learning_rate().to_le_bytes())?;
        writer.write_all(&self.best_perplexity().to_le_bytes())?;
        self.layers.iter().try_for_each(|layer| layer.write(writer))
    }

    pub fn read_from(&mut self, reader: &mut dyn Read) -> io::Result<()> {
        let mut int = [0; 4];
        reader.read_exact(&mut int)?;
        let epoch = usize::try_from(i32::from_le_bytes(int))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative epoch"))?;
        let mut real = [0; 8];
        reader.read_exact(&mut real)?;
        let learning_rate = Real::from_le_bytes(real);
        reader.read_exact(&mut real)?;
        let best_perplexity = Real::from_le_bytes(real);
        self.layers
            .iter_mut()
            .try_for_each(|layer| layer.read(reader))?;

        self.hyperparameters.epoch = epoch;
        self.hyperparameters.learning_rate = learning_rate;
        self.hyperparameters.best_perplexity = best_perplexity;
        Ok(())
    }

    /// Write a checkpoint to `path`, keeping the previous file as `<path>.bk`.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            let backup = backup_path(path);
            fs::copy(path, &backup).map_err(|e| Error::io(&backup, e))?;
        }
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)
            .and_then(|()| writer.flush())
            .map_err(|e| Error::io(path, e))?;
        info!(path = %path.display(), epoch = self.epoch(), "wrote checkpoint");
        Ok(())
    }

    /// Read a checkpoint written by a net of the same topology.
    pub fn read(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mut reader = BufReader::new(file);
        self.read_from(&mut reader).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::InvalidShape(format!(
                "{} is too short for this network",
                path.display()
            )),
            io::ErrorKind::InvalidData => Error::InvalidData(format!("{}: {e}", path.display())),
            _ => Error::io(path, e),
        })?;
        let mut rest = [0; 1];
        match reader.read(&mut rest) {
            Ok(0) => {}
            Ok(_) => {
                return Err(Error::InvalidShape(format!(
                    "{} is larger than this network",
                    path.display()
                )));
            }
            Err(e) => return Err(Error::io(path, e)),
        }
        info!(
            path = %path.display(),
            epoch = self.epoch(),
            learning_rate = self.learning_rate(),
            "read checkpoint"
        );
        Ok(())
    }
}

/// `<path>.bk`, where [`Net::write`] keeps the previous checkpoint.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut backup = path.as_os_str().to_owned();
    backup.push(".bk");
    PathBuf::from(backup)
}
