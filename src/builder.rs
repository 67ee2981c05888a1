//! Network construction from a topology string.
//!
//! A network is named by its file: `name-<type><dim>-<type><dim>...`. The leading component is
//! an arbitrary name, each following component one layer, and the class-factored output layer
//! is always appended. Layer types:
//!
//! | type | layer |
//! |---|---|
//! | `2`..`9` | n-gram table lookup of that order, identity activation |
//! | `i` | identity |
//! | `l` / `L` | tanh / sigmoid |
//! | `r` / `R` | tanh / sigmoid with recurrence |
//! | `m` / `M` | LSTM (not allowed as the first layer) |
//!
//! The first layer is always a table lookup over the vocabulary; later layers are dense.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::activation::Activation;
use crate::layer::{Function, Layer, Linear, Lstm, Output, TableLookup};
use crate::net::{Hyperparameters, Net};
use crate::random::Random;
use crate::vocabulary::Vocabulary;
use crate::{Error, Result};

/// Buffer slots used by feed-forward (n-gram) nets: they never look further back than one step.
pub const FEEDFORWARD_SEQUENCE_LENGTH: usize = 3;

/// One hidden layer of a topology string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerType {
    NGram(usize),
    Identity,
    Tanh,
    Sigmoid,
    RecurrentTanh,
    RecurrentSigmoid,
    Lstm,
}

impl LayerType {
    fn activation(self) -> Activation {
        match self {
            LayerType::NGram(_) | LayerType::Identity => Activation::Identity,
            LayerType::Tanh | LayerType::RecurrentTanh | LayerType::Lstm => Activation::Tanh,
            LayerType::Sigmoid | LayerType::RecurrentSigmoid => Activation::Sigmoid,
        }
    }

    fn is_recurrent(self) -> bool {
        matches!(self, LayerType::RecurrentTanh | LayerType::RecurrentSigmoid)
    }
}

impl TryFrom<char> for LayerType {
    type Error = Error;

    fn try_from(c: char) -> Result<Self> {
        Ok(match c {
            '2'..='9' => LayerType::NGram(c as usize - '0' as usize),
            'i' => LayerType::Identity,
            'l' => LayerType::Tanh,
            'L' => LayerType::Sigmoid,
            'r' => LayerType::RecurrentTanh,
            'R' => LayerType::RecurrentSigmoid,
            'm' | 'M' => LayerType::Lstm,
            _ => {
                return Err(Error::InvalidConfig(format!("unknown layer type {c:?}")));
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSpec {
    pub layer_type: LayerType,
    pub dimension: usize,
}

/// Parse the layer list out of a network file name (directories are ignored).
pub fn parse_topology(network: impl AsRef<Path>) -> Result<Vec<LayerSpec>> {
    let network = network.as_ref();
    let name = network
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            Error::InvalidConfig(format!("no network name in {}", network.display()))
        })?;

    let mut components = name.split('-');
    components.next();
    let specs = components
        .map(|component| {
            let mut chars = component.chars();
            let type_char = chars.next().ok_or_else(|| {
                Error::InvalidConfig(format!("empty layer in network name {name:?}"))
            })?;
            let layer_type = LayerType::try_from(type_char)?;
            let dimension = chars.as_str().parse::<usize>().map_err(|_| {
                Error::InvalidConfig(format!("invalid layer dimension in {component:?}"))
            })?;
            if dimension == 0 {
                return Err(Error::InvalidConfig(format!(
                    "layer {component:?} has dimension 0"
                )));
            }
            Ok(LayerSpec {
                layer_type,
                dimension,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    match specs.first() {
        None => Err(Error::InvalidConfig(format!(
            "network name {name:?} has no layers (expected name-<type><dim>...)"
        ))),
        Some(first) if first.layer_type == LayerType::Lstm => Err(Error::InvalidConfig(
            "the first layer cannot be an LSTM".to_owned(),
        )),
        Some(first) => match first.layer_type {
            LayerType::NGram(order) if first.dimension % order != 0 => {
                Err(Error::InvalidConfig(format!(
                    "dimension {} of the first layer is not divisible by its order {order}",
                    first.dimension
                )))
            }
            _ => Ok(specs),
        },
    }
}

#[derive(Debug, Clone)]
/// Builder for a [`Net`].
///
/// ```rust
/// use std::sync::Arc;
/// use rust_rnnlm::{NetBuilder, Vocabulary};
///
/// # fn main() -> rust_rnnlm::Result<()> {
/// let vocabulary = Vocabulary::from_word_classes([("a", 0), ("b", 0)], "<sb>", None)?;
/// let net = NetBuilder::new(Arc::new(vocabulary))
///     .max_batch_size(4)
///     .build("toy-i8-m8")?;
/// assert_eq!(net.layers().len(), 3);
/// # Ok(())
/// # }
/// ```
pub struct NetBuilder {
    vocabulary: Arc<Vocabulary>,
    max_batch_size: usize,
    max_sequence_length: usize,
    num_oovs: usize,
    use_bias: bool,
    is_feedforward: bool,
    hyperparameters: Hyperparameters,
}

impl NetBuilder {
    pub fn new(vocabulary: Arc<Vocabulary>) -> Self {
        Self {
            vocabulary,
            max_batch_size: 1,
            max_sequence_length: 100,
            num_oovs: 0,
            use_bias: true,
            is_feedforward: false,
            hyperparameters: Hyperparameters::default(),
        }
    }

    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn max_sequence_length(mut self, max_sequence_length: usize) -> Self {
        self.max_sequence_length = max_sequence_length;
        self
    }

    pub fn num_oovs(mut self, num_oovs: usize) -> Self {
        self.num_oovs = num_oovs;
        self
    }

    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Build an n-gram net that is reset before every timestep.
    pub fn feedforward(mut self, is_feedforward: bool) -> Self {
        self.is_feedforward = is_feedforward;
        self
    }

    pub fn learning_rate(mut self, learning_rate: f64) -> Self {
        self.hyperparameters.learning_rate = learning_rate;
        self
    }

    pub fn momentum(mut self, momentum: f64) -> Self {
        self.hyperparameters.momentum = momentum;
        self
    }

    /// Build the net with all weights zero.
    pub fn build(&self, network: impl AsRef<Path>) -> Result<Net> {
        if self.max_batch_size == 0 {
            return Err(Error::InvalidConfig("max_batch_size must be > 0".to_owned()));
        }
        if self.max_sequence_length < 2 {
            return Err(Error::InvalidConfig(
                "max_sequence_length must be >= 2".to_owned(),
            ));
        }
        let specs = parse_topology(network)?;
        let batch = self.max_batch_size;
        let length = if self.is_feedforward {
            FEEDFORWARD_SEQUENCE_LENGTH
        } else {
            self.max_sequence_length
        };

        let mut layers = Vec::with_capacity(specs.len() + 1);
        let mut input_dim = self.vocabulary.len();
        for (i, spec) in specs.iter().enumerate() {
            let LayerSpec {
                layer_type,
                dimension,
            } = *spec;
            let layer = match layer_type {
                LayerType::Lstm => {
                    Layer::Lstm(Lstm::new(input_dim, dimension, batch, length, self.use_bias))
                }
                _ if i == 0 => {
                    let order = match layer_type {
                        LayerType::NGram(order) => order,
                        _ => 1,
                    };
                    Layer::TableLookup(TableLookup::new(
                        input_dim,
                        dimension,
                        order,
                        batch,
                        length,
                        layer_type.activation(),
                        self.use_bias,
                        layer_type.is_recurrent(),
                        self.is_feedforward,
                    ))
                }
                _ => Layer::Linear(Linear::new(
                    input_dim,
                    dimension,
                    batch,
                    length,
                    layer_type.activation(),
                    self.use_bias,
                    layer_type.is_recurrent(),
                )),
            };
            input_dim = layer.output_dimension();
            layers.push(layer);
        }
        layers.push(Layer::Output(Output::new(
            input_dim,
            batch,
            length,
            self.num_oovs,
            self.use_bias,
            Arc::clone(&self.vocabulary),
        )));

        Ok(Net::new(
            layers,
            Arc::clone(&self.vocabulary),
            batch,
            self.is_feedforward,
            self.hyperparameters,
        ))
    }

    /// Build the net and draw its weights from `random`.
    pub fn build_and_randomize(
        &self,
        network: impl AsRef<Path>,
        random: &mut Random,
    ) -> Result<Net> {
        let mut net = self.build(network)?;
        info!("randomly initializing neural network weights");
        net.randomize_weights(random);
        Ok(net)
    }

    /// Build the net and read weights and training state from the checkpoint at `network`.
    pub fn build_and_load(&self, network: impl AsRef<Path>) -> Result<Net> {
        let network = network.as_ref();
        let mut net = self.build(network)?;
        info!(path = %network.display(), "reading neural network");
        net.read(network)?;
        info!(
            epoch = net.epoch(),
            "best development perplexity: {:.15}",
            net.best_perplexity()
        );
        Ok(net)
    }
}
