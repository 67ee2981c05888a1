//! Recurrent and LSTM language models trained with truncated backpropagation through time.
//!
//! `rust-rnnlm` trains word-level language models whose output layer factors the vocabulary
//! into classes: `p(w | h) = p(class(w) | h) · p(w | class(w), h)`. A network is a stack of
//! layers named by its file (see [`builder`]), trained batch by batch with a forward pass, a
//! reversed backward pass and a momentum update, and checkpointed whenever the development
//! perplexity improves.
//!
//! # Panics vs `Result`
//!
//! - Low-level hot path (panics on misuse): [`Net::evaluate`], [`Net::compute_delta`],
//!   [`Net::update_weights`] and the [`layer::Function`] methods. Shape and cursor violations are
//!   programmer errors and panic via `assert!`.
//! - Everything that touches files or user input returns [`Result`]: corpus and vocabulary
//!   loading, topology parsing, checkpoints, configuration.
//!
//! # Data layout
//!
//! - Scalars are `f64` ([`Real`]).
//! - Layer weights are row-major with shape `(out_dim, in_dim)`.
//! - Every per-timestep quantity of a layer lives in one arena of `max_sequence_length` slots;
//!   in one slot, sequence `i` of the batch occupies `[i * dim, (i + 1) * dim)`.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use rust_rnnlm::{BatchConfig, Data, NetBuilder, Random, Trainer, TrainerConfig, Vocabulary};
//!
//! # fn main() -> rust_rnnlm::Result<()> {
//! let vocabulary = Arc::new(Vocabulary::from_word_classes(
//!     [("the", 0), ("cat", 1), ("dog", 1), ("sat", 2)],
//!     "<sb>",
//!     None,
//! )?);
//! let corpus = ["the cat sat", "the dog sat"];
//! let data = Data::from_lines(corpus, &vocabulary, &BatchConfig::default())?;
//!
//! let dir = std::env::temp_dir().join("rust-rnnlm-doc");
//! std::fs::create_dir_all(&dir).ok();
//! let network = dir.join("toy-i4-m4");
//! let mut random = Random::new(1);
//! let net = NetBuilder::new(vocabulary).build_and_randomize(&network, &mut random)?;
//!
//! let mut trainer = Trainer::new(net, data.clone(), Some(data), TrainerConfig::new(network), random)?;
//! let perplexity = trainer.train_epoch().perplexity();
//! assert!(perplexity.is_finite());
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod buffer;
pub mod builder;
pub mod config;
pub mod data;
pub mod error;
pub mod file;
pub mod gradient_check;
pub(crate) mod kernel;
pub mod layer;
pub mod metrics;
pub mod net;
pub mod random;
pub mod trainer;
pub mod vocabulary;

/// Scalar type of all weights and activations.
pub type Real = f64;

pub use activation::Activation;
pub use builder::{LayerSpec, LayerType, NetBuilder, parse_topology};
pub use config::{Options, Settings};
pub use data::{Batch, BatchConfig, Data, Sequence, WordWrapping};
pub use error::{Error, Result};
pub use gradient_check::{GradientCheck, GradientReport};
pub use layer::{Function, Layer, LayerState, State};
pub use metrics::LogProbability;
pub use net::{Hyperparameters, Net};
pub use random::Random;
pub use trainer::{Trainer, TrainerConfig};
pub use vocabulary::Vocabulary;
