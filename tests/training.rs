use std::path::Path;
use std::sync::Arc;

use rust_rnnlm::net::backup_path;
use rust_rnnlm::trainer::compute_perplexity;
use rust_rnnlm::{
    BatchConfig, Data, Error, Function, Net, NetBuilder, Random, Real, Trainer, TrainerConfig,
    Vocabulary, WordWrapping,
};

const CORPUS: [&str; 3] = ["the cat sat on the mat", "the dog sat", "a cat ran on a mat"];

fn vocabulary() -> Arc<Vocabulary> {
    let words = ["the", "a", "cat", "dog", "sat", "ran", "on", "mat"];
    Arc::new(Vocabulary::from_counts(words.iter().map(|w| (*w, 1)), 3, "<sb>", None).unwrap())
}

fn data(vocabulary: &Vocabulary) -> Data {
    let config = BatchConfig {
        max_batch_size: 1,
        max_sequence_length: 10,
        word_wrapping: WordWrapping::Concatenated,
        sentence_boundaries: true,
    };
    Data::from_lines(CORPUS, vocabulary, &config).unwrap()
}

fn builder(vocabulary: Arc<Vocabulary>) -> NetBuilder {
    NetBuilder::new(vocabulary)
        .max_sequence_length(10)
        .learning_rate(0.1)
}

/// One epoch of a 1-hidden-LSTM network; returns the development perplexity it checkpointed.
fn train_one_epoch(dir: &Path) -> (Real, Net) {
    let vocabulary = vocabulary();
    let data = data(&vocabulary);
    let network = dir.join("lm-i4-m4");
    let mut random = Random::new(42);
    let net = builder(vocabulary)
        .build_and_randomize(&network, &mut random)
        .unwrap();
    let mut config = TrainerConfig::new(&network);
    config.max_epoch = 1;
    let mut trainer = Trainer::new(net, data.clone(), Some(data), config, random).unwrap();
    trainer.train().unwrap();
    let net = trainer.into_net();
    (net.best_perplexity(), net)
}

fn weights(net: &Net) -> Vec<Vec<Real>> {
    net.layers()
        .iter()
        .flat_map(|layer| layer.params().into_iter().map(|(_, p)| p.weights().to_vec()))
        .collect()
}

#[test]
fn training_is_deterministic_for_a_fixed_seed() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let (perplexity_a, net_a) = train_one_epoch(first.path());
    let (perplexity_b, net_b) = train_one_epoch(second.path());

    assert!(perplexity_a.is_finite() && perplexity_a > 1.0);
    assert_eq!(perplexity_a.to_bits(), perplexity_b.to_bits());
    assert_eq!(weights(&net_a), weights(&net_b));
    assert_eq!(net_a.epoch(), 1);
}

#[test]
fn checkpoint_restores_the_trained_network() {
    let dir = tempfile::tempdir().unwrap();
    let (perplexity, mut trained) = train_one_epoch(dir.path());
    let network = dir.path().join("lm-i4-m4");

    let vocabulary = Arc::clone(trained.vocabulary());
    let mut loaded = builder(Arc::clone(&vocabulary))
        .learning_rate(1.0)
        .build_and_load(&network)
        .unwrap();
    assert_eq!(loaded.hyperparameters().epoch, 1);
    assert_eq!(loaded.learning_rate(), 0.1);
    assert_eq!(loaded.best_perplexity(), perplexity);
    assert_eq!(weights(&loaded), weights(&trained));
    for (a, b) in loaded.layers().iter().zip(trained.layers()) {
        for ((_, p), (_, q)) in a.params().into_iter().zip(b.params()) {
            assert_eq!(p.momentum(), q.momentum());
        }
    }

    let data = data(&vocabulary);
    let expected = compute_perplexity(&mut trained, &data, false);
    assert_eq!(compute_perplexity(&mut loaded, &data, false), expected);
    assert_eq!(expected, perplexity);
}

#[test]
fn rewriting_a_checkpoint_keeps_a_backup() {
    let dir = tempfile::tempdir().unwrap();
    let (_, mut net) = train_one_epoch(dir.path());
    let network = dir.path().join("lm-i4-m4");
    let original = std::fs::read(&network).unwrap();

    net.set_epoch(7);
    net.write(&network).unwrap();
    assert_eq!(std::fs::read(backup_path(&network)).unwrap(), original);
    assert_ne!(std::fs::read(&network).unwrap(), original);
}

#[test]
fn checkpoint_of_another_topology_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (_, net) = train_one_epoch(dir.path());
    let other = dir.path().join("lm-i4-m5");
    std::fs::copy(dir.path().join("lm-i4-m4"), &other).unwrap();

    let err = builder(Arc::clone(net.vocabulary()))
        .build_and_load(&other)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidShape(_)), "{err:?}");
}
