use std::sync::Arc;

use rust_rnnlm::{
    BatchConfig, Data, Function, GradientCheck, GradientReport, NetBuilder, Random, Trainer,
    TrainerConfig, Vocabulary, WordWrapping,
};

const CORPUS: [&str; 3] = ["the cat sat", "a dog sat on the mat", "the dog ran"];

fn vocabulary() -> Arc<Vocabulary> {
    let entries = [
        ("the", 0),
        ("a", 1),
        ("cat", 2),
        ("dog", 2),
        ("mat", 2),
        ("sat", 3),
        ("ran", 3),
        ("on", 4),
    ];
    Arc::new(Vocabulary::from_word_classes(entries, "<sb>", None).unwrap())
}

/// All of `CORPUS` in a single batch, so one epoch is exactly one weight update.
fn trainer(network: &str, feedforward: bool, use_bias: bool) -> Trainer {
    let vocabulary = vocabulary();
    let config = BatchConfig {
        max_batch_size: CORPUS.len(),
        max_sequence_length: 8,
        word_wrapping: WordWrapping::Verbatim,
        sentence_boundaries: true,
    };
    let data = Data::from_lines(CORPUS, &vocabulary, &config).unwrap();
    assert_eq!(data.num_batches(), 1);

    let mut random = Random::new(7);
    let net = NetBuilder::new(vocabulary)
        .max_batch_size(CORPUS.len())
        .max_sequence_length(8)
        .feedforward(feedforward)
        .use_bias(use_bias)
        .learning_rate(0.1)
        .build_and_randomize(network, &mut random)
        .unwrap();
    Trainer::new(net, data, None, TrainerConfig::new(network), random).unwrap()
}

fn check(network: &str, feedforward: bool, use_bias: bool) -> GradientReport {
    let mut trainer = trainer(network, feedforward, use_bias);
    let before: Vec<Vec<f64>> = trainer
        .net()
        .layers()
        .iter()
        .flat_map(|layer| layer.params().into_iter().map(|(_, p)| p.weights().to_vec()))
        .collect();

    let report = GradientCheck::new(1e-5, 5).run(&mut trainer).unwrap();
    assert_eq!(report.num_checked, trainer.net().num_weights());

    let after: Vec<Vec<f64>> = trainer
        .net()
        .layers()
        .iter()
        .flat_map(|layer| layer.params().into_iter().map(|(_, p)| p.weights().to_vec()))
        .collect();
    assert_eq!(before, after, "gradient check must restore the weights");
    report
}

#[test]
fn table_lookup_and_output_gradients_match() {
    let report = check("grad-i5", false, true);
    assert!(report.is_ok(), "{:#?}", report.mismatches);
}

#[test]
fn recurrent_table_lookup_gradients_match() {
    let report = check("grad-r4", false, true);
    assert!(report.is_ok(), "{:#?}", report.mismatches);
}

#[test]
fn linear_gradients_match() {
    let report = check("grad-i4-R3-l3", false, true);
    assert!(report.is_ok(), "{:#?}", report.mismatches);
}

#[test]
fn lstm_gradients_match() {
    let report = check("grad-i3-m3", false, true);
    assert!(report.is_ok(), "{:#?}", report.mismatches);
}

#[test]
fn lstm_gradients_match_without_bias() {
    let report = check("grad-i3-m3", false, false);
    assert!(report.is_ok(), "{:#?}", report.mismatches);
}

#[test]
fn feedforward_ngram_gradients_match() {
    let report = check("grad-24-L3", true, true);
    assert!(report.is_ok(), "{:#?}", report.mismatches);
}

#[test]
fn disagreement_beyond_the_precision_is_reported() {
    let mut trainer = trainer("grad-i3-l3", false, true);
    // Finite differences never agree to 20 digits.
    let report = GradientCheck::new(1e-5, 20).run(&mut trainer).unwrap();
    assert!(!report.is_ok());
    let mismatch = &report.mismatches[0];
    assert_eq!(mismatch.layer, 0);
    assert_eq!(mismatch.kind, "table-lookup");
    assert_eq!(mismatch.param, "weights");
    assert!((mismatch.analytic - mismatch.numeric).abs() >= mismatch.threshold);
}

#[test]
fn gradient_check_needs_a_positive_learning_rate() {
    let mut trainer = trainer("grad-i3-l3", false, true);
    trainer.net_mut().set_learning_rate(0.0);
    assert!(GradientCheck::default().run(&mut trainer).is_err());
}
