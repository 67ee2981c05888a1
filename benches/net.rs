use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use rust_rnnlm::metrics::LogProbability;
use rust_rnnlm::trainer::{compute_perplexity, train_batch};
use rust_rnnlm::{BatchConfig, Data, Net, NetBuilder, Random, Vocabulary, WordWrapping};

const BATCH_SIZE: usize = 8;
const SEQUENCE_LENGTH: usize = 32;

fn setup(topology: &str) -> (Net, Data) {
    let words: Vec<String> = (0..400).map(|i| format!("w{i}")).collect();
    let vocabulary = Arc::new(
        Vocabulary::from_counts(
            words.iter().enumerate().map(|(i, w)| (w.clone(), 1000 / (i as u64 + 1))),
            20,
            "<sb>",
            None,
        )
        .unwrap(),
    );

    let mut random = Random::new(0);
    let lines: Vec<String> = (0..64)
        .map(|_| {
            (0..20)
                .map(|_| words[random.uniform(words.len())].as_str())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect();
    let config = BatchConfig {
        max_batch_size: BATCH_SIZE,
        max_sequence_length: SEQUENCE_LENGTH,
        word_wrapping: WordWrapping::Fixed,
        sentence_boundaries: true,
    };
    let data = Data::from_lines(&lines, &vocabulary, &config).unwrap();
    let net = NetBuilder::new(vocabulary)
        .max_batch_size(BATCH_SIZE)
        .max_sequence_length(SEQUENCE_LENGTH)
        .learning_rate(0.01)
        .build_and_randomize(topology, &mut random)
        .unwrap();
    (net, data)
}

fn lstm_train_batch_bench(c: &mut Criterion) {
    let (mut net, data) = setup("bench-i64-m128");
    let batch = data.batches().next().unwrap();

    c.bench_function("lstm_train_batch_i64_m128_b8", |b| {
        b.iter(|| {
            let mut metric = LogProbability::new();
            net.reset(false);
            net.reset_histories();
            train_batch(&mut net, batch, &mut metric);
            black_box(metric);
        })
    });
}

fn recurrent_perplexity_bench(c: &mut Criterion) {
    let (mut net, data) = setup("bench-r128");

    c.bench_function("recurrent_perplexity_r128", |b| {
        b.iter(|| black_box(compute_perplexity(&mut net, black_box(&data), false)))
    });
}

criterion_group!(benches, lstm_train_batch_bench, recurrent_perplexity_bench);
criterion_main!(benches);
