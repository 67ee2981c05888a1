use rust_rnnlm::{BatchConfig, Data, Random, Vocabulary, WordWrapping};

const WORDS: [&str; 6] = ["a", "b", "c", "d", "e", "f"];

fn vocabulary() -> Vocabulary {
    Vocabulary::from_word_classes(WORDS.iter().map(|w| (*w, 0)), "<sb>", None).unwrap()
}

/// Lines of 1 to 14 words, reproducible for a seed.
fn corpus(seed: u64, num_lines: usize) -> Vec<String> {
    let mut random = Random::new(seed);
    (0..num_lines)
        .map(|_| {
            let len = 1 + random.uniform(14);
            (0..len)
                .map(|_| WORDS[random.uniform(WORDS.len())])
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

fn configs() -> impl Iterator<Item = BatchConfig> {
    let wrappings = [
        WordWrapping::Concatenated,
        WordWrapping::Fixed,
        WordWrapping::Verbatim,
    ];
    wrappings.into_iter().flat_map(|word_wrapping| {
        [(1, 2), (1, 5), (3, 4), (4, 20), (7, 3)].into_iter().map(
            move |(max_batch_size, max_sequence_length)| BatchConfig {
                max_batch_size,
                max_sequence_length,
                word_wrapping,
                sentence_boundaries: true,
            },
        )
    })
}

#[test]
fn batches_respect_size_length_and_order() {
    let vocabulary = vocabulary();
    for seed in 1..4 {
        let lines = corpus(seed, 23);
        let num_tokens: usize = lines
            .iter()
            .map(|line| line.split_whitespace().count() + 1)
            .sum();
        for config in configs() {
            let data = Data::from_lines(&lines, &vocabulary, &config).unwrap();
            assert_eq!(
                data.num_running_words(),
                num_tokens,
                "every token is predicted exactly once ({config:?})"
            );
            assert_eq!(data.batches().len(), data.num_batches());
            for batch in data.batches() {
                assert!(!batch.is_empty() && batch.len() <= config.max_batch_size);
                let lengths: Vec<_> = batch.sequences().iter().map(Vec::len).collect();
                assert!(
                    lengths.windows(2).all(|w| w[0] >= w[1]),
                    "{lengths:?} ({config:?})"
                );
                assert!(lengths.iter().all(|&len| len <= config.max_sequence_length));
            }
        }
    }
}

#[test]
fn slices_pair_inputs_with_targets_and_shrink() {
    let vocabulary = vocabulary();
    let lines = corpus(9, 17);
    let config = BatchConfig {
        max_batch_size: 5,
        max_sequence_length: 6,
        word_wrapping: WordWrapping::Verbatim,
        sentence_boundaries: true,
    };
    let data = Data::from_lines(&lines, &vocabulary, &config).unwrap();
    for batch in data.batches() {
        let inputs: Vec<_> = batch.slices(0).collect();
        let targets: Vec<_> = batch.slices(1).collect();
        assert_eq!(inputs.len(), batch.num_steps());
        assert_eq!(targets.len(), batch.num_steps());
        for (t, (input, target)) in inputs.iter().zip(&targets).enumerate() {
            assert_eq!(input.len(), target.len());
            for (i, sequence) in batch.sequences().iter().take(input.len()).enumerate() {
                assert_eq!(input[i], sequence[t]);
                assert_eq!(target[i], sequence[t + 1]);
            }
        }
        assert!(targets.windows(2).all(|w| w[0].len() >= w[1].len()));

        let reversed: Vec<_> = batch.slices(1).rev().collect();
        assert!(reversed.iter().eq(targets.iter().rev()));
    }
}

#[test]
fn one_token_line_after_a_full_sequence() {
    let vocabulary = vocabulary();
    let index = |w: &str| vocabulary.index(w).unwrap();
    let sb = vocabulary.sb();
    let config = BatchConfig {
        max_batch_size: 1,
        max_sequence_length: 4,
        word_wrapping: WordWrapping::Concatenated,
        sentence_boundaries: true,
    };

    let data = Data::from_lines(["c"], &vocabulary, &config).unwrap();
    assert_eq!(data.sequences(), &[vec![sb, index("c"), sb]]);

    // "a b <sb>" fills the first sequence; "c <sb>" starts a new one after its last token.
    let data = Data::from_lines(["a b", "c"], &vocabulary, &config).unwrap();
    assert_eq!(
        data.sequences(),
        &[
            vec![sb, index("a"), index("b"), sb],
            vec![sb, index("c"), sb],
        ]
    );
}

#[test]
fn concatenation_never_exceeds_the_sequence_length() {
    let vocabulary = vocabulary();
    let lines = ["a b c d e f a b c d e f a", "b", "c d"];
    for max_sequence_length in 2..8 {
        let config = BatchConfig {
            max_batch_size: 2,
            max_sequence_length,
            word_wrapping: WordWrapping::Concatenated,
            sentence_boundaries: true,
        };
        let data = Data::from_lines(lines, &vocabulary, &config).unwrap();
        assert!(
            data.sequences()
                .iter()
                .all(|s| s.len() <= max_sequence_length && s.len() >= 2),
            "{:?}",
            data.sequences()
        );
    }
}
