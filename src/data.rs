//! Corpus preparation and batching.
//!
//! A [`Data`] holds the training or evaluation corpus as sequences of vocabulary indices. Every
//! sequence starts with the last token of its predecessor (the sentence boundary for the first
//! one), so the input at position `p` predicts the target at position `p + 1`.
//!
//! Sequences are grouped into consecutive windows of `max_batch_size` and each window is sorted
//! by descending length. A [`Batch`] exposes one window as time [slices](Batch::slices): the
//! active sequences at one position, in batch order, shrinking as shorter sequences run out.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::file::ReadableFile;
use crate::random::Random;
use crate::vocabulary::Vocabulary;
use crate::{Error, Result};

/// Vocabulary indices of one training sequence.
pub type Sequence = Vec<usize>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
/// How input lines are turned into sequences.
pub enum WordWrapping {
    /// Lines are packed greedily into sequences of up to `max_sequence_length - 1` tokens.
    Concatenated,
    /// The corpus is cut into `max_batch_size` interleaved streams of equal length.
    #[default]
    Fixed,
    /// One sequence per line; over-long lines are split.
    Verbatim,
}

impl FromStr for WordWrapping {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "concatenated" => Ok(Self::Concatenated),
            "fixed" => Ok(Self::Fixed),
            "verbatim" => Ok(Self::Verbatim),
            other => Err(Error::InvalidConfig(format!(
                "unknown word wrapping {other:?} (expected concatenated, fixed or verbatim)"
            ))),
        }
    }
}

impl fmt::Display for WordWrapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Concatenated => "concatenated",
            Self::Fixed => "fixed",
            Self::Verbatim => "verbatim",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_sequence_length: usize,
    pub word_wrapping: WordWrapping,
    /// Append a sentence boundary to every line and prefix every sequence with its
    /// predecessor's last token.
    pub sentence_boundaries: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1,
            max_sequence_length: 100,
            word_wrapping: WordWrapping::Fixed,
            sentence_boundaries: true,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be > 0".to_owned()));
        }
        if self.max_sequence_length < 2 {
            return Err(Error::InvalidConfig(
                "sequence length must be >= 2".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    sequences: Vec<Sequence>,
    max_batch_size: usize,
    max_sequence_length: usize,
}

impl Data {
    pub fn from_file(
        path: impl AsRef<Path>,
        vocabulary: &Vocabulary,
        config: &BatchConfig,
    ) -> Result<Self> {
        let lines = ReadableFile::open(path)?.lines().collect::<Result<Vec<_>>>()?;
        Self::from_lines(lines, vocabulary, config)
    }

    pub fn from_lines<I, S>(lines: I, vocabulary: &Vocabulary, config: &BatchConfig) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        config.validate()?;
        let lines = lines
            .into_iter()
            .map(|line| read_indices(line.as_ref(), vocabulary, config.sentence_boundaries))
            .collect::<Result<Vec<_>>>()?;

        let mut data = Self {
            sequences: Vec::new(),
            max_batch_size: config.max_batch_size,
            max_sequence_length: config.max_sequence_length,
        };
        match config.word_wrapping {
            WordWrapping::Concatenated | WordWrapping::Verbatim => {
                let capacity = config.max_sequence_length - 1;
                for line in lines {
                    if config.word_wrapping == WordWrapping::Concatenated {
                        data.append_concatenated(capacity, line);
                    } else {
                        data.sequences
                            .extend(line.chunks(capacity).map(<[usize]>::to_vec));
                    }
                }
                if config.sentence_boundaries {
                    data.prefix_with_previous_token(vocabulary.sb());
                }
            }
            WordWrapping::Fixed => data.prepare_fixed(lines, vocabulary.sb()),
        }
        data.sequences.retain(|s| !s.is_empty());
        data.sort_batches();
        debug_assert!(
            data.sequences
                .iter()
                .all(|s| s.len() <= data.max_sequence_length)
        );
        Ok(data)
    }

    /// Wrap ready-made sequences (already prefixed).
    pub fn from_sequences(
        sequences: Vec<Sequence>,
        max_batch_size: usize,
        max_sequence_length: usize,
    ) -> Result<Self> {
        if max_batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be > 0".to_owned()));
        }
        if let Some(s) = sequences.iter().find(|s| s.len() > max_sequence_length) {
            return Err(Error::InvalidData(format!(
                "sequence of length {} exceeds max_sequence_length {max_sequence_length}",
                s.len()
            )));
        }
        let mut data = Self {
            sequences,
            max_batch_size,
            max_sequence_length,
        };
        data.sort_batches();
        Ok(data)
    }

    fn append_concatenated(&mut self, capacity: usize, mut line: Sequence) {
        if self.sequences.is_empty() {
            self.sequences.push(Sequence::new());
        }
        let last_len = self.sequences.last().map_or(0, Vec::len);
        if last_len + line.len() <= capacity {
            if let Some(last) = self.sequences.last_mut() {
                last.extend(line);
            }
        } else if line.len() <= capacity {
            self.sequences.push(line);
        } else {
            // Fill the open sequence, then continue in fresh ones.
            while !line.is_empty() {
                let last = self.sequences.last_mut().expect("at least one sequence");
                let take = (capacity - last.len()).min(line.len());
                last.extend(line.drain(..take));
                if !line.is_empty() {
                    self.sequences.push(Sequence::new());
                }
            }
        }
    }

    fn prefix_with_previous_token(&mut self, sb: usize) {
        let mut previous = sb;
        for sequence in &mut self.sequences {
            let last = sequence.last().copied().unwrap_or(previous);
            sequence.insert(0, previous);
            previous = last;
        }
    }

    /// Interleave `max_batch_size` streams: sequence `k * max_batch_size + s` is the `k`-th
    /// chunk of stream `s`, and every chunk starts with the last word of the chunk before it.
    fn prepare_fixed(&mut self, lines: Vec<Sequence>, sb: usize) {
        let batch_size = self.max_batch_size;
        let max_len = self.max_sequence_length;
        let num_running_words: usize = lines.iter().map(Vec::len).sum();
        let quota = |stream: usize| {
            num_running_words / batch_size + usize::from(stream < num_running_words % batch_size)
        };

        self.sequences = vec![Sequence::new(); batch_size];
        let (mut j, mut stream) = (0, 0);
        let mut remaining = quota(0);
        let mut last_word = sb;
        for mut line in lines {
            while !line.is_empty() {
                if j >= self.sequences.len() {
                    self.sequences.resize(j + 1, Sequence::new());
                }
                if self.sequences[j].is_empty() {
                    self.sequences[j].push(last_word);
                }
                let take = line
                    .len()
                    .min(max_len - self.sequences[j].len())
                    .min(remaining);
                self.sequences[j].extend(line.drain(..take));
                remaining -= take;
                last_word = *self.sequences[j].last().expect("chunk holds its prefix");

                if self.sequences[j].len() == max_len {
                    if stream == 0 {
                        let len = self.sequences.len();
                        self.sequences.resize(len + batch_size, Sequence::new());
                    }
                    j += batch_size;
                }
                if remaining == 0 && stream != batch_size - 1 {
                    stream += 1;
                    remaining = quota(stream);
                    j = stream;
                }
            }
        }
    }

    /// Sort each window of `max_batch_size` sequences by descending length (stable).
    pub fn sort_batches(&mut self) {
        for window in self.sequences.chunks_mut(self.max_batch_size) {
            window.sort_by(|a, b| b.len().cmp(&a.len()));
        }
    }

    /// Reorder sequences at random, then restore the per-batch length order.
    pub fn shuffle(&mut self, random: &mut Random) {
        self.sequences.sort();
        random.shuffle(&mut self.sequences);
        self.sort_batches();
    }

    /// Cut every sequence to at most `max_len` tokens.
    pub fn truncate_sequences(&mut self, max_len: usize) {
        self.sequences.iter_mut().for_each(|s| s.truncate(max_len));
        self.sort_batches();
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_sequence_length(&self) -> usize {
        self.max_sequence_length
    }

    /// Number of predicted tokens.
    pub fn num_running_words(&self) -> usize {
        self.sequences.iter().map(|s| s.len().saturating_sub(1)).sum()
    }

    pub fn num_batches(&self) -> usize {
        self.sequences.len().div_ceil(self.max_batch_size)
    }

    pub fn batches(&self) -> impl ExactSizeIterator<Item = Batch<'_>> + '_ {
        self.sequences.chunks(self.max_batch_size).map(Batch::new)
    }
}

fn read_indices(line: &str, vocabulary: &Vocabulary, sentence_boundaries: bool) -> Result<Sequence> {
    let line = line.trim();
    if line.starts_with("<s>") || line.ends_with("</s>") {
        return Err(Error::InvalidData(format!(
            "line must not carry sentence markers: {line:?}"
        )));
    }
    let mut indices = Vec::new();
    for word in line.split_whitespace() {
        let index = vocabulary.index_or_unk(word).ok_or_else(|| {
            Error::InvalidData(format!(
                "word {word:?} is not in the vocabulary and there is no unknown token"
            ))
        })?;
        if sentence_boundaries && index == vocabulary.sb() && vocabulary.index(word).is_some() {
            return Err(Error::InvalidData(format!(
                "line must not contain the sentence boundary token: {line:?}"
            )));
        }
        indices.push(index);
    }
    if sentence_boundaries {
        indices.push(vocabulary.sb());
    }
    Ok(indices)
}

/// One window of up to `max_batch_size` sequences, longest first.
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    sequences: &'a [Sequence],
}

impl<'a> Batch<'a> {
    pub(crate) fn new(sequences: &'a [Sequence]) -> Self {
        debug_assert!(sequences.windows(2).all(|w| w[0].len() >= w[1].len()));
        Self { sequences }
    }

    pub fn sequences(&self) -> &'a [Sequence] {
        self.sequences
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Number of prediction steps (length of the longest sequence minus its prefix).
    pub fn num_steps(&self) -> usize {
        self.sequences.first().map_or(0, |s| s.len().saturating_sub(1))
    }

    /// Tokens at `position` of every sequence still active there. With `offset` 0 a
    /// sequence is active while it has a successor (input view); with `offset` 1 while the
    /// position exists (target view).
    pub fn slice(&self, position: usize, offset: usize) -> Vec<usize> {
        self.sequences
            .iter()
            .take_while(|s| s.len() + offset > position + 1)
            .map(|s| s[position])
            .collect()
    }

    /// Input slices (`offset` 0, positions `0..steps`) or target slices (`offset` 1, positions
    /// `1..=steps`), iterable from either end.
    pub fn slices(&self, offset: usize) -> Slices<'a> {
        assert!(offset <= 1, "slice offset must be 0 or 1, got {offset}");
        Slices {
            batch: *self,
            offset,
            front: offset,
            back: self.num_steps() + offset,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Slices<'a> {
    batch: Batch<'a>,
    offset: usize,
    front: usize,
    back: usize,
}

impl Iterator for Slices<'_> {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        (self.front < self.back).then(|| {
            self.front += 1;
            self.batch.slice(self.front - 1, self.offset)
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.back - self.front;
        (n, Some(n))
    }
}

impl DoubleEndedIterator for Slices<'_> {
    fn next_back(&mut self) -> Option<Vec<usize>> {
        (self.front < self.back).then(|| {
            self.back -= 1;
            self.batch.slice(self.back, self.offset)
        })
    }
}

impl ExactSizeIterator for Slices<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vocabulary {
        let words = ["a", "b", "c", "d", "e"];
        Vocabulary::from_word_classes(words.iter().map(|w| (*w, 0)), "<sb>", Some("<unk>"))
            .unwrap()
    }

    fn idx(vocab: &Vocabulary, words: &str) -> Sequence {
        words.split_whitespace().map(|w| vocab.index(w).unwrap()).collect()
    }

    fn config(wrapping: WordWrapping, batch: usize, len: usize) -> BatchConfig {
        BatchConfig {
            max_batch_size: batch,
            max_sequence_length: len,
            word_wrapping: wrapping,
            sentence_boundaries: true,
        }
    }

    #[test]
    fn one_token_line_is_prefixed_and_terminated() {
        let v = vocab();
        let data = Data::from_lines(["a"], &v, &config(WordWrapping::Concatenated, 1, 10)).unwrap();
        assert_eq!(data.sequences(), &[idx(&v, "<sb> a <sb>")]);
        assert_eq!(data.num_running_words(), 2);
    }

    #[test]
    fn concatenation_packs_and_splits_long_lines() {
        let v = vocab();
        let cfg = config(WordWrapping::Concatenated, 1, 4);
        let data = Data::from_lines(["a", "b c", "a b c d e"], &v, &cfg).unwrap();
        assert_eq!(
            data.sequences(),
            &[
                idx(&v, "<sb> a <sb>"),
                idx(&v, "<sb> b c <sb>"),
                idx(&v, "<sb> a b c"),
                idx(&v, "c d e <sb>"),
            ]
        );
        assert!(data.sequences().iter().all(|s| s.len() <= 4));
    }

    #[test]
    fn verbatim_splits_over_long_lines() {
        let v = vocab();
        let cfg = config(WordWrapping::Verbatim, 1, 3);
        let data = Data::from_lines(["a b c"], &v, &cfg).unwrap();
        assert_eq!(
            data.sequences(),
            &[idx(&v, "<sb> a b"), idx(&v, "b c <sb>")]
        );
    }

    #[test]
    fn fixed_mode_interleaves_streams() {
        let v = vocab();
        let cfg = config(WordWrapping::Fixed, 2, 3);
        let data = Data::from_lines(["a b c", "d e"], &v, &cfg).unwrap();
        assert_eq!(
            data.sequences(),
            &[
                idx(&v, "<sb> a b"),
                idx(&v, "<sb> d e"),
                idx(&v, "b c <sb>"),
                idx(&v, "e <sb>"),
            ]
        );
        assert_eq!(data.num_running_words(), 7);
        assert_eq!(data.num_batches(), 2);
    }

    #[test]
    fn unknown_words_map_to_unk_and_markers_are_rejected() {
        let v = vocab();
        let cfg = config(WordWrapping::Verbatim, 1, 10);
        let data = Data::from_lines(["zebra"], &v, &cfg).unwrap();
        assert_eq!(data.sequences()[0][1], v.unk().unwrap());

        assert!(Data::from_lines(["<s> a"], &v, &cfg).is_err());
        assert!(Data::from_lines(["a </s>"], &v, &cfg).is_err());
        assert!(Data::from_lines(["a <sb> b"], &v, &cfg).is_err());
    }

    #[test]
    fn disabled_sentence_boundaries_skip_prefix_and_suffix() {
        let v = vocab();
        let cfg = BatchConfig {
            sentence_boundaries: false,
            ..config(WordWrapping::Verbatim, 1, 10)
        };
        let data = Data::from_lines(["a b"], &v, &cfg).unwrap();
        assert_eq!(data.sequences(), &[idx(&v, "a b")]);
    }

    #[test]
    fn slices_shrink_and_align_inputs_with_targets() {
        let v = vocab();
        let data = Data::from_sequences(
            vec![idx(&v, "a b"), idx(&v, "a b c d"), idx(&v, "c d e")],
            3,
            4,
        )
        .unwrap();
        let batch = data.batches().next().unwrap();
        assert_eq!(batch.num_steps(), 3);

        let inputs: Vec<_> = batch.slices(0).collect();
        let targets: Vec<_> = batch.slices(1).collect();
        assert_eq!(inputs, [idx(&v, "a c a"), idx(&v, "b d"), idx(&v, "c")]);
        assert_eq!(targets, [idx(&v, "b d b"), idx(&v, "c e"), idx(&v, "d")]);

        let reversed: Vec<_> = batch.slices(1).rev().collect();
        assert_eq!(reversed.first(), targets.last());
        assert_eq!(batch.slices(0).len(), 3);
    }

    #[test]
    fn shuffle_is_reproducible_and_keeps_batches_sorted() {
        let v = vocab();
        let cfg = config(WordWrapping::Verbatim, 2, 10);
        let lines = ["a", "a b c", "b", "c d", "e a b", "d"];
        let mut first = Data::from_lines(lines, &v, &cfg).unwrap();
        let mut second = first.clone();
        first.shuffle(&mut Random::new(5));
        second.shuffle(&mut Random::new(5));
        assert_eq!(first, second);
        for batch in first.batches() {
            assert!(batch.len() <= 2);
            let lens: Vec<_> = batch.sequences().iter().map(Vec::len).collect();
            assert!(lens.windows(2).all(|w| w[0] >= w[1]));
        }
    }
}
