//! Word and class indices.
//!
//! Every word belongs to exactly one class. Singleton classes form the shortlist; their words
//! take indices `0..shortlist_size` and their probability is the class probability alone. The
//! remaining words follow, grouped contiguously by class, so a word's position inside its class
//! is `index - shortlist_size - word_offset(class)`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use crate::file::{ReadableFile, WritableFile};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Vocabulary {
    words: Vec<String>,
    indices: HashMap<String, usize>,
    classes: Vec<usize>,
    class_sizes: Vec<usize>,
    word_offsets: Vec<usize>,
    shortlist_size: usize,
    max_class_size: usize,
    unk: Option<usize>,
    sb: usize,
}

impl Vocabulary {
    /// Build from `(word, class)` pairs. Class ids are arbitrary labels; they are renumbered so
    /// that singleton classes come first. `sb` (and `unk`, when given) are added as singleton
    /// classes if missing.
    pub fn from_word_classes<I, S>(entries: I, sb: &str, unk: Option<&str>) -> Result<Self>
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut by_class: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (word, class) in entries {
            let word = word.into();
            if word.is_empty() || word.contains(char::is_whitespace) {
                return Err(Error::InvalidData(format!("invalid vocabulary word {word:?}")));
            }
            if !seen.insert(word.clone()) {
                return Err(Error::InvalidData(format!(
                    "word {word:?} appears twice in the vocabulary"
                )));
            }
            by_class.entry(class).or_default().push(word);
        }

        for special in std::iter::once(sb).chain(unk) {
            if !seen.contains(special) {
                let class = by_class.keys().next_back().map_or(0, |&c| c + 1);
                by_class.insert(class, vec![special.to_owned()]);
                seen.insert(special.to_owned());
            }
        }

        let (singletons, groups): (Vec<_>, Vec<_>) =
            by_class.into_values().partition(|words| words.len() == 1);
        let shortlist_size = singletons.len();

        let mut words = Vec::with_capacity(seen.len());
        let mut classes = Vec::with_capacity(seen.len());
        let mut class_sizes = Vec::new();
        let mut word_offsets = Vec::new();
        let mut offset = 0;
        for (class, members) in singletons.into_iter().chain(groups).enumerate() {
            class_sizes.push(members.len());
            word_offsets.push(offset);
            if members.len() > 1 {
                offset += members.len();
            }
            for word in members {
                words.push(word);
                classes.push(class);
            }
        }

        let indices: HashMap<String, usize> = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i))
            .collect();
        let max_class_size = class_sizes.iter().copied().max().unwrap_or(0);
        let sb = indices[sb];
        let unk = unk.map(|u| indices[u]);

        Ok(Self {
            words,
            indices,
            classes,
            class_sizes,
            word_offsets,
            shortlist_size,
            max_class_size,
            unk,
            sb,
        })
    }

    /// Assign classes by cumulative unigram frequency: frequent words end up alone in their
    /// class, rare words share classes.
    pub fn from_counts<S: Into<String>>(
        counts: impl IntoIterator<Item = (S, u64)>,
        num_classes: usize,
        sb: &str,
        unk: Option<&str>,
    ) -> Result<Self> {
        if num_classes == 0 {
            return Err(Error::InvalidConfig("num_classes must be > 0".to_owned()));
        }
        let mut counts: Vec<(String, u64)> = counts.into_iter().map(|(w, c)| (w.into(), c)).collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let total = counts.iter().map(|(_, c)| *c).sum::<u64>().max(1) as f64;
        let mut cumulative = 0.0;
        let mut class = 0;
        let mut entries = Vec::with_capacity(counts.len());
        for (word, count) in counts {
            cumulative = (cumulative + count as f64 / total).min(1.0);
            entries.push((word, class));
            if cumulative > (class + 1) as f64 / num_classes as f64 && class + 1 < num_classes {
                class += 1;
            }
        }
        Self::from_word_classes(entries, sb, unk)
    }

    /// Count the words of a training corpus and bin them into `num_classes` classes
    /// (`⌈√V⌉` when `None`). Every line contributes one sentence boundary.
    pub fn from_corpus(
        path: impl AsRef<Path>,
        num_classes: Option<usize>,
        sb: &str,
        unk: Option<&str>,
    ) -> Result<Self> {
        let mut counts: HashMap<String, u64> = HashMap::new();
        let mut num_lines = 0;
        for line in ReadableFile::open(path)?.lines() {
            let line = line?;
            for word in line.split_whitespace() {
                *counts.entry(word.to_owned()).or_default() += 1;
            }
            num_lines += 1;
        }
        *counts.entry(sb.to_owned()).or_default() += num_lines;
        if let Some(unk) = unk {
            counts.entry(unk.to_owned()).or_default();
        }
        let num_classes = num_classes.unwrap_or_else(|| (counts.len() as f64).sqrt().ceil() as usize);
        Self::from_counts(counts, num_classes.max(1), sb, unk)
    }

    /// Read `word [class]` lines. Without a class column, words are binned by rank into
    /// `⌈√V⌉` equally sized classes.
    pub fn from_file(path: impl AsRef<Path>, sb: &str, unk: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        let mut words = Vec::new();
        let mut classes = Vec::new();
        for line in ReadableFile::open(path)?.lines() {
            let line = line?;
            let mut fields = line.split_whitespace();
            let Some(word) = fields.next() else { continue };
            words.push(word.to_owned());
            if let Some(class) = fields.next() {
                let class = class.parse::<usize>().map_err(|_| {
                    Error::InvalidData(format!(
                        "{}: class of {word:?} is not a number: {class:?}",
                        path.display()
                    ))
                })?;
                classes.push(class);
            }
        }

        if classes.is_empty() {
            let per_class = (words.len() as f64).sqrt().ceil().max(1.0) as usize;
            let entries = words.into_iter().enumerate().map(|(rank, w)| (w, rank / per_class));
            return Self::from_word_classes(entries, sb, unk);
        }
        if classes.len() != words.len() {
            return Err(Error::InvalidData(format!(
                "{}: either every word or no word must carry a class",
                path.display()
            )));
        }
        Self::from_word_classes(words.into_iter().zip(classes), sb, unk)
    }

    /// Write `word class` lines in index order.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut out = WritableFile::create(path)?;
        for (word, class) in self.words.iter().zip(&self.classes) {
            out.write_line(&format!("{word} {class}"))?;
        }
        out.finish()
    }

    pub fn index(&self, word: &str) -> Option<usize> {
        self.indices.get(word).copied()
    }

    /// Index of `word`, falling back to the unknown token.
    pub fn index_or_unk(&self, word: &str) -> Option<usize> {
        self.index(word).or(self.unk)
    }

    pub fn word(&self, index: usize) -> &str {
        &self.words[index]
    }

    pub fn class_of(&self, index: usize) -> usize {
        self.classes[index]
    }

    pub fn class_size(&self, class: usize) -> usize {
        self.class_sizes[class]
    }

    /// Offset of the class's first word among the non-shortlist words.
    pub fn word_offset(&self, class: usize) -> usize {
        self.word_offsets[class]
    }

    pub fn shortlist_size(&self) -> usize {
        self.shortlist_size
    }

    pub fn num_classes(&self) -> usize {
        self.class_sizes.len()
    }

    pub fn max_class_size(&self) -> usize {
        self.max_class_size
    }

    pub fn unk(&self) -> Option<usize> {
        self.unk
    }

    pub fn sb(&self) -> usize {
        self.sb
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}
