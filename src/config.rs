//! Run configuration.
//!
//! Options come from two layers: an optional JSON file and the command line. Each layer is an
//! [`Options`] with every field optional; command line values win over the file and defaults
//! fill the rest when the merged options are resolved into [`Settings`].

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::data::{BatchConfig, WordWrapping};
use crate::trainer::TrainerConfig;
use crate::{Error, Real, Result};

pub const DEFAULT_LEARNING_RATE: Real = 0.1;
pub const DEFAULT_UNK: &str = "<unk>";
pub const DEFAULT_SB: &str = "<sb>";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Options {
    pub verbose: Option<bool>,
    pub vocab: Option<PathBuf>,
    pub remap: Option<PathBuf>,
    /// Closed vocabulary: unknown words map to `map_unk`.
    pub unk: Option<bool>,
    pub map_unk: Option<String>,
    pub map_sb: Option<String>,
    pub debug_no_sb: Option<bool>,
    pub train: Option<PathBuf>,
    pub dev: Option<PathBuf>,
    pub ppl: Option<PathBuf>,
    pub random_seed: Option<u64>,
    pub learning_rate: Option<Real>,
    pub momentum: Option<Real>,
    pub batch_size: Option<usize>,
    pub sequence_length: Option<usize>,
    pub max_epoch: Option<usize>,
    pub no_shuffling: Option<bool>,
    pub word_wrapping: Option<WordWrapping>,
    pub feedforward: Option<bool>,
    pub no_bias: Option<bool>,
    pub num_oovs: Option<usize>,
    pub num_classes: Option<usize>,
    pub self_test: Option<bool>,
}

impl Options {
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse config json: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_json_str(&s)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))
    }

    /// Fill every field `self` leaves unset from `fallback`.
    pub fn merge(self, fallback: Options) -> Options {
        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                Options { $($field: self.$field.or(fallback.$field)),* }
            };
        }
        merge!(
            verbose,
            vocab,
            remap,
            unk,
            map_unk,
            map_sb,
            debug_no_sb,
            train,
            dev,
            ppl,
            random_seed,
            learning_rate,
            momentum,
            batch_size,
            sequence_length,
            max_epoch,
            no_shuffling,
            word_wrapping,
            feedforward,
            no_bias,
            num_oovs,
            num_classes,
            self_test,
        )
    }

    /// Apply defaults and validate.
    pub fn resolve(self, network: impl Into<PathBuf>) -> Result<Settings> {
        let flag = |value: Option<bool>| value.unwrap_or(false);
        let settings = Settings {
            network: network.into(),
            verbose: flag(self.verbose),
            vocab: self.vocab,
            remap: self.remap,
            unk: flag(self.unk).then(|| self.map_unk.unwrap_or_else(|| DEFAULT_UNK.to_owned())),
            sb: self.map_sb.unwrap_or_else(|| DEFAULT_SB.to_owned()),
            sentence_boundaries: !flag(self.debug_no_sb),
            train: self.train,
            dev: self.dev,
            ppl: self.ppl,
            seed: self.random_seed.unwrap_or(1),
            learning_rate: self.learning_rate,
            momentum: self.momentum.unwrap_or(0.0),
            batch_size: self.batch_size.unwrap_or(1),
            sequence_length: self.sequence_length.unwrap_or(100),
            max_epoch: self.max_epoch.unwrap_or(0),
            shuffle: !flag(self.no_shuffling),
            word_wrapping: self.word_wrapping.unwrap_or_default(),
            feedforward: flag(self.feedforward),
            use_bias: !flag(self.no_bias),
            num_oovs: self.num_oovs.unwrap_or(0),
            num_classes: self.num_classes,
            self_test: flag(self.self_test),
        };
        settings.validate()?;
        Ok(settings)
    }
}

/// Fully resolved run configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub network: PathBuf,
    pub verbose: bool,
    pub vocab: Option<PathBuf>,
    pub remap: Option<PathBuf>,
    pub unk: Option<String>,
    pub sb: String,
    pub sentence_boundaries: bool,
    pub train: Option<PathBuf>,
    pub dev: Option<PathBuf>,
    pub ppl: Option<PathBuf>,
    pub seed: u64,
    /// Explicitly requested rate; `None` lets a new network search for one.
    pub learning_rate: Option<Real>,
    pub momentum: Real,
    pub batch_size: usize,
    pub sequence_length: usize,
    pub max_epoch: usize,
    pub shuffle: bool,
    pub word_wrapping: WordWrapping,
    pub feedforward: bool,
    pub use_bias: bool,
    pub num_oovs: usize,
    pub num_classes: Option<usize>,
    pub self_test: bool,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be > 0".to_owned()));
        }
        if self.sequence_length < 2 {
            return Err(Error::InvalidConfig(
                "sequence length must be >= 2".to_owned(),
            ));
        }
        if let Some(lr) = self.learning_rate {
            if !(lr.is_finite() && lr > 0.0) {
                return Err(Error::InvalidConfig(
                    "learning rate must be finite and > 0".to_owned(),
                ));
            }
        }
        if !(self.momentum.is_finite() && (0.0..1.0).contains(&self.momentum)) {
            return Err(Error::InvalidConfig(
                "momentum must be finite and in [0, 1)".to_owned(),
            ));
        }
        if self.num_classes == Some(0) {
            return Err(Error::InvalidConfig("number of classes must be > 0".to_owned()));
        }
        if self.train.is_none() && self.ppl.is_none() {
            return Err(Error::InvalidConfig(
                "nothing to do: pass a training (--train) or perplexity (--ppl) file".to_owned(),
            ));
        }
        if self.train.is_some() && self.dev.is_none() && !self.self_test {
            return Err(Error::InvalidConfig(
                "training requires development data (--dev)".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> Real {
        self.learning_rate.unwrap_or(DEFAULT_LEARNING_RATE)
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.batch_size,
            max_sequence_length: self.sequence_length,
            word_wrapping: self.word_wrapping,
            sentence_boundaries: self.sentence_boundaries,
        }
    }

    pub fn trainer_config(&self) -> TrainerConfig {
        TrainerConfig {
            max_epoch: self.max_epoch,
            shuffle: self.shuffle,
            verbose: self.verbose,
            seed: self.seed,
            checkpoint: self.network.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn training() -> Options {
        Options {
            train: Some("train.txt".into()),
            dev: Some("dev.txt".into()),
            ..Options::default()
        }
    }

    #[test]
    fn defaults_fill_unset_options() {
        let settings = training().resolve("lm-m8").unwrap();
        assert_eq!(settings.batch_size, 1);
        assert_eq!(settings.sequence_length, 100);
        assert_eq!(settings.max_epoch, 0);
        assert_eq!(settings.momentum, 0.0);
        assert_eq!(settings.learning_rate, None);
        assert_eq!(settings.learning_rate(), DEFAULT_LEARNING_RATE);
        assert_eq!(settings.word_wrapping, WordWrapping::Fixed);
        assert_eq!(settings.seed, 1);
        assert_eq!(settings.unk, None);
        assert_eq!(settings.sb, "<sb>");
        assert!(settings.shuffle && settings.use_bias && settings.sentence_boundaries);
    }

    #[test]
    fn command_line_wins_over_file() {
        let file = Options::from_json_str(
            r#"{"batch-size": 8, "momentum": 0.5, "word-wrapping": "verbatim", "unk": true}"#,
        )
        .unwrap();
        let command_line = Options {
            batch_size: Some(4),
            map_unk: Some("<UNK>".to_owned()),
            ..training()
        };
        let settings = command_line.merge(file).resolve("lm-m8").unwrap();
        assert_eq!(settings.batch_size, 4);
        assert_eq!(settings.momentum, 0.5);
        assert_eq!(settings.word_wrapping, WordWrapping::Verbatim);
        assert_eq!(settings.unk.as_deref(), Some("<UNK>"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            Options::from_json_str(r#"{"batchsize": 8}"#),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let cases = [
            Options { batch_size: Some(0), ..training() },
            Options { sequence_length: Some(1), ..training() },
            Options { learning_rate: Some(0.0), ..training() },
            Options { learning_rate: Some(Real::NAN), ..training() },
            Options { momentum: Some(1.0), ..training() },
            Options { dev: None, ..training() },
            Options::default(),
        ];
        for options in cases {
            assert!(
                matches!(options.clone().resolve("lm-m8"), Err(Error::InvalidConfig(_))),
                "{options:?}"
            );
        }
        let self_test = Options {
            dev: None,
            self_test: Some(true),
            ..training()
        };
        assert!(self_test.resolve("lm-m8").is_ok());
    }
}
