use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rust_rnnlm::trainer::compute_perplexity;
use rust_rnnlm::{
    Data, GradientCheck, NetBuilder, Options, Random, Settings, Trainer, Vocabulary, WordWrapping,
};

/// Train and evaluate recurrent / LSTM language models.
#[derive(Debug, Parser)]
#[command(name = "rnnlm", version, about)]
struct Cli {
    /// Network file; its name encodes the topology, e.g. `lm-i100-m200`.
    network: PathBuf,

    /// JSON file with default options (command line values take precedence).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log every batch and every predicted word.
    #[arg(long)]
    verbose: bool,

    /// Vocabulary file; created from the training data if it does not exist.
    #[arg(long)]
    vocab: Option<PathBuf>,

    /// Write the vocabulary, in index order, to this file.
    #[arg(long)]
    remap: Option<PathBuf>,

    /// Closed vocabulary: map unknown words to the unknown token.
    #[arg(long)]
    unk: bool,

    /// Name of the unknown token [default: <unk>].
    #[arg(long)]
    map_unk: Option<String>,

    /// Name of the sentence boundary token [default: <sb>].
    #[arg(long)]
    map_sb: Option<String>,

    /// Do not insert sentence boundary tokens (debugging only).
    #[arg(long)]
    debug_no_sb: bool,

    /// Training data.
    #[arg(long)]
    train: Option<PathBuf>,

    /// Development data.
    #[arg(long)]
    dev: Option<PathBuf>,

    /// Compute the perplexity of this file and exit.
    #[arg(long)]
    ppl: Option<PathBuf>,

    /// [default: 1]
    #[arg(long)]
    random_seed: Option<u64>,

    /// Initial learning rate; searched automatically for new networks when omitted.
    #[arg(long)]
    learning_rate: Option<f64>,

    /// [default: 0]
    #[arg(long)]
    momentum: Option<f64>,

    /// Maximum number of sequences evaluated in parallel [default: 1].
    #[arg(long)]
    batch_size: Option<usize>,

    /// Maximum length of a sequence [default: 100].
    #[arg(long)]
    sequence_length: Option<usize>,

    /// Maximum number of epochs, 0 means unlimited [default: 0].
    #[arg(long)]
    max_epoch: Option<usize>,

    /// Do not shuffle the training data.
    #[arg(long)]
    no_shuffling: bool,

    /// concatenated, fixed or verbatim [default: fixed].
    #[arg(long)]
    word_wrapping: Option<WordWrapping>,

    /// Train in feed-forward style, without recurrence across timesteps.
    #[arg(long)]
    feedforward: bool,

    /// Do not use any bias.
    #[arg(long)]
    no_bias: bool,

    /// Difference between the recognition and the network vocabulary size [default: 0].
    #[arg(long)]
    num_oovs: Option<usize>,

    /// Number of classes of a vocabulary created from the training data [default: ⌈√V⌉].
    #[arg(long)]
    num_classes: Option<usize>,

    /// Compare the gradient with the difference quotient instead of training.
    #[arg(long)]
    self_test: bool,
}

impl Cli {
    fn options(&self) -> Options {
        let flag = |set: bool| set.then_some(true);
        Options {
            verbose: flag(self.verbose),
            vocab: self.vocab.clone(),
            remap: self.remap.clone(),
            unk: flag(self.unk),
            map_unk: self.map_unk.clone(),
            map_sb: self.map_sb.clone(),
            debug_no_sb: flag(self.debug_no_sb),
            train: self.train.clone(),
            dev: self.dev.clone(),
            ppl: self.ppl.clone(),
            random_seed: self.random_seed,
            learning_rate: self.learning_rate,
            momentum: self.momentum,
            batch_size: self.batch_size,
            sequence_length: self.sequence_length,
            max_epoch: self.max_epoch,
            no_shuffling: flag(self.no_shuffling),
            word_wrapping: self.word_wrapping,
            feedforward: flag(self.feedforward),
            no_bias: flag(self.no_bias),
            num_oovs: self.num_oovs,
            num_classes: self.num_classes,
            self_test: flag(self.self_test),
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .init();
}

fn load_vocabulary(settings: &Settings) -> anyhow::Result<Vocabulary> {
    let unk = settings.unk.as_deref();
    let vocabulary = match &settings.vocab {
        Some(path) if path.exists() => {
            info!(path = %path.display(), "reading vocabulary");
            Vocabulary::from_file(path, &settings.sb, unk)
                .with_context(|| format!("failed to read vocabulary {}", path.display()))?
        }
        vocab => {
            let Some(train) = &settings.train else {
                bail!("no vocabulary file and no training data to create one from");
            };
            info!(path = %train.display(), "creating vocabulary from training data");
            let vocabulary = Vocabulary::from_corpus(train, settings.num_classes, &settings.sb, unk)
                .with_context(|| format!("failed to read training data {}", train.display()))?;
            if let Some(path) = vocab {
                info!(path = %path.display(), "saving vocabulary");
                vocabulary.save(path)?;
            }
            vocabulary
        }
    };
    if let Some(path) = &settings.remap {
        info!(path = %path.display(), "writing remapped vocabulary");
        vocabulary.save(path)?;
    }
    info!(
        words = vocabulary.len(),
        classes = vocabulary.num_classes(),
        shortlist = vocabulary.shortlist_size(),
        "vocabulary ready"
    );
    Ok(vocabulary)
}

fn read_data(
    kind: &str,
    path: &Path,
    vocabulary: &Vocabulary,
    settings: &Settings,
) -> anyhow::Result<Data> {
    info!(path = %path.display(), "reading {kind} data");
    Data::from_file(path, vocabulary, &settings.batch_config())
        .with_context(|| format!("failed to read {kind} data {}", path.display()))
}

fn run(settings: &Settings) -> anyhow::Result<()> {
    let vocabulary = Arc::new(load_vocabulary(settings)?);
    let mut random = Random::new(settings.seed);

    let builder = NetBuilder::new(Arc::clone(&vocabulary))
        .max_batch_size(settings.batch_size)
        .max_sequence_length(settings.sequence_length)
        .num_oovs(settings.num_oovs)
        .use_bias(settings.use_bias)
        .feedforward(settings.feedforward)
        .learning_rate(settings.learning_rate())
        .momentum(settings.momentum);
    let network = &settings.network;
    let is_new = !network.exists();
    let mut net = if is_new {
        builder.build_and_randomize(network, &mut random)
    } else {
        builder.build_and_load(network)
    }
    .with_context(|| format!("failed to set up network {}", network.display()))?;
    info!(weights = net.num_weights(), "network ready");

    if let Some(path) = &settings.ppl {
        if is_new {
            bail!(
                "perplexity evaluation needs a trained network, {} does not exist",
                network.display()
            );
        }
        let data = read_data("perplexity", path, &vocabulary, settings)?;
        let perplexity = compute_perplexity(&mut net, &data, settings.verbose);
        println!("perplexity:\n{perplexity:.20}");
        return Ok(());
    }

    let Some(train) = &settings.train else {
        return Ok(());
    };
    let training_data = read_data("training", train, &vocabulary, settings)?;
    let dev_data = settings
        .dev
        .as_ref()
        .map(|path| read_data("development", path, &vocabulary, settings))
        .transpose()?;
    let mut trainer = Trainer::new(
        net,
        training_data,
        dev_data,
        settings.trainer_config(),
        random,
    )?;

    if settings.self_test {
        let report = GradientCheck::default().run(&mut trainer)?;
        for m in &report.mismatches {
            error!(
                layer = m.layer,
                kind = m.kind,
                "{}[{}]: dF/dw = {:.7}, ΔF/Δw = {:.7} (threshold {:e})",
                m.param,
                m.index,
                m.analytic,
                m.numeric,
                m.threshold
            );
        }
        if !report.is_ok() {
            bail!(
                "gradient test failed for {} of {} weights",
                report.mismatches.len(),
                report.num_checked
            );
        }
        return Ok(());
    }

    if is_new && settings.learning_rate.is_none() {
        trainer.auto_initialize_learning_rate()?;
    }
    trainer.train()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let file_options = match &cli.config {
        Some(path) => Options::from_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => Options::default(),
    };
    let settings = cli
        .options()
        .merge(file_options)
        .resolve(cli.network.clone())
        .context("invalid options")?;
    init_logging(settings.verbose);
    run(&settings)
}
