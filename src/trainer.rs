//! Epoch-level training: truncated BPTT per batch, development perplexity, checkpointing with
//! learning rate halving, and the initial learning rate search.

use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::data::{Batch, Data};
use crate::metrics::{LogProbability, is_finite_number};
use crate::net::Net;
use crate::random::{Random, hash_combine};
use crate::{Error, Real, Result};

/// Batches trained per learning rate probe.
pub const MAX_NUM_BATCHES: usize = 30;
/// Batches of a probe whose running perplexity must decrease for the rate to be accepted.
pub const MIN_NUM_DECREASES: usize = 25;
/// First rate probed by the upward search (which multiplies before probing).
pub const AUTO_INITIAL_LEARNING_RATE: Real = 0.05;
/// A running perplexity growing by more than this factor between two batches rejects the rate.
pub const MAX_RELATIVE_INCREASE: Real = 2.0;

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Stop after this epoch; 0 trains until interrupted.
    pub max_epoch: usize,
    /// Reshuffle the training sequences before every epoch.
    pub shuffle: bool,
    /// Log every batch and every predicted word.
    pub verbose: bool,
    pub seed: u64,
    /// Checkpoint written after every epoch.
    pub checkpoint: PathBuf,
}

impl TrainerConfig {
    pub fn new(checkpoint: impl Into<PathBuf>) -> Self {
        Self {
            max_epoch: 0,
            shuffle: true,
            verbose: false,
            seed: 1,
            checkpoint: checkpoint.into(),
        }
    }
}

#[derive(Debug)]
pub struct Trainer {
    net: Net,
    training_data: Data,
    dev_data: Option<Data>,
    config: TrainerConfig,
    random: Random,
}

impl Trainer {
    /// `random` must be the stream the net's weights were drawn from, so that probes and
    /// shuffles stay reproducible for a given seed.
    pub fn new(
        net: Net,
        training_data: Data,
        dev_data: Option<Data>,
        config: TrainerConfig,
        random: Random,
    ) -> Result<Self> {
        for data in std::iter::once(&training_data).chain(&dev_data) {
            if data.max_batch_size() > net.max_batch_size() {
                return Err(Error::InvalidConfig(format!(
                    "data batch size {} exceeds the network's {}",
                    data.max_batch_size(),
                    net.max_batch_size()
                )));
            }
        }
        if training_data.num_running_words() == 0 {
            return Err(Error::InvalidData("training data is empty".to_owned()));
        }
        Ok(Self {
            net,
            training_data,
            dev_data,
            config,
            random,
        })
    }

    pub fn net(&self) -> &Net {
        &self.net
    }

    pub fn net_mut(&mut self) -> &mut Net {
        &mut self.net
    }

    pub fn into_net(self) -> Net {
        self.net
    }

    pub fn training_data(&self) -> &Data {
        &self.training_data
    }

    pub fn training_data_mut(&mut self) -> &mut Data {
        &mut self.training_data
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Train until `max_epoch`. After each epoch the development perplexity decides: an
    /// improvement is checkpointed, otherwise the last checkpoint is restored, the learning rate
    /// halved and the checkpoint rewritten with the new epoch count.
    pub fn train(&mut self) -> Result<()> {
        if self.dev_data.is_none() {
            return Err(Error::InvalidConfig(
                "training requires development data".to_owned(),
            ));
        }
        info!("training");
        while self.config.max_epoch == 0 || self.net.epoch() < self.config.max_epoch {
            self.shuffle();
            let start = Instant::now();
            let training = self.train_epoch();
            self.net.set_epoch(self.net.epoch() + 1);
            info!(
                epoch = self.net.epoch(),
                minutes = start.elapsed().as_secs_f64() / 60.0,
                "training perplexity = {:.2}",
                training.perplexity()
            );

            let perplexity = self.dev_perplexity()?;
            info!(
                "development perplexity = {perplexity:20.15}, learning rate = {:e}{}",
                self.net.learning_rate(),
                if self.net.momentum() > 0.0 {
                    format!(", momentum = {}", self.net.momentum())
                } else {
                    String::new()
                }
            );

            let checkpoint = self.config.checkpoint.clone();
            if self.net.best_perplexity() > perplexity {
                self.net.set_best_perplexity(perplexity);
                self.net.write(&checkpoint)?;
            } else {
                let epoch = self.net.epoch();
                let learning_rate = 0.5 * self.net.learning_rate();
                warn!(
                    best = self.net.best_perplexity(),
                    "no improvement, restoring the last checkpoint with learning rate {learning_rate:e}"
                );
                self.net.read(&checkpoint)?;
                self.net.set_learning_rate(learning_rate);
                self.net.set_epoch(epoch);
                self.net.write(&checkpoint)?;
            }
        }
        Ok(())
    }

    /// One pass over the training data at the net's current learning rate.
    pub fn train_epoch(&mut self) -> LogProbability {
        let Self {
            net,
            training_data,
            config,
            ..
        } = self;
        let mut metric = LogProbability::new();
        for batch in training_data.batches() {
            net.reset(false);
            net.reset_histories();
            train_batch(net, batch, &mut metric);
            if config.verbose {
                debug!(
                    "training perplexity = {:.2} after {} words",
                    metric.perplexity(),
                    metric.num_running_words()
                );
            }
        }
        metric
    }

    /// Perplexity of the development data.
    pub fn dev_perplexity(&mut self) -> Result<Real> {
        let dev_data = self
            .dev_data
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("no development data".to_owned()))?;
        Ok(compute_perplexity(&mut self.net, dev_data, self.config.verbose))
    }

    pub fn compute_perplexity(&mut self, data: &Data) -> Real {
        compute_perplexity(&mut self.net, data, self.config.verbose)
    }

    /// Log probability of the training data under the current weights.
    pub fn training_log_probability(&mut self) -> LogProbability {
        evaluate_log_probability(&mut self.net, &self.training_data, false)
    }

    /// Pick the initial learning rate: probe upward from [`AUTO_INITIAL_LEARNING_RATE`] and keep
    /// the last accepted rate; if even the first is rejected, probe downward until one is
    /// accepted. The weights are re-drawn from the seed afterwards.
    pub fn auto_initialize_learning_rate(&mut self) -> Result<Real> {
        info!("determining initial learning rate");
        if self.training_data.num_batches() < MAX_NUM_BATCHES {
            return Err(Error::InvalidData(format!(
                "learning rate search needs at least {MAX_NUM_BATCHES} training batches, got {}",
                self.training_data.num_batches()
            )));
        }
        self.shuffle();

        info!("increasing");
        let learning_rate = match self.auto_adjust_learning_rate(2.0, AUTO_INITIAL_LEARNING_RATE)
        {
            Some(rate) => rate,
            None => {
                info!("decreasing");
                self.auto_adjust_learning_rate(0.5, 2.0 * AUTO_INITIAL_LEARNING_RATE)
                    .ok_or_else(|| {
                        Error::InvalidData("no stable initial learning rate found".to_owned())
                    })?
            }
        };
        self.net.set_learning_rate(learning_rate);
        info!("initial learning rate: {learning_rate:.2e}");
        self.random.reset(self.config.seed);
        self.net.randomize_weights(&mut self.random);
        Ok(learning_rate)
    }

    /// Repeatedly multiply the rate by `factor` and probe it. Growing (`factor > 1`): return the
    /// last accepted rate once a rate is rejected. Shrinking: return the first accepted rate.
    /// Every probe starts from the seeded initial weights.
    fn auto_adjust_learning_rate(
        &mut self,
        factor: Real,
        mut learning_rate: Real,
    ) -> Option<Real> {
        let mut candidate = None;
        loop {
            learning_rate *= factor;
            if !is_finite_number(learning_rate) {
                return candidate;
            }
            self.net.set_learning_rate(learning_rate);
            info!("probing learning rate {learning_rate:.2e}");
            let accepted = self.accepts_learning_rate();

            self.net.reset_momentum();
            self.random.reset(self.config.seed);
            self.net.randomize_weights(&mut self.random);

            if accepted {
                candidate = Some(learning_rate);
                if factor < 1.0 {
                    return candidate;
                }
            } else {
                if factor > 1.0 {
                    return candidate;
                }
                warn!("rejected learning rate {learning_rate:.2e}");
            }
        }
    }

    /// Train up to [`MAX_NUM_BATCHES`] batches; accept when the running perplexity decreased on
    /// at least [`MIN_NUM_DECREASES`] of them without diverging.
    fn accepts_learning_rate(&mut self) -> bool {
        let Self {
            net,
            training_data,
            ..
        } = self;
        let mut metric = LogProbability::new();
        let mut perplexity = Real::MAX;
        let mut num_decreases: isize = 0;
        for (i, batch) in training_data.batches().enumerate() {
            net.reset(false);
            net.reset_histories();
            train_batch(net, batch, &mut metric);
            let new_perplexity = metric.perplexity();
            if new_perplexity < perplexity {
                num_decreases += 1;
            }
            if new_perplexity / perplexity > MAX_RELATIVE_INCREASE {
                num_decreases = -(MAX_NUM_BATCHES as isize);
            }
            perplexity = new_perplexity;
            debug!("  {perplexity:10.2}");

            let num_batches = i + 1;
            if !is_finite_number(perplexity) {
                return false;
            }
            // Not enough batches left to reach the required decreases.
            if ((MAX_NUM_BATCHES - num_batches) as isize)
                < MIN_NUM_DECREASES as isize - num_decreases
            {
                return false;
            }
            if num_batches == MAX_NUM_BATCHES {
                return true;
            }
        }
        false
    }

    /// Reshuffle the training data with a seed mixed with the current epoch.
    fn shuffle(&mut self) {
        if self.config.shuffle {
            debug!("shuffling");
            let seed = hash_combine(self.config.seed, self.net.epoch() as u64);
            self.random.reset(seed);
            self.training_data.shuffle(&mut self.random);
        }
    }
}

/// Forward, backward and update pass over one batch, then one momentum step.
pub fn train_batch(net: &mut Net, batch: Batch<'_>, metric: &mut LogProbability) {
    if net.is_feedforward() {
        return train_batch_feedforward(net, batch, metric);
    }
    for (input, target) in batch.slices(0).zip(batch.slices(1)) {
        net.evaluate(&target, &input);
        metric.add(
            net.compute_log_probability(&target, net.output(), false, None),
            target.len(),
        );
    }
    for target in batch.slices(1).rev() {
        net.compute_delta(&target);
    }
    net.reset_histories();
    for (input, target) in batch.slices(0).zip(batch.slices(1)) {
        net.update_weights(&target, &input);
    }
    net.update_momentum_weights();
}

/// Every timestep is trained on its own, with a reset in between.
fn train_batch_feedforward(net: &mut Net, batch: Batch<'_>, metric: &mut LogProbability) {
    for (input, target) in batch.slices(0).zip(batch.slices(1)) {
        net.reset(false);
        net.evaluate(&target, &input);
        metric.add(
            net.compute_log_probability(&target, net.output(), false, None),
            target.len(),
        );
        net.compute_delta(&target);
        net.update_weights(&target, &input);
        net.update_momentum_weights();
    }
}

/// `exp(-log P / N)` of `data` under `net`, without touching the weights.
pub fn compute_perplexity(net: &mut Net, data: &Data, verbose: bool) -> Real {
    evaluate_log_probability(net, data, verbose).perplexity()
}

pub fn evaluate_log_probability(net: &mut Net, data: &Data, verbose: bool) -> LogProbability {
    let mut metric = LogProbability::new();
    for batch in data.batches() {
        net.reset(false);
        net.reset_histories();
        for (input, target) in batch.slices(0).zip(batch.slices(1)) {
            if net.is_feedforward() {
                net.reset(false);
            }
            net.evaluate(&target, &input);
            metric.add(
                net.compute_log_probability(&target, net.output(), verbose, None),
                target.len(),
            );
        }
    }
    metric
}
