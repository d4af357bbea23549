//! Training loop for the sentence autoencoder.
//!
//! One [`candle_nn::AdamW`] with zero weight decay updates the embedding,
//! encoder and decoder together. After every epoch the trainer runs, in
//! order, an evaluation pass, a learning-rate decay and a snapshot, each
//! gated by its own interval (0 disables it).

pub mod loss;
pub mod schedule;

use std::path::PathBuf;

use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::data::{PAD_ID, SentenceSet, VOCAB_FILE, Vocabulary};
use crate::metrics::RougeAccumulator;
use crate::model::Autoencoder;
use crate::{Error, Result};
use loss::{ReconstructionLoss, reconstruction_loss};
use schedule::{LrSchedule, StepDecay};

/// Loop options. Defaults follow the reference training recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub lr: f64,
    pub epochs: usize,
    pub batch_size: usize,
    pub lr_decay_interval: usize,
    pub lr_decay_factor: f64,
    pub log_interval: usize,
    pub test_interval: usize,
    pub save_interval: usize,
    pub save_dir: PathBuf,
    pub shuffle: bool,
    pub seed: u64,
    /// Leave `<pad>` positions out of the loss.
    pub ignore_padding: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            lr: 0.005,
            epochs: 10,
            batch_size: 64,
            lr_decay_interval: 4,
            lr_decay_factor: 0.2,
            log_interval: 256,
            test_interval: 2,
            save_interval: 2,
            save_dir: PathBuf::from("rec_snapshot"),
            shuffle: false,
            seed: 42,
            ignore_padding: false,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(Error::Config(format!("lr must be positive, got {}", self.lr)));
        }
        if self.epochs == 0 {
            return Err(Error::Config("epochs must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if !(self.lr_decay_factor > 0.0 && self.lr_decay_factor <= 1.0) {
            return Err(Error::Config(format!(
                "lr_decay_factor must be in (0, 1], got {}",
                self.lr_decay_factor
            )));
        }
        Ok(())
    }

    pub fn schedule(&self) -> StepDecay {
        StepDecay {
            interval: self.lr_decay_interval,
            factor: self.lr_decay_factor,
        }
    }
}

/// Result of one pass over a test stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalReport {
    /// Mean NLL per counted token.
    pub loss: f64,
    pub perplexity: f64,
    pub rouge1: f64,
    pub rouge2: f64,
    pub sentences: usize,
}

/// Summary of one training epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    /// Mean per-token training loss over the epoch.
    pub loss: f64,
    pub steps: usize,
    pub lr: f64,
    pub eval: Option<EvalReport>,
}

pub struct Trainer {
    model: Autoencoder,
    optimizer: AdamW,
    cfg: TrainConfig,
    schedule: StepDecay,
    rng: ChaCha8Rng,
    step: usize,
    vocab: Option<Vocabulary>,
}

impl Trainer {
    pub fn new(model: Autoencoder, cfg: TrainConfig) -> Result<Self> {
        cfg.validate()?;
        let optimizer = AdamW::new(
            model.vars(),
            ParamsAdamW {
                lr: cfg.lr,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;
        Ok(Self {
            schedule: cfg.schedule(),
            rng: ChaCha8Rng::seed_from_u64(cfg.seed),
            model,
            optimizer,
            cfg,
            step: 0,
            vocab: None,
        })
    }

    /// Attach a vocabulary: sample reconstructions get logged as text and
    /// the vocabulary is written to `save_dir` before the first epoch.
    pub fn with_vocab(mut self, vocab: Vocabulary) -> Self {
        self.vocab = Some(vocab);
        self
    }

    pub fn model(&self) -> &Autoencoder {
        &self.model
    }

    pub fn into_model(self) -> Autoencoder {
        self.model
    }

    pub fn config(&self) -> &TrainConfig {
        &self.cfg
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Optimizer steps taken so far.
    pub fn steps(&self) -> usize {
        self.step
    }

    fn pad_id(&self) -> Option<u32> {
        self.cfg.ignore_padding.then_some(PAD_ID)
    }

    /// Forward, loss and one optimizer step on a `[B, t1]` batch.
    pub fn train_step(&mut self, batch: &Tensor) -> Result<ReconstructionLoss> {
        let log_probs = self.model.forward(batch)?;
        let loss = reconstruction_loss(&log_probs, batch, self.pad_id())?;
        self.optimizer.backward_step(&loss.total)?;
        self.step += 1;
        Ok(loss)
    }

    /// One pass over `data`, logging the running loss every `log_interval`
    /// steps.
    pub fn train_epoch(&mut self, epoch: usize, data: &SentenceSet) -> Result<EpochReport> {
        let device = self.model.device().clone();
        let rng = self.cfg.shuffle.then_some(&mut self.rng);
        let batches = data.batches(self.cfg.batch_size, rng, &device);

        let (mut epoch_sum, mut epoch_tokens, mut steps) = (0.0, 0usize, 0usize);
        let (mut window_sum, mut window_tokens) = (0.0, 0usize);
        for batch in batches {
            let batch = batch?;
            let loss = self.train_step(&batch)?;
            let summed = loss.summed()?;
            epoch_sum += summed;
            epoch_tokens += loss.tokens;
            window_sum += summed;
            window_tokens += loss.tokens;
            steps += 1;
            tracing::debug!(step = self.step, loss = loss.per_token()?, "train step");

            if self.cfg.log_interval > 0 && self.step % self.cfg.log_interval == 0 {
                tracing::info!(
                    epoch,
                    step = self.step,
                    loss = window_sum / window_tokens.max(1) as f64,
                    "training"
                );
                (window_sum, window_tokens) = (0.0, 0);
                self.log_sample(&batch)?;
            }
        }

        Ok(EpochReport {
            epoch,
            loss: epoch_sum / epoch_tokens.max(1) as f64,
            steps,
            lr: self.learning_rate(),
            eval: None,
        })
    }

    fn log_sample(&self, batch: &Tensor) -> Result<()> {
        let Some(vocab) = &self.vocab else {
            return Ok(());
        };
        let input = batch.narrow(0, 0, 1)?;
        let output = self.model.reconstruct(&input)?;
        let input = input.squeeze(0)?.to_vec1::<u32>()?;
        let output = output.squeeze(0)?.to_vec1::<u32>()?;
        tracing::info!(
            input = %vocab.decode(&input),
            reconstruction = %vocab.decode(&output),
            "sample"
        );
        Ok(())
    }

    /// Loss, perplexity and ROUGE over `data` without updating weights.
    /// Returns `None` for an empty stream.
    pub fn evaluate(&self, data: &SentenceSet) -> Result<Option<EvalReport>> {
        if data.is_empty() {
            tracing::warn!("evaluation skipped: test stream is empty");
            return Ok(None);
        }
        let (mut sum, mut tokens) = (0.0, 0usize);
        let mut rouge = RougeAccumulator::default();
        for batch in data.batches(self.cfg.batch_size, None, self.model.device()) {
            let batch = batch?;
            let log_probs = self.model.forward(&batch)?.detach();
            let loss = reconstruction_loss(&log_probs, &batch, self.pad_id())?;
            sum += loss.summed()?;
            tokens += loss.tokens;

            let predicted = log_probs.argmax(candle_core::D::Minus1)?.to_vec2::<u32>()?;
            for (reference, candidate) in batch.to_vec2::<u32>()?.iter().zip(&predicted) {
                rouge.add(reference, candidate);
            }
        }
        let loss = sum / tokens.max(1) as f64;
        let (rouge1, rouge2) = rouge.mean();
        Ok(Some(EvalReport {
            loss,
            perplexity: loss.exp(),
            rouge1,
            rouge2,
            sentences: rouge.count(),
        }))
    }

    /// Train for `epochs` epochs, then write the final snapshots.
    pub fn run(&mut self, train: &SentenceSet, test: &SentenceSet) -> Result<Vec<EpochReport>> {
        if train.is_empty() {
            return Err(Error::Data("training stream is empty".into()));
        }
        tracing::info!(
            epochs = self.cfg.epochs,
            batch_size = self.cfg.batch_size,
            lr = self.cfg.lr,
            schedule = self.schedule.name(),
            train = train.len(),
            test = test.len(),
            "starting training"
        );

        if let Some(vocab) = &self.vocab {
            std::fs::create_dir_all(&self.cfg.save_dir)?;
            let path = self.cfg.save_dir.join(VOCAB_FILE);
            vocab.save_json(&path)?;
            tracing::info!(path = %path.display(), "saved vocabulary");
        }

        let mut reports = Vec::with_capacity(self.cfg.epochs);
        for epoch in 1..=self.cfg.epochs {
            let mut report = self.train_epoch(epoch, train)?;
            tracing::info!(epoch, loss = report.loss, steps = report.steps, "epoch done");

            if is_due(epoch, self.cfg.test_interval)
                && let Some(eval) = self.evaluate(test)?
            {
                tracing::info!(
                    epoch,
                    loss = eval.loss,
                    perplexity = eval.perplexity,
                    rouge1 = eval.rouge1,
                    rouge2 = eval.rouge2,
                    "evaluation"
                );
                report.eval = Some(eval);
            }

            if self.schedule.decays_after(epoch) {
                let lr = self.schedule.lr(self.cfg.lr, epoch);
                self.optimizer.set_learning_rate(lr);
                tracing::info!(epoch, lr, "learning rate decayed");
            }
            report.lr = self.learning_rate();

            if is_due(epoch, self.cfg.save_interval) {
                self.save(&format!("epoch{epoch}"))?;
            }
            reports.push(report);
        }

        self.save("final")?;
        Ok(reports)
    }

    fn save(&self, tag: &str) -> Result<()> {
        let (encoder, decoder) = self.model.save_snapshots(&self.cfg.save_dir, tag)?;
        tracing::info!(
            encoder = %encoder.display(),
            decoder = %decoder.display(),
            "saved snapshots"
        );
        Ok(())
    }
}

fn is_due(epoch: usize, interval: usize) -> bool {
    interval > 0 && epoch % interval == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::data::Corpus;
    use candle_core::Device;

    fn model_config() -> ModelConfig {
        ModelConfig {
            sentence_len: 10,
            embed_dim: 16,
            filter_size: 16,
            filter_shape: 2,
            latent_size: 32,
            tau: 0.1,
            max_norm: 1.0,
        }
    }

    /// 20 sentences over 48 words, so the vocabulary has 50 entries.
    fn corpus() -> Corpus {
        let sentences: Vec<String> = (0..20)
            .map(|j| {
                (0..6)
                    .map(|t| format!("w{}", (j * 3 + t) % 48))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();
        Corpus::from_sentences(&sentences, 10, 2, 0.0, 0).unwrap()
    }

    fn train_config(dir: &std::path::Path) -> TrainConfig {
        TrainConfig {
            lr: 0.01,
            epochs: 2,
            batch_size: 8,
            log_interval: 1,
            test_interval: 0,
            save_interval: 0,
            save_dir: dir.to_path_buf(),
            ..TrainConfig::default()
        }
    }

    #[test]
    fn default_config_validates() {
        let cfg = TrainConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.schedule(), StepDecay::default());
    }

    #[test]
    fn invalid_config_rejected() {
        let bad = [
            TrainConfig {
                lr: 0.0,
                ..TrainConfig::default()
            },
            TrainConfig {
                batch_size: 0,
                ..TrainConfig::default()
            },
            TrainConfig {
                epochs: 0,
                ..TrainConfig::default()
            },
            TrainConfig {
                lr_decay_factor: 1.5,
                ..TrainConfig::default()
            },
        ];
        for cfg in bad {
            assert!(matches!(cfg.validate(), Err(Error::Config(_))), "{cfg:?}");
        }
    }

    #[test]
    fn loss_decreases_on_tiny_corpus() {
        let dev = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let corpus = corpus();
        assert_eq!(corpus.vocab_size(), 50);
        let model = Autoencoder::new(&model_config(), corpus.vocab_size(), &dev).unwrap();
        let cfg = TrainConfig {
            epochs: 15,
            shuffle: true,
            ..train_config(dir.path())
        };
        let mut trainer = Trainer::new(model, cfg).unwrap();

        let before = trainer.evaluate(corpus.train()).unwrap().unwrap();
        trainer.run(corpus.train(), corpus.test()).unwrap();
        let after = trainer.evaluate(corpus.train()).unwrap().unwrap();
        assert!(
            after.loss < before.loss,
            "loss did not drop: {} -> {}",
            before.loss,
            after.loss
        );
        assert_eq!(trainer.steps(), 15 * 3);
    }

    #[test]
    fn run_writes_periodic_and_final_snapshots() {
        let dev = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let corpus = corpus();
        let model = Autoencoder::new(&model_config(), corpus.vocab_size(), &dev).unwrap();
        let cfg = TrainConfig {
            save_interval: 1,
            test_interval: 1,
            ..train_config(dir.path())
        };
        let mut trainer = Trainer::new(model, cfg).unwrap().with_vocab(corpus.vocab().clone());
        // empty test split: evaluation is skipped, not an error
        let reports = trainer.run(corpus.train(), corpus.test()).unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.eval.is_none()));

        for name in [
            "encoder_epoch1.safetensors",
            "decoder_epoch1.safetensors",
            "encoder_epoch2.safetensors",
            "decoder_epoch2.safetensors",
            "encoder_final.safetensors",
            "decoder_final.safetensors",
            "vocab.json",
        ] {
            assert!(dir.path().join(name).is_file(), "{name} missing");
        }
        let vocab = Vocabulary::load_json(dir.path().join("vocab.json")).unwrap();
        assert_eq!(vocab.len(), 50);
    }

    #[test]
    fn learning_rate_decays_on_interval() {
        let dev = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let corpus = corpus();
        let model = Autoencoder::new(&model_config(), corpus.vocab_size(), &dev).unwrap();
        let cfg = TrainConfig {
            epochs: 4,
            lr_decay_interval: 2,
            lr_decay_factor: 0.5,
            ..train_config(dir.path())
        };
        let mut trainer = Trainer::new(model, cfg).unwrap();
        let reports = trainer.run(corpus.train(), corpus.test()).unwrap();
        let lrs: Vec<f64> = reports.iter().map(|r| r.lr).collect();
        let expected = [0.01, 0.005, 0.005, 0.0025];
        for (got, want) in lrs.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{lrs:?}");
        }
    }

    #[test]
    fn evaluation_reports_rouge() {
        let dev = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let sentences: Vec<String> = (0..10).map(|i| format!("a b c{i}")).collect();
        let corpus = Corpus::from_sentences(&sentences, 10, 2, 0.3, 1).unwrap();
        assert_eq!(corpus.test().len(), 3);
        let model = Autoencoder::new(&model_config(), corpus.vocab_size(), &dev).unwrap();
        let trainer = Trainer::new(model, train_config(dir.path())).unwrap();
        let report = trainer.evaluate(corpus.test()).unwrap().unwrap();
        assert_eq!(report.sentences, 3);
        assert!((report.perplexity - report.loss.exp()).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&report.rouge1));
        assert!((0.0..=1.0).contains(&report.rouge2));
    }

    #[test]
    fn empty_training_stream_is_data_error() {
        let dir = tempfile::tempdir().unwrap();
        let model = Autoencoder::new(&model_config(), 10, &Device::Cpu).unwrap();
        let mut trainer = Trainer::new(model, train_config(dir.path())).unwrap();
        let empty = SentenceSet::default();
        assert!(matches!(trainer.run(&empty, &empty), Err(Error::Data(_))));
    }
}
