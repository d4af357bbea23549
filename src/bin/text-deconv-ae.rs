//! Train the convolutional sentence autoencoder on a plain-text corpus.
//!
//! The corpus holds one sentence per line. Snapshots are written to
//! `--save-dir` as `encoder_{tag}.safetensors` / `decoder_{tag}.safetensors`
//! (tags `epoch{N}` and `final`) together with `vocab.json`.
//!
//! Pass both `--enc-snapshot` and `--dec-snapshot` to continue from an
//! earlier run. The model options must match the ones used for that run,
//! and the corpus must rebuild the `vocab.json` stored next to the encoder
//! snapshot.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use text_deconv_ae::{
    config::ModelConfig,
    data::{Corpus, VOCAB_FILE, Vocabulary},
    device::select_device,
    model::Autoencoder,
    train::{TrainConfig, Trainer},
};

#[derive(Parser, Debug)]
#[command(
    name = "text-deconv-ae",
    about = "Convolutional sentence autoencoder",
    long_about = "Train a convolutional encoder and deconvolutional decoder that reconstruct\n\
                  fixed-length sentences through a single latent vector."
)]
struct Args {
    /// Initial learning rate.
    #[arg(long, default_value_t = 0.005)]
    lr: f64,

    #[arg(long, default_value_t = 10)]
    epochs: usize,

    #[arg(long, default_value_t = 64)]
    batch_size: usize,

    /// Epochs between learning-rate decays (0 disables).
    #[arg(long, default_value_t = 4)]
    lr_decay_interval: usize,

    /// Factor applied to the learning rate at each decay.
    #[arg(long, default_value_t = 0.2)]
    lr_decay_factor: f64,

    /// Steps between training-loss log lines (0 disables).
    #[arg(long, default_value_t = 256)]
    log_interval: usize,

    /// Epochs between evaluation passes (0 disables).
    #[arg(long, default_value_t = 2)]
    test_interval: usize,

    /// Epochs between snapshots (0 disables).
    #[arg(long, default_value_t = 2)]
    save_interval: usize,

    #[arg(long, default_value = "rec_snapshot")]
    save_dir: PathBuf,

    /// Text corpus, one sentence per line.
    #[arg(long, default_value = "hotel_reviews.txt")]
    data_path: PathBuf,

    /// Share of sentences held out for evaluation.
    #[arg(long, default_value_t = 0.1)]
    test_fraction: f64,

    /// Shuffle training batches every epoch.
    #[arg(long)]
    shuffle: bool,

    /// Seed for the train/test split and batch shuffling.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Leave padding positions out of the loss.
    #[arg(long)]
    ignore_padding: bool,

    #[arg(long, default_value_t = 253)]
    sentence_len: usize,

    #[arg(long, default_value_t = 300)]
    embed_dim: usize,

    /// Channels of the convolutional stages.
    #[arg(long, default_value_t = 300)]
    filter_size: usize,

    /// Kernel width of the strided stages.
    #[arg(long, default_value_t = 5)]
    filter_shape: usize,

    #[arg(long, default_value_t = 900)]
    latent_size: usize,

    /// Softmax temperature of the decoder.
    #[arg(long, default_value_t = 0.01)]
    tau: f64,

    /// Norm ceiling of embedding rows.
    #[arg(long, default_value_t = 1.0)]
    max_norm: f64,

    #[arg(long)]
    use_cuda: bool,

    #[arg(long, default_value_t = 0)]
    cuda_device: usize,

    /// Encoder snapshot to resume from (requires --dec-snapshot).
    #[arg(long, requires = "dec_snapshot")]
    enc_snapshot: Option<PathBuf>,

    /// Decoder snapshot to resume from (requires --enc-snapshot).
    #[arg(long, requires = "enc_snapshot")]
    dec_snapshot: Option<PathBuf>,
}

impl Args {
    fn model_config(&self) -> ModelConfig {
        ModelConfig {
            sentence_len: self.sentence_len,
            embed_dim: self.embed_dim,
            filter_size: self.filter_size,
            filter_shape: self.filter_shape,
            latent_size: self.latent_size,
            tau: self.tau,
            max_norm: self.max_norm,
        }
    }

    fn train_config(&self) -> TrainConfig {
        TrainConfig {
            lr: self.lr,
            epochs: self.epochs,
            batch_size: self.batch_size,
            lr_decay_interval: self.lr_decay_interval,
            lr_decay_factor: self.lr_decay_factor,
            log_interval: self.log_interval,
            test_interval: self.test_interval,
            save_interval: self.save_interval,
            save_dir: self.save_dir.clone(),
            shuffle: self.shuffle,
            seed: self.seed,
            ignore_padding: self.ignore_padding,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let model_cfg = args.model_config();
    let train_cfg = args.train_config();
    train_cfg.validate()?;

    let device = select_device(args.use_cuda, args.cuda_device)?;
    tracing::info!(?device, "using device");

    let corpus = Corpus::load(
        &args.data_path,
        model_cfg.sentence_len,
        model_cfg.filter_shape,
        args.test_fraction,
        args.seed,
    )
    .with_context(|| format!("loading corpus {}", args.data_path.display()))?;

    let model = match (&args.enc_snapshot, &args.dec_snapshot) {
        (Some(enc), Some(dec)) => {
            let vocab_path = enc
                .parent()
                .map(|dir| dir.join(VOCAB_FILE))
                .unwrap_or_else(|| PathBuf::from(VOCAB_FILE));
            let saved = Vocabulary::load_json(&vocab_path)
                .with_context(|| format!("loading vocabulary {}", vocab_path.display()))?;
            corpus.verify_vocab(&saved)?;
            Autoencoder::from_snapshots(&model_cfg, corpus.vocab_size(), enc, dec, &device)?
        }
        _ => Autoencoder::new(&model_cfg, corpus.vocab_size(), &device)?,
    };
    let lengths = model.lengths();
    tracing::info!(
        vocab = corpus.vocab_size(),
        t1 = lengths.t1,
        t2 = lengths.t2,
        t3 = lengths.t3,
        "model ready"
    );

    let mut trainer = Trainer::new(model, train_cfg)?.with_vocab(corpus.vocab().clone());
    let reports = trainer.run(corpus.train(), corpus.test())?;

    if let Some(last) = reports.last() {
        let summary = serde_json::json!({
            "epochs": last.epoch,
            "train_loss": last.loss,
            "eval_loss": last.eval.map(|e| e.loss),
            "rouge1": last.eval.map(|e| e.rouge1),
            "rouge2": last.eval.map(|e| e.rouge2),
            "save_dir": args.save_dir,
        });
        println!("{summary}");
    }
    Ok(())
}
