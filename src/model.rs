//! Model components for the sentence autoencoder.
//!
//! ## Components
//!
//! - [`embedding`]: the `(V, k)` table shared by encoder and decoder, with a per-row norm ceiling
//! - [`encoder`]: strided 1-D convolutions collapsing `[B, t1]` ids to `[B, latent]`
//! - [`decoder`]: transposed convolutions back to `[B, t1, k]`, projected onto the table
//! - [`conv`]: the differentiable transposed convolution used by the decoder
//! - [`snapshot`]: per-half safetensors files

pub mod conv;
pub mod decoder;
pub mod embedding;
pub mod encoder;
pub mod snapshot;

use std::path::{Path, PathBuf};

use candle_core::{D, DType, Device, Tensor, Var};
use candle_nn::{Init, VarBuilder, VarMap};

use crate::config::{ModelConfig, SequenceLengths};
use crate::{Error, Result};
use decoder::DeconvolutionDecoder;
use embedding::SharedEmbedding;
use encoder::ConvolutionEncoder;
use snapshot::Half;

/// Variable name of the shared table inside the parameter store.
pub const EMBEDDING_WEIGHT: &str = "embedding.weight";

/// Encoder + decoder around one shared embedding table.
///
/// All parameters live in one [`VarMap`]; the embedding variable appears
/// once and both halves borrow it at call time.
pub struct Autoencoder {
    varmap: VarMap,
    embedding: SharedEmbedding,
    encoder: ConvolutionEncoder,
    decoder: DeconvolutionDecoder,
    cfg: ModelConfig,
    device: Device,
}

impl Autoencoder {
    /// Freshly initialised model. Rejects invalid hyperparameters.
    pub fn new(cfg: &ModelConfig, vocab_size: usize, device: &Device) -> Result<Self> {
        let lengths = cfg.validate()?;
        if vocab_size == 0 {
            return Err(Error::Config("vocabulary is empty".into()));
        }
        Self::build(cfg, lengths, vocab_size, device)
    }

    /// Restore a model from an encoder and a decoder snapshot.
    ///
    /// This skips [`ModelConfig::validate`]: the caller vouches that `cfg`
    /// and `vocab_size` are the ones the snapshots were written with. Each
    /// stored tensor is still shape-checked against the layout `cfg`
    /// implies, so a mismatch surfaces as [`Error::Checkpoint`].
    pub fn from_snapshots(
        cfg: &ModelConfig,
        vocab_size: usize,
        encoder_path: impl AsRef<Path>,
        decoder_path: impl AsRef<Path>,
        device: &Device,
    ) -> Result<Self> {
        let lengths = cfg.lengths()?;
        let model = Self::build(cfg, lengths, vocab_size, device)?;
        snapshot::load_half(&model.varmap, Half::Encoder, encoder_path.as_ref(), device)?;
        snapshot::load_half(&model.varmap, Half::Decoder, decoder_path.as_ref(), device)?;
        tracing::info!(
            encoder = %encoder_path.as_ref().display(),
            decoder = %decoder_path.as_ref().display(),
            "restored model from snapshots"
        );
        Ok(model)
    }

    fn build(
        cfg: &ModelConfig,
        lengths: SequenceLengths,
        vocab_size: usize,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        vb.pp("embedding").get_with_hints(
            (vocab_size, cfg.embed_dim),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        let embedding = SharedEmbedding::new(named_var(&varmap, EMBEDDING_WEIGHT)?, cfg.max_norm)?;
        let encoder = ConvolutionEncoder::new(cfg, lengths, vb.pp("encoder"))?;
        let decoder = DeconvolutionDecoder::new(cfg, lengths, vb.pp("decoder"))?;

        Ok(Self {
            varmap,
            embedding,
            encoder,
            decoder,
            cfg: cfg.clone(),
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    pub fn lengths(&self) -> SequenceLengths {
        self.encoder.lengths()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn vocab_size(&self) -> usize {
        self.embedding.vocab_size()
    }

    pub fn embedding(&self) -> &SharedEmbedding {
        &self.embedding
    }

    pub fn encoder(&self) -> &ConvolutionEncoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &DeconvolutionDecoder {
        &self.decoder
    }

    /// Every trainable variable: embedding, encoder and decoder.
    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// `[B, t1]` ids → `[B, latent]`.
    pub fn encode(&self, ids: &Tensor) -> Result<Tensor> {
        self.encoder.forward(&self.embedding, ids)
    }

    /// `[B, latent]` → `[B, t1, V]` log-probabilities.
    pub fn decode(&self, latent: &Tensor) -> Result<Tensor> {
        self.decoder.forward(latent, &self.embedding)
    }

    /// Full reconstruction pass, `[B, t1]` ids → `[B, t1, V]` log-probabilities.
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let latent = self.encode(ids)?;
        self.decode(&latent)
    }

    /// Most likely token at every position, `[B, t1]` `u32`.
    pub fn reconstruct(&self, ids: &Tensor) -> Result<Tensor> {
        Ok(self.forward(ids)?.argmax(D::Minus1)?)
    }

    /// Write `encoder_{tag}` and `decoder_{tag}` snapshots into `dir`.
    pub fn save_snapshots(&self, dir: impl AsRef<Path>, tag: &str) -> Result<(PathBuf, PathBuf)> {
        let dir = dir.as_ref();
        let encoder_path = snapshot::snapshot_path(dir, Half::Encoder, tag);
        let decoder_path = snapshot::snapshot_path(dir, Half::Decoder, tag);
        snapshot::save_half(&self.varmap, Half::Encoder, &encoder_path)?;
        snapshot::save_half(&self.varmap, Half::Decoder, &decoder_path)?;
        Ok((encoder_path, decoder_path))
    }
}

fn named_var(varmap: &VarMap, name: &str) -> Result<Var> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::msg("parameter store lock poisoned"))?;
    data.get(name)
        .cloned()
        .ok_or_else(|| candle_core::Error::msg(format!("parameter {name} missing")).into())
}
