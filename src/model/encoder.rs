//! Convolutional sentence encoder.
//!
//! ```text
//! ids [B, t1] ─→ embedding                         [B, t1, k]
//!   ─→ transpose                                   [B, k, t1]
//!   ─→ Conv1d(k → F, filter_shape, s=2) + ReLU     [B, F, t2]
//!   ─→ Conv1d(F → F, filter_shape, s=2) + ReLU     [B, F, t3 + 2]
//!   ─→ Conv1d(F → F, 3) + ReLU                     [B, F, t3]
//!   ─→ Conv1d(F → latent, t3) + tanh               [B, latent, 1]
//!   ─→ squeeze                                     [B, latent]
//! ```

use candle_core::{Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, VarBuilder};

use super::embedding::SharedEmbedding;
use crate::config::{ModelConfig, REFINE_KERNEL, STRIDE, SequenceLengths};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ConvolutionEncoder {
    stage_a: Conv1d,
    stage_b: Conv1d,
    refine: Conv1d,
    collapse: Conv1d,
    lengths: SequenceLengths,
}

impl ConvolutionEncoder {
    /// Build the encoder for already-checked `lengths`.
    pub fn new(cfg: &ModelConfig, lengths: SequenceLengths, vb: VarBuilder) -> Result<Self> {
        let strided = Conv1dConfig {
            stride: STRIDE,
            ..Default::default()
        };
        let f = cfg.filter_size;
        let stage_a = candle_nn::conv1d(cfg.embed_dim, f, cfg.filter_shape, strided, vb.pp("stage_a"))?;
        let stage_b = candle_nn::conv1d(f, f, cfg.filter_shape, strided, vb.pp("stage_b"))?;
        let refine = candle_nn::conv1d(f, f, REFINE_KERNEL, Default::default(), vb.pp("refine"))?;
        let collapse = candle_nn::conv1d(
            f,
            cfg.latent_size,
            lengths.t3,
            Default::default(),
            vb.pp("collapse"),
        )?;
        Ok(Self {
            stage_a,
            stage_b,
            refine,
            collapse,
            lengths,
        })
    }

    pub fn lengths(&self) -> SequenceLengths {
        self.lengths
    }

    /// Encode embedded sentences `[B, t1, k]` into latents `[B, latent]`.
    pub fn forward_embedded(&self, embedded: &Tensor) -> Result<Tensor> {
        let (_b, t, _k) = embedded.dims3()?;
        if t != self.lengths.t1 {
            return Err(Error::Data(format!(
                "encoder expects padded sentences of length {}, got {t}",
                self.lengths.t1
            )));
        }
        let h = embedded
            .transpose(1, 2)?
            .apply(&self.stage_a)?
            .relu()?
            .apply(&self.stage_b)?
            .relu()?
            .apply(&self.refine)?
            .relu()?;
        let latent = self.collapse.forward(&h)?.tanh()?;
        Ok(latent.squeeze(2)?)
    }

    /// Look up `ids` `[B, t1]` in the shared table and encode them.
    pub fn forward(&self, embedding: &SharedEmbedding, ids: &Tensor) -> Result<Tensor> {
        let embedded = embedding.lookup(ids)?;
        self.forward_embedded(&embedded)
    }
}
