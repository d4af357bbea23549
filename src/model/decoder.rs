//! Deconvolutional sentence decoder.
//!
//! Mirror image of the encoder, followed by a temperature-scaled projection
//! onto the shared embedding table:
//!
//! ```text
//! latent [B, latent] ─→ unsqueeze                        [B, latent, 1]
//!   ─→ TConv1d(latent → F, t3) + ReLU                    [B, F, t3]
//!   ─→ TConv1d(F → F, 3) + ReLU                          [B, F, t3 + 2]
//!   ─→ TConv1d(F → F, filter_shape, s=2) + ReLU          [B, F, t2]
//!   ─→ TConv1d(F → k, filter_shape, s=2) + tanh          [B, k, t1]
//!   ─→ transpose, L2-normalise each position             [B, t1, k]
//!   ─→ · embeddingᵀ / tau, log_softmax                   [B, t1, V]
//! ```

use candle_core::{D, Module, Tensor};
use candle_nn::VarBuilder;

use super::conv::{TransposedConv1d, TransposedConv1dConfig, transposed_conv1d};
use super::embedding::{NORM_EPS, SharedEmbedding};
use crate::config::{ModelConfig, REFINE_KERNEL, STRIDE, SequenceLengths};
use crate::{Error, Result};

/// `output_padding` that makes a stride-`STRIDE` transposed conv map `len_in`
/// back onto exactly `len_out`.
pub fn output_padding(len_in: usize, len_out: usize, kernel_size: usize) -> Result<usize> {
    let reached = (len_in - 1) * STRIDE + kernel_size;
    match len_out.checked_sub(reached) {
        Some(pad) if pad < STRIDE => Ok(pad),
        _ => Err(Error::Config(format!(
            "transposed conv with kernel {kernel_size} cannot map length {len_in} to {len_out}"
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct DeconvolutionDecoder {
    expand: TransposedConv1d,
    refine: TransposedConv1d,
    stage_b: TransposedConv1d,
    stage_a: TransposedConv1d,
    tau: f64,
    lengths: SequenceLengths,
}

impl DeconvolutionDecoder {
    pub fn new(cfg: &ModelConfig, lengths: SequenceLengths, vb: VarBuilder) -> Result<Self> {
        let f = cfg.filter_size;
        let fs = cfg.filter_shape;
        let expand = transposed_conv1d(cfg.latent_size, f, lengths.t3, Default::default(), vb.pp("expand"))?;
        let refine = transposed_conv1d(f, f, REFINE_KERNEL, Default::default(), vb.pp("refine"))?;
        let stage_b_cfg = TransposedConv1dConfig {
            stride: STRIDE,
            output_padding: output_padding(lengths.stage_b(), lengths.t2, fs)?,
        };
        let stage_b = transposed_conv1d(f, f, fs, stage_b_cfg, vb.pp("stage_b"))?;
        let stage_a_cfg = TransposedConv1dConfig {
            stride: STRIDE,
            output_padding: output_padding(lengths.t2, lengths.t1, fs)?,
        };
        let stage_a = transposed_conv1d(f, cfg.embed_dim, fs, stage_a_cfg, vb.pp("stage_a"))?;
        Ok(Self {
            expand,
            refine,
            stage_b,
            stage_a,
            tau: cfg.tau,
            lengths,
        })
    }

    pub fn tau(&self) -> f64 {
        self.tau
    }

    pub fn set_tau(&mut self, tau: f64) {
        self.tau = tau;
    }

    pub fn lengths(&self) -> SequenceLengths {
        self.lengths
    }

    /// Upsample latents `[B, latent]` to hidden sequences `[B, t1, k]`.
    pub fn hidden(&self, latent: &Tensor) -> Result<Tensor> {
        let h = latent
            .unsqueeze(2)?
            .apply(&self.expand)?
            .relu()?
            .apply(&self.refine)?
            .relu()?
            .apply(&self.stage_b)?
            .relu()?;
        let x_hat = self.stage_a.forward(&h)?.tanh()?;
        Ok(x_hat.transpose(1, 2)?)
    }

    /// Raw scores `[B, t1, V]`: cosine-style similarity of each normalised
    /// hidden vector with every embedding row, divided by `tau`.
    pub fn logits(&self, hidden: &Tensor, embedding: &SharedEmbedding) -> Result<Tensor> {
        let norm = (hidden.sqr()?.sum_keepdim(D::Minus1)?.sqrt()? + NORM_EPS)?;
        let unit = hidden.broadcast_div(&norm)?;
        let table = embedding.table()?;
        let scores = unit.broadcast_matmul(&table.t()?)?;
        Ok((scores / self.tau)?)
    }

    /// Per-position log-probabilities over the vocabulary, `[B, t1, V]`.
    pub fn forward(&self, latent: &Tensor, embedding: &SharedEmbedding) -> Result<Tensor> {
        let hidden = self.hidden(latent)?;
        let logits = self.logits(&hidden, embedding)?;
        Ok(candle_nn::ops::log_softmax(&logits, D::Minus1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;

    fn embedding(vocab: usize, k: usize, dev: &Device) -> SharedEmbedding {
        let w = Var::randn(0f32, 1.0, (vocab, k), dev).unwrap();
        SharedEmbedding::new(w, 1.0).unwrap()
    }

    #[test]
    fn output_padding_recovers_exact_lengths() {
        // 253/5: stage B maps 63 -> 129, stage A maps 129 -> 261.
        assert_eq!(output_padding(63, 129, 5).unwrap(), 0);
        assert_eq!(output_padding(129, 261, 5).unwrap(), 0);
        // (6 - 1) * 2 + 3 = 13, one short of 14
        assert_eq!(output_padding(6, 14, 3).unwrap(), 1);
        assert!(output_padding(6, 20, 3).is_err());
    }

    #[test]
    fn decodes_to_padded_length() {
        let dev = Device::Cpu;
        let cfg = ModelConfig {
            sentence_len: 253,
            embed_dim: 4,
            filter_size: 6,
            filter_shape: 5,
            latent_size: 8,
            ..ModelConfig::default()
        };
        let lengths = cfg.validate().unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let dec = DeconvolutionDecoder::new(&cfg, lengths, vb.pp("decoder")).unwrap();
        let emb = embedding(11, 4, &dev);

        let latent = Tensor::randn(0f32, 1.0, (2, 8), &dev).unwrap();
        let log_probs = dec.forward(&latent, &emb).unwrap();
        assert_eq!(log_probs.dims(), &[2, 261, 11]);

        // Each position is a distribution.
        let sums = log_probs.exp().unwrap().sum(D::Minus1).unwrap();
        let sums = sums.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-4));
    }

    #[test]
    fn odd_lengths_round_trip() {
        let dev = Device::Cpu;
        for (sentence_len, filter_shape) in [(10, 2), (16, 3), (23, 4), (40, 5)] {
            let cfg = ModelConfig {
                sentence_len,
                embed_dim: 3,
                filter_size: 4,
                filter_shape,
                latent_size: 5,
                ..ModelConfig::default()
            };
            let lengths = cfg.validate().unwrap();
            let vb = VarBuilder::zeros(DType::F32, &dev);
            let dec = DeconvolutionDecoder::new(&cfg, lengths, vb).unwrap();
            let latent = Tensor::zeros((1, 5), DType::F32, &dev).unwrap();
            let hidden = dec.hidden(&latent).unwrap();
            assert_eq!(hidden.dims(), &[1, lengths.t1, 3], "{sentence_len}/{filter_shape}");
        }
    }

    #[test]
    fn lower_tau_sharpens_distribution() {
        let dev = Device::Cpu;
        let cfg = ModelConfig {
            sentence_len: 10,
            embed_dim: 4,
            filter_size: 4,
            filter_shape: 2,
            latent_size: 6,
            tau: 1.0,
            ..ModelConfig::default()
        };
        let lengths = cfg.validate().unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mut dec = DeconvolutionDecoder::new(&cfg, lengths, vb).unwrap();
        let emb = embedding(9, 4, &dev);
        let hidden = Tensor::randn(0f32, 1.0, (1, lengths.t1, 4), &dev).unwrap();

        let peak = |dec: &DeconvolutionDecoder| -> Vec<f32> {
            let logits = dec.logits(&hidden, &emb).unwrap();
            candle_nn::ops::softmax_last_dim(&logits)
                .unwrap()
                .max(D::Minus1)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        };
        let warm = peak(&dec);
        dec.set_tau(0.1);
        let cold = peak(&dec);
        assert!(warm.iter().zip(&cold).any(|(w, c)| c > w));
        assert!(warm.iter().zip(&cold).all(|(w, c)| c + 1e-6 >= *w));
    }
}
