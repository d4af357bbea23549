//! Reconstruction loss.
//!
//! Token-level negative log-likelihood of the input sentence under the
//! decoder's per-position distribution, summed over positions and averaged
//! over the batch:
//!
//! ```text
//! L = (1 / B) Σ_b Σ_t -log p(x[b, t] | b, t)
//! ```

use candle_core::Tensor;

use crate::Result;

/// Loss of one batch plus what is needed to report it per token.
#[derive(Debug, Clone)]
pub struct ReconstructionLoss {
    /// Scalar to backpropagate: summed NLL divided by the batch size.
    pub total: Tensor,
    /// Sentences in the batch.
    pub sentences: usize,
    /// Positions that contributed to the sum.
    pub tokens: usize,
}

impl ReconstructionLoss {
    /// Summed NLL over the batch, as a host value.
    pub fn summed(&self) -> Result<f64> {
        let total = self.total.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
        Ok(total * self.sentences as f64)
    }

    /// Mean NLL per counted token.
    pub fn per_token(&self) -> Result<f64> {
        Ok(self.summed()? / self.tokens.max(1) as f64)
    }
}

/// Loss of `log_probs` `[B, T, V]` against `targets` `[B, T]` (`u32`).
///
/// With `pad_id` set, positions holding that id are left out of the sum and
/// of the token count.
pub fn reconstruction_loss(
    log_probs: &Tensor,
    targets: &Tensor,
    pad_id: Option<u32>,
) -> Result<ReconstructionLoss> {
    let (b, t, v) = log_probs.dims3()?;
    let targets = targets.flatten_all()?;
    let nll = log_probs
        .reshape((b * t, v))?
        .gather(&targets.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .neg()?;

    let (summed, tokens) = match pad_id {
        None => (nll.sum_all()?, b * t),
        Some(pad) => {
            let mask = targets.ne(pad)?.to_dtype(nll.dtype())?;
            let tokens = mask.sum_all()?.to_scalar::<f32>()? as usize;
            ((nll * mask)?.sum_all()?, tokens)
        }
    };
    Ok(ReconstructionLoss {
        total: (summed / b as f64)?,
        sentences: b,
        tokens,
    })
}
