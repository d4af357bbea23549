//! Shared embedding table with a per-row L2 ceiling.
//!
//! One `(V, k)` variable is read by two consumers: the encoder gathers rows
//! for the input tokens and the decoder projects every hidden vector onto the
//! whole table. Rows are renormalised in place right before they are read,
//! outside the autograd graph, so the gradients of both consumers accumulate
//! into the same variable and land in a single optimizer step.
//!
//! Norms and scale factors are computed in `f64`. A clamped row is scaled to
//! just under the ceiling, so it stays within it after rounding back to the
//! table dtype and a second clamp leaves it bit-identical.

use std::collections::BTreeSet;

use candle_core::{D, DType, Result, Tensor, Var};

/// Added to the norm before dividing, as in `torch.embedding_renorm_`.
pub const NORM_EPS: f64 = 1e-7;

/// Per-row factors `[N, 1]` (`f64`) bringing each row of `rows` `[N, k]`
/// within `ceiling`. Rows already inside it get exactly 1.
fn shrink_factors(rows: &Tensor, ceiling: f64) -> Result<Tensor> {
    let norms = row_norms_f64(rows)?.unsqueeze(1)?;
    let target = ceiling * (1.0 - f32::EPSILON as f64);
    let shrink = ((&norms + NORM_EPS)?.recip()? * target)?;
    norms.gt(ceiling)?.where_cond(&shrink, &Tensor::ones_like(&norms)?)
}

fn apply_factors(rows: &Tensor, factors: &Tensor) -> Result<Tensor> {
    rows.to_dtype(DType::F64)?
        .broadcast_mul(factors)?
        .to_dtype(rows.dtype())
}

fn row_norms_f64(rows: &Tensor) -> Result<Tensor> {
    rows.to_dtype(DType::F64)?.sqr()?.sum(D::Minus1)?.sqrt()
}

/// Rescale each row of `rows` `[N, k]` so its L2 norm is at most `ceiling`.
///
/// Rows already within the ceiling come back bit-identical, so applying
/// this twice gives the same result as applying it once.
pub fn clamp_norm(rows: &Tensor, ceiling: f64) -> Result<Tensor> {
    apply_factors(rows, &shrink_factors(rows, ceiling)?)
}

/// The embedding table shared by encoder and decoder.
#[derive(Debug, Clone)]
pub struct SharedEmbedding {
    weight: Var,
    vocab_size: usize,
    embed_dim: usize,
    max_norm: f64,
}

impl SharedEmbedding {
    /// Wrap a `[V, k]` variable.
    pub fn new(weight: Var, max_norm: f64) -> Result<Self> {
        let (vocab_size, embed_dim) = weight.dims2()?;
        Ok(Self {
            weight,
            vocab_size,
            embed_dim,
            max_norm,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn max_norm(&self) -> f64 {
        self.max_norm
    }

    /// The underlying variable, for the optimizer and snapshots.
    pub fn var(&self) -> &Var {
        &self.weight
    }

    /// Clamp the rows named in `ids` (any shape, `u32`). Other rows are untouched.
    pub fn renorm_rows(&self, ids: &Tensor) -> Result<()> {
        let unique: BTreeSet<u32> = ids.flatten_all()?.to_vec1::<u32>()?.into_iter().collect();
        if unique.is_empty() {
            return Ok(());
        }
        let vocab = self.vocab_size as u32;
        if let Some(&bad) = unique.iter().find(|&&id| id >= vocab) {
            candle_core::bail!("token id {bad} out of range for vocabulary of {vocab}");
        }
        let device = ids.device();
        let index = Tensor::new(unique.into_iter().collect::<Vec<_>>(), device)?;
        let touched = Tensor::zeros(self.vocab_size, DType::F64, device)?
            .index_add(&index, &Tensor::ones(index.dim(0)?, DType::F64, device)?, 0)?
            .gt(0.0)?
            .unsqueeze(1)?;
        self.clamp_selected(Some(&touched))
    }

    /// Clamp every row.
    pub fn renorm_all(&self) -> Result<()> {
        self.clamp_selected(None)
    }

    /// Rescale the rows over the ceiling, restricted to `selected` `[V, 1]`
    /// when given. Writes nothing if no row needs it.
    fn clamp_selected(&self, selected: Option<&Tensor>) -> Result<()> {
        let table = self.weight.as_tensor().detach();
        let mut factors = shrink_factors(&table, self.max_norm)?;
        if let Some(mask) = selected {
            factors = mask.where_cond(&factors, &Tensor::ones_like(&factors)?)?;
        }
        if factors.min_all()?.to_scalar::<f64>()? >= 1.0 {
            return Ok(());
        }
        self.weight.set(&apply_factors(&table, &factors)?)
    }

    /// Gather `[B, T]` token ids into `[B, T, k]` vectors.
    pub fn lookup(&self, ids: &Tensor) -> Result<Tensor> {
        self.renorm_rows(ids)?;
        let (b, t) = ids.dims2()?;
        self.weight
            .as_tensor()
            .index_select(&ids.flatten_all()?, 0)?
            .reshape((b, t, self.embed_dim))
    }

    /// The whole `[V, k]` table, read by the decoder projection.
    ///
    /// Reading the full table touches every row, so all rows are clamped.
    pub fn table(&self) -> Result<Tensor> {
        self.renorm_all()?;
        Ok(self.weight.as_tensor().clone())
    }

    /// Current L2 norm of every row, `[V]`, in `f64`.
    pub fn row_norms(&self) -> Result<Tensor> {
        row_norms_f64(self.weight.as_tensor())
    }
}
