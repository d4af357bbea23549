//! Transposed 1-D convolution with autograd support.
//!
//! candle has no backward pass for `conv_transpose1d`, so the layer is
//! written as an ordinary stride-1 `conv1d` over the zero-dilated input:
//!
//! ```text
//! x [B, C_in, L]
//!   → insert (stride - 1) zeros between steps   [B, C_in, (L-1)*stride + 1]
//!   → pad (k - 1) left, (k - 1 + output_padding) right
//!   → conv1d with kernel transposed to [C_out, C_in, k] and flipped along k
//!   → [B, C_out, (L-1)*stride + k + output_padding]
//! ```
//!
//! Weights use the `[C_in, C_out, k]` layout of `candle_nn::ConvTranspose1d`.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// Hyperparameters of a [`TransposedConv1d`]. No input padding is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransposedConv1dConfig {
    pub stride: usize,
    pub output_padding: usize,
}

impl Default for TransposedConv1dConfig {
    fn default() -> Self {
        Self {
            stride: 1,
            output_padding: 0,
        }
    }
}

impl TransposedConv1dConfig {
    /// Output length for an input of `len` steps.
    pub fn out_len(&self, len: usize, kernel_size: usize) -> usize {
        (len - 1) * self.stride + kernel_size + self.output_padding
    }
}

#[derive(Debug, Clone)]
pub struct TransposedConv1d {
    weight: Tensor, // [C_in, C_out, k]
    bias: Tensor,   // [C_out]
    flip: Tensor,   // [k] = k-1, ..., 0
    cfg: TransposedConv1dConfig,
}

impl TransposedConv1d {
    pub fn new(weight: Tensor, bias: Tensor, cfg: TransposedConv1dConfig) -> Result<Self> {
        let (_, _, k) = weight.dims3()?;
        let flip = Tensor::new((0..k as u32).rev().collect::<Vec<_>>(), weight.device())?;
        Ok(Self {
            weight,
            bias,
            flip,
            cfg,
        })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    pub fn config(&self) -> &TransposedConv1dConfig {
        &self.cfg
    }

    fn dilate(&self, xs: &Tensor) -> Result<Tensor> {
        let stride = self.cfg.stride;
        if stride == 1 {
            return Ok(xs.clone());
        }
        let (b, c, l) = xs.dims3()?;
        let zeros = Tensor::zeros((b, c, l, stride - 1), xs.dtype(), xs.device())?;
        Tensor::cat(&[&xs.unsqueeze(3)?, &zeros], 3)?
            .reshape((b, c, l * stride))?
            .narrow(2, 0, (l - 1) * stride + 1)
    }
}

impl Module for TransposedConv1d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let k = self.weight.dim(2)?;
        let xs = self
            .dilate(xs)?
            .pad_with_zeros(2, k - 1, k - 1 + self.cfg.output_padding)?;
        let kernel = self
            .weight
            .transpose(0, 1)?
            .contiguous()?
            .index_select(&self.flip, 2)?;
        xs.conv1d(&kernel, 0, 1, 1, 1)?
            .broadcast_add(&self.bias.reshape((1, (), 1))?)
    }
}

/// Build a [`TransposedConv1d`] backed by `vb`, with the same initialisation
/// candle uses for `ConvTranspose1d`.
pub fn transposed_conv1d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    cfg: TransposedConv1dConfig,
    vb: VarBuilder,
) -> Result<TransposedConv1d> {
    let weight = vb.get_with_hints(
        (in_channels, out_channels, kernel_size),
        "weight",
        candle_nn::init::DEFAULT_KAIMING_NORMAL,
    )?;
    let bound = 1. / ((out_channels * kernel_size) as f64).sqrt();
    let bias = vb.get_with_hints(
        out_channels,
        "bias",
        Init::Uniform {
            lo: -bound,
            up: bound,
        },
    )?;
    TransposedConv1d::new(weight, bias, cfg)
}
