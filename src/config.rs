//! Model hyperparameters and the sequence-length arithmetic tying the
//! encoder and decoder together.
//!
//! ```text
//! t1 = sentence_len + 2 * (filter_shape - 1)
//! t2 = floor((t1 - filter_shape) / 2) + 1
//! t3 = floor((t2 - filter_shape) / 2) + 1 - 2
//! ```

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Stride of both downsampling stages.
pub const STRIDE: usize = 2;

/// Kernel size of the stride-1 refinement stage between stage B and the
/// collapsing layer. It removes `REFINE_KERNEL - 1 = 2` positions.
pub const REFINE_KERNEL: usize = 3;

/// Architecture hyperparameters.
///
/// Defaults match the hotel-review setup the model was first trained with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Tokens per sentence before boundary padding.
    pub sentence_len: usize,
    /// Embedding dimension `k`.
    pub embed_dim: usize,
    /// Channel count of the hidden convolution stages.
    pub filter_size: usize,
    /// Kernel size of the two stride-2 stages.
    pub filter_shape: usize,
    /// Size of the latent vector.
    pub latent_size: usize,
    /// Softmax temperature of the output projection.
    pub tau: f64,
    /// L2 ceiling for embedding rows.
    #[serde(default = "default_max_norm")]
    pub max_norm: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            sentence_len: 253,
            embed_dim: 300,
            filter_size: 300,
            filter_shape: 5,
            latent_size: 900,
            tau: 0.01,
            max_norm: default_max_norm(),
        }
    }
}

fn default_max_norm() -> f64 {
    1.0
}

impl ModelConfig {
    /// Derived sequence lengths; fails on a non-positive `t2` or `t3`.
    pub fn lengths(&self) -> Result<SequenceLengths> {
        SequenceLengths::compute(self.sentence_len, self.filter_shape)
    }

    /// Reject hyperparameters that cannot be laid out as a model.
    pub fn validate(&self) -> Result<SequenceLengths> {
        let sizes = [
            ("sentence_len", self.sentence_len),
            ("embed_dim", self.embed_dim),
            ("filter_size", self.filter_size),
            ("latent_size", self.latent_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        if !(self.tau.is_finite() && self.tau > 0.0) {
            return Err(Error::Config(format!(
                "tau must be a positive finite number, got {}",
                self.tau
            )));
        }
        if !(self.max_norm.is_finite() && self.max_norm > 0.0) {
            return Err(Error::Config(format!(
                "max_norm must be a positive finite number, got {}",
                self.max_norm
            )));
        }
        self.lengths()
    }
}

/// Padded input length and the lengths after each downsampling stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceLengths {
    /// Padded sentence length accepted by stage A.
    pub t1: usize,
    /// Length after stage A.
    pub t2: usize,
    /// Length entering the collapsing layer.
    pub t3: usize,
}

impl SequenceLengths {
    /// Apply the length formulas, rejecting any non-positive result.
    pub fn compute(sentence_len: usize, filter_shape: usize) -> Result<Self> {
        if filter_shape == 0 {
            return Err(Error::Config("filter_shape must be at least 1".into()));
        }
        let fs = filter_shape as i64;
        let stride = STRIDE as i64;
        let t1 = sentence_len as i64 + 2 * (fs - 1);
        let t2 = (t1 - fs).div_euclid(stride) + 1;
        let t3 = (t2 - fs).div_euclid(stride) + 1 - (REFINE_KERNEL as i64 - 1);
        if t2 <= 0 || t3 <= 0 {
            return Err(Error::Config(format!(
                "sentence_len={sentence_len}, filter_shape={filter_shape} gives \
                 t1={t1}, t2={t2}, t3={t3}; t2 and t3 must be positive"
            )));
        }
        Ok(Self {
            t1: t1 as usize,
            t2: t2 as usize,
            t3: t3 as usize,
        })
    }

    /// Length after stage B, before the refinement stage.
    pub fn stage_b(&self) -> usize {
        self.t3 + REFINE_KERNEL - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lengths() {
        let lengths = ModelConfig::default().validate().unwrap();
        // 253 + 2*4 = 261; (261-5)/2+1 = 129; (129-5)/2+1-2 = 61
        assert_eq!(
            lengths,
            SequenceLengths {
                t1: 261,
                t2: 129,
                t3: 61
            }
        );
        assert_eq!(lengths.stage_b(), 63);
    }

    #[test]
    fn odd_remainders_floor() {
        // t1 = 10 + 2 = 12, t2 = 5 + 1 = 6, t3 = 2 + 1 - 2 = 1
        let l = SequenceLengths::compute(10, 2).unwrap();
        assert_eq!((l.t1, l.t2, l.t3), (12, 6, 1));
        // t1 = 16 + 4 = 20, t2 = 8 + 1 = 9, t3 = 3 + 1 - 2 = 2
        let l = SequenceLengths::compute(16, 3).unwrap();
        assert_eq!((l.t1, l.t2, l.t3), (20, 9, 2));
    }

    #[test]
    fn valid_range_is_strictly_positive() {
        for filter_shape in 1..8 {
            for sentence_len in 1..64 {
                if let Ok(l) = SequenceLengths::compute(sentence_len, filter_shape) {
                    assert!(l.t1 > 0 && l.t2 > 0 && l.t3 > 0);
                    assert_eq!(l.t1, sentence_len + 2 * (filter_shape - 1));
                }
            }
        }
    }

    #[test]
    fn short_sentences_rejected() {
        // t1 = 12, t2 = 4, t3 = -2
        let err = SequenceLengths::compute(4, 5).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(SequenceLengths::compute(0, 1).is_err());
        assert!(SequenceLengths::compute(100, 0).is_err());
    }

    #[test]
    fn zero_sizes_rejected() {
        let cfg = ModelConfig {
            latent_size: 0,
            ..ModelConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let cfg = ModelConfig {
            tau: 0.0,
            ..ModelConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_json_defaults_max_norm() {
        let json = r#"{"sentence_len":30,"embed_dim":8,"filter_size":8,
            "filter_shape":3,"latent_size":16,"tau":0.1}"#;
        let cfg: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.max_norm, 1.0);
    }
}
