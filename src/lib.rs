//! Convolutional sentence autoencoder in pure Rust.
//!
//! A candle-based encoder/decoder that compresses a fixed-length sentence
//! into one latent vector and reconstructs it token by token. Both halves
//! share one word-embedding table whose rows are kept under a norm ceiling.
//!
//! ## Architecture
//!
//! ```text
//! ids [B, t1] → embedding ─→ conv (stride 2) ×2 → refine → collapse → tanh
//!                  │                                                   ↓
//!                  │                                          latent [B, L]
//!                  │                                                   ↓
//!                  └─ table ← L2-normalised hidden / τ ← deconv ×4 ←───┘
//!                                     ↓
//!                         log-probabilities [B, t1, V]
//! ```
//!
//! ## Modules
//!
//! - [`config`]: hyperparameters and sequence-length arithmetic
//! - [`data`]: corpus loading, vocabulary, batches
//! - [`model`]: shared embedding, encoder, decoder, snapshots
//! - [`train`]: loss, learning-rate schedule, training loop
//! - [`metrics`]: ROUGE-n on token ids
//! - [`device`]: CPU/CUDA selection

pub mod config;
pub mod data;
pub mod device;
pub mod metrics;
pub mod model;
pub mod train;

mod error;

pub use error::{Error, Result};
