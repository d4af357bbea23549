//! Error types for text-deconv-ae.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
///
/// The first four variants are the failure categories a training run can
/// end with; the rest wrap lower-level errors as they bubble up.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Hyperparameters that cannot describe a model (e.g. `t3 <= 0`).
    #[error("configuration error: {0}")]
    Config(String),

    /// Corpus missing, unreadable, or inconsistent with `sentence_len`.
    #[error("data error: {0}")]
    Data(String),

    /// Snapshot missing, corrupt, or shaped for different hyperparameters.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Accelerator requested but unavailable.
    #[error("device error: {0}")]
    Device(String),

    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
