//! Error types for Ember Core.

use thiserror::Error;

/// Result type alias for Ember operations.
pub type Result<T> = std::result::Result<T, EmberError>;

/// Errors that can occur while loading or running a model.
#[derive(Error, Debug)]
pub enum EmberError {
    /// Model configuration is inconsistent (e.g. head dimension mismatch).
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// A weight shard or parameter is missing or unreadable.
    #[error("weight load failure: {0}")]
    WeightLoadFailure(String),

    /// Generation was requested before a model finished loading.
    #[error("model is not loaded")]
    ModelNotLoaded,

    /// Declared quantization does not match the tensors in the checkpoint.
    #[error("quantization mismatch: {0}")]
    QuantizationMismatch(String),

    /// The checkpoint declares a model family this engine cannot build.
    #[error("unsupported model type: {0}")]
    UnsupportedModel(String),

    /// Logits contained NaN or infinite values.
    #[error("non-finite logits at generation step {step}")]
    NonFiniteLogits {
        /// Zero-based index of the decoding step.
        step: usize,
    },

    /// Shape mismatch error.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}
