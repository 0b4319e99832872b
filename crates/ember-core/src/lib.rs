//! # Ember Core
//!
//! Inference engine for decoder-only transformer language models.
//!
//! This crate provides:
//! - **Model assembly** from safetensors checkpoints and a `config.json`
//! - **Decoder blocks** with rotary attention, grouped KV heads and a gated MLP
//! - **Affine group quantization** of linear projections
//! - **KV caching** so each decoding step only processes the newest token
//! - **Generation** with greedy or seeded temperature sampling

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod generation;
pub mod model;
pub mod quantization;

pub use error::{EmberError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{EmberError, Result};
    pub use crate::generation::{generate, GenerationConfig, Sampler, TokenIterator};
    pub use crate::model::{
        create_model, HfTokenizer, KvCache, LanguageModel, ModelConfig, ModelType,
        QuantizationSpec, TokenCodec, WeightTable,
    };
    pub use crate::quantization::{QuantizationPlan, QuantizedLinear};
}
