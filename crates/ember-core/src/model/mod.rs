//! Model loading and inference.
//!
//! Provides the pieces of a decoder-only transformer:
//! - Model configuration and weight loading
//! - Rotary embeddings, attention, MLP and decoder blocks
//! - The causal language model and its factory
//! - Tokenizer integration

mod attention;
mod config;
mod kv_cache;
mod layer;
pub(crate) mod linear;
mod loader;
mod mlp;
mod norm;
mod rope;
mod tokenizer;
mod transformer;

pub use attention::Attention;
pub use config::{ModelConfig, ModelType, QuantizationSpec};
pub use kv_cache::{KvCache, KvCacheEntry};
pub use layer::{causal_mask, DecoderBlock, Residual};
pub use linear::{project, DenseLinear, Linear};
pub use loader::WeightTable;
pub use mlp::GatedMlp;
pub use norm::{LayerNorm, Norm, NormKind, RmsNorm};
pub use rope::RotaryEmbedding;
pub use tokenizer::{HfTokenizer, TokenCodec};
pub use transformer::{
    create_model, random_weights, Architecture, CausalLanguageModel, DecoderStack, LanguageModel,
};
