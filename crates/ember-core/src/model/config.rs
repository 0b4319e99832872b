//! Model configuration.

use crate::error::{EmberError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

fn default_rotary_factor() -> f64 {
    1.0
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_norm_eps() -> f64 {
    1e-5
}

/// Group-wise affine quantization parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationSpec {
    /// Number of consecutive input weights sharing one scale and bias.
    pub group_size: usize,
    /// Bit width of each code.
    pub bits: usize,
}

impl QuantizationSpec {
    /// Create a new quantization spec.
    pub fn new(group_size: usize, bits: usize) -> Self {
        Self { group_size, bits }
    }

    /// Largest representable code.
    pub fn max_code(&self) -> u32 {
        (1u32 << self.bits) - 1
    }

    /// Codes stored in one packed `u32`.
    pub fn codes_per_word(&self) -> usize {
        32 / self.bits
    }

    /// Check bit width and group size.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.bits, 2 | 4 | 8) {
            return Err(EmberError::ConfigurationInvalid(format!(
                "unsupported quantization bit width {}",
                self.bits
            )));
        }
        if self.group_size == 0 {
            return Err(EmberError::ConfigurationInvalid(
                "quantization group size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for QuantizationSpec {
    fn default() -> Self {
        Self {
            group_size: 64,
            bits: 4,
        }
    }
}

/// Architecture family declared by a checkpoint's `model_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    /// StableLM (parallel residual, LayerNorm).
    StableLm,
    /// Llama (sequential residual, RMSNorm).
    Llama,
    /// Mistral, built with the Llama architecture.
    Mistral,
    /// Phi (recognised, not buildable).
    Phi,
    /// Gemma (recognised, not buildable).
    Gemma,
}

impl ModelType {
    /// Canonical `model_type` string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StableLm => "stablelm_epoch",
            Self::Llama => "llama",
            Self::Mistral => "mistral",
            Self::Phi => "phi",
            Self::Gemma => "gemma",
        }
    }
}

impl FromStr for ModelType {
    type Err = EmberError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stablelm_epoch" | "stablelm" => Ok(Self::StableLm),
            "llama" => Ok(Self::Llama),
            "mistral" => Ok(Self::Mistral),
            "phi" => Ok(Self::Phi),
            "gemma" => Ok(Self::Gemma),
            other => Err(EmberError::UnsupportedModel(other.to_string())),
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a decoder-only transformer, read from `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model architecture type.
    #[serde(default)]
    pub model_type: String,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Intermediate dimension (FFN).
    pub intermediate_size: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of KV heads (for GQA). Defaults to the attention head count.
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    /// Number of layers.
    pub num_hidden_layers: usize,
    /// Fraction of each head's channels that receive rotary encoding.
    #[serde(default = "default_rotary_factor")]
    pub partial_rotary_factor: f64,
    /// Rope theta.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Normalization epsilon.
    #[serde(default = "default_norm_eps", alias = "rms_norm_eps")]
    pub layer_norm_eps: f64,
    /// Bias on the query/key/value projections.
    #[serde(default)]
    pub use_qkv_bias: bool,
    /// Reuse the embedding table as LM head when `lm_head.weight` is absent.
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// Present when the checkpoint is pre-quantized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<QuantizationSpec>,
}

impl ModelConfig {
    /// Calculate head dimension.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads.max(1)
    }

    /// Number of key/value heads.
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Get GQA ratio.
    pub fn gqa_ratio(&self) -> usize {
        self.num_attention_heads / self.num_kv_heads().max(1)
    }

    /// Channels per head that are rotated.
    pub fn rotary_dim(&self) -> usize {
        (self.partial_rotary_factor * self.head_dim() as f64) as usize
    }

    /// Parsed architecture family.
    pub fn model_type(&self) -> Result<ModelType> {
        self.model_type.parse()
    }

    /// Check structural invariants before any tensor is built.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(EmberError::ConfigurationInvalid(msg));

        if self.vocab_size == 0 || self.hidden_size == 0 || self.intermediate_size == 0 {
            return invalid("vocab, hidden and intermediate sizes must be positive".to_string());
        }
        if self.num_attention_heads == 0 || self.num_kv_heads() == 0 {
            return invalid("head counts must be positive".to_string());
        }
        if self.head_dim() * self.num_attention_heads != self.hidden_size {
            return invalid(format!(
                "hidden_size {} must be divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            ));
        }
        if self.num_attention_heads % self.num_kv_heads() != 0 {
            return invalid(format!(
                "num_attention_heads {} must be a multiple of num_key_value_heads {}",
                self.num_attention_heads,
                self.num_kv_heads()
            ));
        }
        if !(0.0..=1.0).contains(&self.partial_rotary_factor) {
            return invalid(format!(
                "partial_rotary_factor {} outside [0, 1]",
                self.partial_rotary_factor
            ));
        }
        if self.rotary_dim() % 2 != 0 {
            return invalid(format!("rotary dimension {} must be even", self.rotary_dim()));
        }
        if let Some(quant) = &self.quantization {
            quant.validate()?;
        }
        Ok(())
    }

    /// Parse from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        // StableLM-2-1.6B-like defaults
        Self {
            model_type: ModelType::StableLm.as_str().to_string(),
            vocab_size: 100352,
            hidden_size: 2048,
            intermediate_size: 5632,
            num_attention_heads: 32,
            num_key_value_heads: Some(32),
            num_hidden_layers: 24,
            partial_rotary_factor: 0.25,
            rope_theta: 10_000.0,
            layer_norm_eps: 1e-5,
            use_qkv_bias: true,
            tie_word_embeddings: false,
            quantization: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STABLELM_JSON: &str = r#"{
        "model_type": "stablelm_epoch",
        "vocab_size": 100352,
        "hidden_size": 2048,
        "intermediate_size": 5632,
        "num_attention_heads": 32,
        "num_key_value_heads": 32,
        "num_hidden_layers": 24,
        "partial_rotary_factor": 0.25,
        "rope_theta": 10000,
        "layer_norm_eps": 1e-05,
        "use_qkv_bias": true,
        "quantization": { "group_size": 64, "bits": 4 }
    }"#;

    #[test]
    fn parses_stablelm_config() {
        let config = ModelConfig::from_json(STABLELM_JSON).unwrap();
        assert_eq!(config.model_type().unwrap(), ModelType::StableLm);
        assert_eq!(config.head_dim(), 64);
        assert_eq!(config.rotary_dim(), 16);
        assert_eq!(config.quantization, Some(QuantizationSpec::new(64, 4)));
        config.validate().unwrap();
    }

    #[test]
    fn llama_keys_and_defaults() {
        let json = r#"{
            "model_type": "llama",
            "vocab_size": 32000,
            "hidden_size": 4096,
            "intermediate_size": 11008,
            "num_attention_heads": 32,
            "num_key_value_heads": 8,
            "num_hidden_layers": 32,
            "rms_norm_eps": 1e-6
        }"#;
        let config = ModelConfig::from_json(json).unwrap();
        assert_eq!(config.model_type().unwrap(), ModelType::Llama);
        assert!((config.layer_norm_eps - 1e-6).abs() < 1e-12);
        assert_eq!(config.gqa_ratio(), 4);
        assert_eq!(config.rotary_dim(), config.head_dim());
        assert!(config.quantization.is_none());
    }

    #[test]
    fn kv_heads_default_to_attention_heads() {
        let config = ModelConfig {
            num_key_value_heads: None,
            ..Default::default()
        };
        assert_eq!(config.num_kv_heads(), config.num_attention_heads);
        assert_eq!(config.gqa_ratio(), 1);
    }

    #[test]
    fn head_dim_mismatch_is_rejected() {
        let config = ModelConfig {
            hidden_size: 100,
            num_attention_heads: 8,
            num_key_value_heads: Some(8),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EmberError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn uneven_kv_heads_are_rejected() {
        let config = ModelConfig {
            num_attention_heads: 32,
            num_key_value_heads: Some(5),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_model_type() {
        let config = ModelConfig {
            model_type: "mamba".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.model_type(),
            Err(EmberError::UnsupportedModel(_))
        ));
    }

    #[test]
    fn quantization_bits_are_checked() {
        assert!(QuantizationSpec::new(64, 3).validate().is_err());
        assert!(QuantizationSpec::new(0, 4).validate().is_err());
        let spec = QuantizationSpec::new(32, 4);
        spec.validate().unwrap();
        assert_eq!(spec.max_code(), 15);
        assert_eq!(spec.codes_per_word(), 8);
    }
}
