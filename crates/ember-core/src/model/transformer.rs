//! Causal language model and the per-family factory.
//!
//! A checkpoint's `model_type` selects an [`Architecture`], which fixes the
//! residual layout, the normalization kind and the parameter names. The
//! factory consumes a [`WeightTable`] into a [`CausalLanguageModel`] and hands
//! it out as `Arc<dyn LanguageModel>`.

use super::{
    causal_mask, Attention, DecoderBlock, DenseLinear, GatedMlp, KvCache, KvCacheEntry, Linear,
    ModelConfig, ModelType, Norm, NormKind, QuantizationSpec, Residual, RotaryEmbedding,
    WeightTable,
};
use crate::error::{EmberError, Result};
use crate::quantization::{QuantizationPlan, QuantizedLinear};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Module};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;

/// A decoder-only language model.
pub trait LanguageModel: Send + Sync {
    /// Run `ids` [batch, seq_len] through the model.
    ///
    /// `cache` holds keys and values of earlier positions (`None` for a
    /// fresh prompt). Returns logits [batch, seq_len, vocab_size] and the
    /// extended cache.
    fn forward(&self, ids: &Tensor, cache: Option<KvCache>) -> Result<(Tensor, KvCache)>;

    /// Vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Number of decoder blocks.
    fn num_layers(&self) -> usize;

    /// Device the weights live on.
    fn device(&self) -> &Device;
}

/// Structure and parameter naming of a model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Architecture {
    /// Residual layout of every block.
    pub residual: Residual,
    /// Normalization used by blocks and the final norm.
    pub norm: NormKind,
    /// Token embedding table.
    pub embed_tokens: &'static str,
    /// Prefix of the numbered decoder blocks.
    pub layers: &'static str,
    /// Final normalization.
    pub final_norm: &'static str,
    /// Output projection.
    pub lm_head: &'static str,
}

impl Architecture {
    /// StableLM: parallel residual with LayerNorm.
    pub const STABLELM: Self = Self {
        residual: Residual::Parallel,
        norm: NormKind::Layer,
        embed_tokens: "model.embed_tokens",
        layers: "model.layers",
        final_norm: "model.norm",
        lm_head: "lm_head",
    };

    /// Llama and Mistral: sequential residual with RMSNorm.
    pub const LLAMA: Self = Self {
        residual: Residual::Sequential,
        norm: NormKind::Rms,
        embed_tokens: "model.embed_tokens",
        layers: "model.layers",
        final_norm: "model.norm",
        lm_head: "lm_head",
    };

    /// Look up the architecture of a model family.
    pub fn for_model(model_type: ModelType) -> Result<Self> {
        match model_type {
            ModelType::StableLm => Ok(Self::STABLELM),
            ModelType::Llama | ModelType::Mistral => Ok(Self::LLAMA),
            ModelType::Phi | ModelType::Gemma => {
                Err(EmberError::UnsupportedModel(model_type.to_string()))
            }
        }
    }

    fn layer_prefix(&self, layer_idx: usize) -> String {
        format!("{}.{}", self.layers, layer_idx)
    }
}

/// Embedding, decoder blocks and final norm.
#[derive(Debug, Clone)]
pub struct DecoderStack {
    embed_tokens: Embedding,
    blocks: Vec<DecoderBlock>,
    norm: Norm,
}

impl DecoderStack {
    /// Create a stack from its parts.
    pub fn new(embed_tokens: Embedding, blocks: Vec<DecoderBlock>, norm: Norm) -> Self {
        Self {
            embed_tokens,
            blocks,
            norm,
        }
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `ids` - Token ids [batch, seq_len]
    /// * `mask` - Optional additive causal mask
    /// * `cache` - One entry per block, or `None` for a fresh prompt
    ///
    /// # Returns
    ///
    /// Hidden states [batch, seq_len, hidden_size] and the new cache.
    pub fn forward(
        &self,
        ids: &Tensor,
        mask: Option<&Tensor>,
        cache: Option<KvCache>,
    ) -> Result<(Tensor, KvCache)> {
        let entries: Vec<Option<KvCacheEntry>> = match cache {
            Some(cache) => {
                if cache.len() != self.blocks.len() {
                    return Err(EmberError::ShapeMismatch(format!(
                        "cache has {} layers, model has {}",
                        cache.len(),
                        self.blocks.len()
                    )));
                }
                cache.into_entries().into_iter().map(Some).collect()
            }
            None => (0..self.blocks.len()).map(|_| None).collect(),
        };

        let mut hidden_states = self.embed_tokens.forward(ids)?;
        let mut new_entries = Vec::with_capacity(self.blocks.len());
        for (block, entry) in self.blocks.iter().zip(entries) {
            let (output, entry) = block.forward(&hidden_states, mask, entry)?;
            hidden_states = output;
            new_entries.push(entry);
        }

        let hidden_states = self.norm.forward(&hidden_states)?;
        Ok((hidden_states, KvCache::new(new_entries)))
    }

    /// Number of decoder blocks.
    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    /// The decoder blocks.
    pub fn blocks(&self) -> &[DecoderBlock] {
        &self.blocks
    }
}

/// Decoder stack followed by the LM head.
#[derive(Debug, Clone)]
pub struct CausalLanguageModel {
    stack: DecoderStack,
    lm_head: Linear,
    vocab_size: usize,
    dtype: DType,
    device: Device,
}

impl CausalLanguageModel {
    /// Build a model by consuming its parameters from `weights`.
    pub fn load(
        config: &ModelConfig,
        architecture: Architecture,
        weights: &mut WeightTable,
        plan: Option<&QuantizationPlan>,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let eps = config.layer_norm_eps;
        let dtype = working_dtype(weights, &architecture);

        let embeddings = load_embeddings(weights, architecture.embed_tokens, plan, dtype)?;
        let rope = RotaryEmbedding::new(config.rotary_dim(), config.rope_theta, device)?;

        let mut blocks = Vec::with_capacity(config.num_hidden_layers);
        for layer_idx in 0..config.num_hidden_layers {
            let prefix = architecture.layer_prefix(layer_idx);
            let input_layernorm = Norm::load(
                weights,
                &format!("{}.input_layernorm", prefix),
                architecture.norm,
                eps,
            )?;
            let post_attention_layernorm = Norm::load(
                weights,
                &format!("{}.post_attention_layernorm", prefix),
                architecture.norm,
                eps,
            )?;
            let attention = Attention::load(
                weights,
                &format!("{}.self_attn", prefix),
                rope.clone(),
                config.hidden_size,
                config.num_attention_heads,
                config.num_kv_heads(),
                config.use_qkv_bias,
                plan,
            )?;
            let mlp = GatedMlp::load(weights, &format!("{}.mlp", prefix), plan)?;
            blocks.push(DecoderBlock::new(
                input_layernorm,
                post_attention_layernorm,
                attention,
                mlp,
                architecture.residual,
                layer_idx,
            ));
        }

        let norm = Norm::load(weights, architecture.final_norm, architecture.norm, eps)?;

        let head_weight = format!("{}.weight", architecture.lm_head);
        let lm_head = if !weights.contains(&head_weight) && config.tie_word_embeddings {
            tracing::debug!("lm head tied to token embeddings");
            Linear::Dense(DenseLinear::new(embeddings.clone(), None)?)
        } else {
            Linear::load(weights, architecture.lm_head, false, plan)?
        };

        if lm_head.out_features() != config.vocab_size {
            return Err(EmberError::ShapeMismatch(format!(
                "lm head produces {} logits, vocab_size is {}",
                lm_head.out_features(),
                config.vocab_size
            )));
        }

        let embed_tokens = Embedding::new(embeddings, config.hidden_size);
        Ok(Self {
            stack: DecoderStack::new(embed_tokens, blocks, norm),
            lm_head,
            vocab_size: config.vocab_size,
            dtype,
            device: device.clone(),
        })
    }

    /// Number of quantized linear layers, LM head included.
    pub fn quantized_count(&self) -> usize {
        let blocks: usize = self
            .stack
            .blocks()
            .iter()
            .map(|b| b.attention().quantized_count() + b.mlp().quantized_count())
            .sum();
        blocks + usize::from(self.lm_head.is_quantized())
    }

    /// Working dtype of activations.
    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

impl LanguageModel for CausalLanguageModel {
    fn forward(&self, ids: &Tensor, cache: Option<KvCache>) -> Result<(Tensor, KvCache)> {
        let (_, seq_len) = ids.dims2()?;
        let offset = cache.as_ref().map_or(0, |c| c.seq_len());

        // A single new position may attend to everything cached
        let mask = if seq_len > 1 {
            Some(causal_mask(seq_len, offset, self.dtype, &self.device)?)
        } else {
            None
        };

        let (hidden_states, cache) = self.stack.forward(ids, mask.as_ref(), cache)?;
        let logits = self.lm_head.forward(&hidden_states)?;
        Ok((logits, cache))
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn num_layers(&self) -> usize {
        self.stack.num_layers()
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Build the model a checkpoint declares.
///
/// `quantization` overrides the checkpoint's own quantization parameters;
/// when either is present, eligible float layers are quantized while the
/// weight table is consumed.
pub fn create_model(
    config: &ModelConfig,
    mut weights: WeightTable,
    device: &Device,
    quantization: Option<QuantizationSpec>,
) -> Result<Arc<dyn LanguageModel>> {
    let model_type = config.model_type()?;
    let architecture = Architecture::for_model(model_type)?;

    let plan = quantization
        .or(config.quantization)
        .map(|spec| QuantizationPlan::new(spec, &weights, config.vocab_size));

    let model = CausalLanguageModel::load(config, architecture, &mut weights, plan.as_ref(), device)?;
    weights.finish();

    tracing::info!(
        model_type = %model_type,
        layers = model.num_layers(),
        quantized_layers = model.quantized_count(),
        dtype = ?model.dtype(),
        "model built"
    );
    Ok(Arc::new(model))
}

/// Float dtype of the checkpoint, read from the final norm.
fn working_dtype(weights: &WeightTable, architecture: &Architecture) -> DType {
    weights
        .get(&format!("{}.weight", architecture.final_norm))
        .map(|t| t.dtype())
        .filter(|d| d.is_float())
        .unwrap_or(DType::F32)
}

/// Token embedding table, dequantized when the checkpoint stores it packed.
fn load_embeddings(
    weights: &mut WeightTable,
    prefix: &str,
    plan: Option<&QuantizationPlan>,
    dtype: DType,
) -> Result<Tensor> {
    let weight = weights.take(&format!("{}.weight", prefix))?;
    let Some(scales) = weights.take_optional(&format!("{}.scales", prefix)) else {
        return Ok(weight);
    };

    let plan = plan.ok_or_else(|| {
        EmberError::QuantizationMismatch(format!(
            "{} carries scales but the model declares no quantization",
            prefix
        ))
    })?;
    let biases = weights.take(&format!("{}.biases", prefix)).map_err(|_| {
        EmberError::QuantizationMismatch(format!("{} has scales but no biases", prefix))
    })?;
    let table = QuantizedLinear::from_packed(&weight, scales, biases, None, plan.spec())?;
    Ok(table.dequantize()?.to_dtype(dtype)?)
}

/// Seeded random weights for every parameter a config needs.
///
/// Norms are identity (unit weight, zero bias); everything else is uniform in
/// `[-0.1, 0.1)`. Useful for tests and benchmarks without a checkpoint.
pub fn random_weights(config: &ModelConfig, seed: u64, device: &Device) -> Result<WeightTable> {
    config.validate()?;
    let architecture = Architecture::for_model(config.model_type()?)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tensors = HashMap::new();

    let hidden = config.hidden_size;
    let kv_dim = config.num_kv_heads() * config.head_dim();
    let intermediate = config.intermediate_size;

    let mut uniform = |name: String, shape: &[usize]| -> Result<()> {
        let data: Vec<f32> = (0..shape.iter().product::<usize>())
            .map(|_| rng.gen_range(-0.1f32..0.1))
            .collect();
        tensors.insert(name, Tensor::from_vec(data, shape, device)?);
        Ok(())
    };

    uniform(
        format!("{}.weight", architecture.embed_tokens),
        &[config.vocab_size, hidden],
    )?;
    for layer_idx in 0..config.num_hidden_layers {
        let attn = format!("{}.self_attn", architecture.layer_prefix(layer_idx));
        let mlp = format!("{}.mlp", architecture.layer_prefix(layer_idx));
        uniform(format!("{}.q_proj.weight", attn), &[hidden, hidden])?;
        uniform(format!("{}.k_proj.weight", attn), &[kv_dim, hidden])?;
        uniform(format!("{}.v_proj.weight", attn), &[kv_dim, hidden])?;
        uniform(format!("{}.o_proj.weight", attn), &[hidden, hidden])?;
        if config.use_qkv_bias {
            uniform(format!("{}.q_proj.bias", attn), &[hidden])?;
            uniform(format!("{}.k_proj.bias", attn), &[kv_dim])?;
            uniform(format!("{}.v_proj.bias", attn), &[kv_dim])?;
        }
        uniform(format!("{}.gate_proj.weight", mlp), &[intermediate, hidden])?;
        uniform(format!("{}.up_proj.weight", mlp), &[intermediate, hidden])?;
        uniform(format!("{}.down_proj.weight", mlp), &[hidden, intermediate])?;
    }
    if !config.tie_word_embeddings {
        uniform(
            format!("{}.weight", architecture.lm_head),
            &[config.vocab_size, hidden],
        )?;
    }

    let mut norms: Vec<String> = (0..config.num_hidden_layers)
        .flat_map(|i| {
            let prefix = architecture.layer_prefix(i);
            [
                format!("{}.input_layernorm", prefix),
                format!("{}.post_attention_layernorm", prefix),
            ]
        })
        .collect();
    norms.push(architecture.final_norm.to_string());
    for norm in norms {
        tensors.insert(
            format!("{}.weight", norm),
            Tensor::ones(hidden, DType::F32, device)?,
        );
        if architecture.norm == NormKind::Layer {
            tensors.insert(
                format!("{}.bias", norm),
                Tensor::zeros(hidden, DType::F32, device)?,
            );
        }
    }

    Ok(WeightTable::new(tensors))
}
