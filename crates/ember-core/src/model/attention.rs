//! Grouped-query self-attention.
//!
//! Query heads are split into groups that share one key/value head. Keys and
//! values are cached before repetition, so the cache holds `num_kv_heads`
//! heads and is expanded to `num_heads` on every step.

use super::{KvCacheEntry, Linear, RotaryEmbedding, WeightTable};
use crate::error::{EmberError, Result};
use crate::quantization::QuantizationPlan;
use candle_core::{DType, Tensor, D};

/// Self-attention module for transformer layers.
#[derive(Debug, Clone)]
pub struct Attention {
    /// Query projection: [num_heads * head_dim, hidden_size]
    q_proj: Linear,
    /// Key projection: [num_kv_heads * head_dim, hidden_size]
    k_proj: Linear,
    /// Value projection: [num_kv_heads * head_dim, hidden_size]
    v_proj: Linear,
    /// Output projection: [hidden_size, num_heads * head_dim]
    o_proj: Linear,
    /// Rotary embedding shared by queries and keys.
    rope: RotaryEmbedding,
    /// Number of attention heads.
    num_heads: usize,
    /// Number of key-value heads (for GQA).
    num_kv_heads: usize,
    /// Head dimension.
    head_dim: usize,
}

impl Attention {
    /// Create attention from its projections.
    ///
    /// Fails with [`EmberError::ConfigurationInvalid`] when the heads do not
    /// tile `hidden_size` or the key/value heads do not divide the query heads.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        q_proj: Linear,
        k_proj: Linear,
        v_proj: Linear,
        o_proj: Linear,
        rope: RotaryEmbedding,
        hidden_size: usize,
        num_heads: usize,
        num_kv_heads: usize,
    ) -> Result<Self> {
        if num_heads == 0 || num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
            return Err(EmberError::ConfigurationInvalid(format!(
                "{} query heads cannot be grouped over {} key/value heads",
                num_heads, num_kv_heads
            )));
        }
        let head_dim = hidden_size / num_heads;
        if head_dim * num_heads != hidden_size {
            return Err(EmberError::ConfigurationInvalid(format!(
                "hidden_size {} is not divisible by {} heads",
                hidden_size, num_heads
            )));
        }
        if q_proj.out_features() != hidden_size
            || k_proj.out_features() != num_kv_heads * head_dim
            || v_proj.out_features() != num_kv_heads * head_dim
        {
            return Err(EmberError::ShapeMismatch(format!(
                "projection outputs q={} k={} v={} do not match {} heads x {} and {} kv heads",
                q_proj.out_features(),
                k_proj.out_features(),
                v_proj.out_features(),
                num_heads,
                head_dim,
                num_kv_heads
            )));
        }

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rope,
            num_heads,
            num_kv_heads,
            head_dim,
        })
    }

    /// Load `<prefix>.{q,k,v,o}_proj`.
    ///
    /// `qkv_bias` makes the q/k/v biases required. The output projection takes
    /// its bias only when the checkpoint carries `o_proj.bias`.
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        weights: &mut WeightTable,
        prefix: &str,
        rope: RotaryEmbedding,
        hidden_size: usize,
        num_heads: usize,
        num_kv_heads: usize,
        qkv_bias: bool,
        plan: Option<&QuantizationPlan>,
    ) -> Result<Self> {
        let q_proj = Linear::load(weights, &format!("{}.q_proj", prefix), qkv_bias, plan)?;
        let k_proj = Linear::load(weights, &format!("{}.k_proj", prefix), qkv_bias, plan)?;
        let v_proj = Linear::load(weights, &format!("{}.v_proj", prefix), qkv_bias, plan)?;
        let o_prefix = format!("{}.o_proj", prefix);
        let o_bias = weights.contains(&format!("{}.bias", o_prefix));
        let o_proj = Linear::load(weights, &o_prefix, o_bias, plan)?;
        Self::new(
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rope,
            hidden_size,
            num_heads,
            num_kv_heads,
        )
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [batch, seq_len, hidden_size]
    /// * `mask` - Additive mask broadcastable to [batch, heads, seq_len, total_len]
    /// * `cache` - Keys and values from earlier positions
    ///
    /// # Returns
    ///
    /// Output [batch, seq_len, hidden_size] and the extended cache entry.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        cache: Option<KvCacheEntry>,
    ) -> Result<(Tensor, KvCacheEntry)> {
        let (batch, seq_len, _) = x.dims3()?;

        let q = self.split_heads(&self.q_proj.forward(x)?, self.num_heads)?;
        let k = self.split_heads(&self.k_proj.forward(x)?, self.num_kv_heads)?;
        let v = self.split_heads(&self.v_proj.forward(x)?, self.num_kv_heads)?;

        let offset = cache.as_ref().map_or(0, |c| c.seq_len());
        let q = self.rope.apply(&q, offset)?;
        let k = self.rope.apply(&k, offset)?;

        let entry = match cache {
            Some(cache) => cache.extend(&k, &v)?,
            None => KvCacheEntry::new(k, v)?,
        };

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(entry.keys(), n_rep)?;
        let v = repeat_kv(entry.values(), n_rep)?;

        let attn_output = self.scaled_dot_product(&q, &k, &v, mask)?;

        // [batch, heads, seq, head_dim] -> [batch, seq, heads * head_dim]
        let attn_output = attn_output
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        let output = self.o_proj.forward(&attn_output)?;

        Ok((output, entry))
    }

    /// [batch, seq, heads * head_dim] -> [batch, heads, seq, head_dim]
    fn split_heads(&self, x: &Tensor, heads: usize) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        Ok(x
            .reshape((batch, seq_len, heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Softmax attention with scores in f32, weights cast back to the value dtype.
    fn scaled_dot_product(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let scale = 1.0 / (self.head_dim as f64).sqrt();

        let q = q.to_dtype(DType::F32)?;
        let k = k.to_dtype(DType::F32)?;
        let scores = (q.matmul(&k.t()?)? * scale)?;

        let scores = match mask {
            Some(mask) => scores.broadcast_add(&mask.to_dtype(DType::F32)?)?,
            None => scores,
        };

        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(v.dtype())?;
        Ok(weights.matmul(v)?)
    }

    /// Get the number of heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Get the number of KV heads.
    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Number of quantized projections.
    pub fn quantized_count(&self) -> usize {
        [&self.q_proj, &self.k_proj, &self.v_proj, &self.o_proj]
            .iter()
            .filter(|l| l.is_quantized())
            .count()
    }
}

/// Repeat each KV head `n_rep` times, contiguously.
///
/// Output head `j` is input head `j / n_rep`.
pub(crate) fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }

    let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;

    // [batch, kv_heads, seq, head_dim] -> [batch, kv_heads, n_rep, seq, head_dim]
    let x = x
        .unsqueeze(2)?
        .broadcast_as((batch, num_kv_heads, n_rep, seq_len, head_dim))?;
    // -> [batch, kv_heads * n_rep, seq, head_dim]
    Ok(x.reshape((batch, num_kv_heads * n_rep, seq_len, head_dim))?)
}
