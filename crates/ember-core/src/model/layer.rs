//! Transformer decoder block.
//!
//! Two residual layouts are supported:
//!
//! - **Parallel** (StableLM): attention and MLP read the same normalized
//!   input and both outputs are added to the residual stream at once.
//! - **Sequential** (Llama, Mistral): attention, then MLP, each with its own
//!   pre-norm and residual add.

use super::{Attention, GatedMlp, KvCacheEntry, Norm};
use crate::error::Result;
use candle_core::{DType, Device, Tensor};

/// How attention and MLP outputs join the residual stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residual {
    /// `x + attn(norm(x)) + mlp(norm(x))`
    Parallel,
    /// `h = x + attn(norm1(x)); h + mlp(norm2(h))`
    Sequential,
}

/// A single transformer decoder layer.
#[derive(Debug, Clone)]
pub struct DecoderBlock {
    /// Pre-attention layer norm.
    input_layernorm: Norm,
    /// Post-attention layer norm. Loaded for both layouts, read only by
    /// the sequential one.
    post_attention_layernorm: Norm,
    /// Self-attention.
    attention: Attention,
    /// MLP.
    mlp: GatedMlp,
    /// Residual layout.
    residual: Residual,
    /// Layer index (for debugging).
    layer_idx: usize,
}

impl DecoderBlock {
    /// Create a new decoder block.
    pub fn new(
        input_layernorm: Norm,
        post_attention_layernorm: Norm,
        attention: Attention,
        mlp: GatedMlp,
        residual: Residual,
        layer_idx: usize,
    ) -> Self {
        Self {
            input_layernorm,
            post_attention_layernorm,
            attention,
            mlp,
            residual,
            layer_idx,
        }
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [batch, seq_len, hidden_size]
    /// * `mask` - Optional additive causal mask
    /// * `cache` - This layer's cache entry from the previous step
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        cache: Option<KvCacheEntry>,
    ) -> Result<(Tensor, KvCacheEntry)> {
        match self.residual {
            Residual::Parallel => {
                let normed = self.input_layernorm.forward(x)?;
                let (attn_output, cache) = self.attention.forward(&normed, mask, cache)?;
                let mlp_output = self.mlp.forward(&normed)?;
                let output = ((attn_output + mlp_output)? + x)?;
                Ok((output, cache))
            }
            Residual::Sequential => {
                let normed = self.input_layernorm.forward(x)?;
                let (attn_output, cache) = self.attention.forward(&normed, mask, cache)?;
                let hidden_states = (x + attn_output)?;

                let normed = self.post_attention_layernorm.forward(&hidden_states)?;
                let mlp_output = self.mlp.forward(&normed)?;
                Ok(((hidden_states + mlp_output)?, cache))
            }
        }
    }

    /// Get the layer index.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Get the residual layout.
    pub fn residual(&self) -> Residual {
        self.residual
    }

    /// Get the attention module.
    pub fn attention(&self) -> &Attention {
        &self.attention
    }

    /// Get the MLP module.
    pub fn mlp(&self) -> &GatedMlp {
        &self.mlp
    }
}

/// Create an additive causal mask for `seq_len` new positions after
/// `offset` cached ones.
///
/// Shape [seq_len, offset + seq_len]; `mask[i][j]` is 0 when
/// `j <= offset + i` and `-inf` otherwise.
pub fn causal_mask(seq_len: usize, offset: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let total = offset + seq_len;
    let mask_data: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total).map(move |j| if j > offset + i { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();

    let mask = Tensor::from_vec(mask_data, (seq_len, total), device)?;
    Ok(mask.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DenseLinear, Linear, RmsNorm, RotaryEmbedding};
    use proptest::prelude::*;

    const HIDDEN: usize = 32;

    fn dense(out: usize, inp: usize) -> Linear {
        let w = Tensor::randn(0.0f32, 0.1, &[out, inp], &Device::Cpu).unwrap();
        Linear::Dense(DenseLinear::new(w, None).unwrap())
    }

    fn rms() -> Norm {
        Norm::Rms(RmsNorm::ones(HIDDEN, 1e-5, &Device::Cpu).unwrap())
    }

    fn block(residual: Residual) -> DecoderBlock {
        let rope = RotaryEmbedding::new(4, 10000.0, &Device::Cpu).unwrap();
        let attention = Attention::new(
            dense(HIDDEN, HIDDEN),
            dense(HIDDEN / 2, HIDDEN),
            dense(HIDDEN / 2, HIDDEN),
            dense(HIDDEN, HIDDEN),
            rope,
            HIDDEN,
            4,
            2,
        )
        .unwrap();
        let mlp = GatedMlp::new(dense(64, HIDDEN), dense(64, HIDDEN), dense(HIDDEN, 64));
        DecoderBlock::new(rms(), rms(), attention, mlp, residual, 0)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn block_forward_shapes() {
        for residual in [Residual::Parallel, Residual::Sequential] {
            let block = block(residual);
            let x = Tensor::randn(0.0f32, 1.0, &[1, 6, HIDDEN], &Device::Cpu).unwrap();
            let mask = causal_mask(6, 0, DType::F32, &Device::Cpu).unwrap();
            let (out, cache) = block.forward(&x, Some(&mask), None).unwrap();
            assert_eq!(out.dims(), &[1, 6, HIDDEN]);
            assert_eq!(cache.seq_len(), 6);
        }
    }

    #[test]
    fn parallel_block_matches_formula() {
        let block = block(Residual::Parallel);
        let x = Tensor::randn(0.0f32, 1.0, &[1, 3, HIDDEN], &Device::Cpu).unwrap();
        let mask = causal_mask(3, 0, DType::F32, &Device::Cpu).unwrap();

        let (out, _) = block.forward(&x, Some(&mask), None).unwrap();

        let h = block.input_layernorm.forward(&x).unwrap();
        let (a, _) = block.attention.forward(&h, Some(&mask), None).unwrap();
        let f = block.mlp.forward(&h).unwrap();
        let expected = ((a + f).unwrap() + &x).unwrap();
        assert!(max_abs_diff(&out, &expected) < 1e-6);
    }

    #[test]
    fn layouts_differ() {
        let parallel = block(Residual::Parallel);
        let sequential = DecoderBlock {
            residual: Residual::Sequential,
            ..parallel.clone()
        };
        let x = Tensor::randn(0.0f32, 1.0, &[1, 2, HIDDEN], &Device::Cpu).unwrap();
        let (a, _) = parallel.forward(&x, None, None).unwrap();
        let (b, _) = sequential.forward(&x, None, None).unwrap();
        assert!(max_abs_diff(&a, &b) > 0.0);
    }

    #[test]
    fn causal_mask_values() {
        let mask = causal_mask(4, 0, DType::F32, &Device::Cpu).unwrap();
        let vals: Vec<Vec<f32>> = mask.to_vec2().unwrap();

        // First row: only position 0 is valid
        assert_eq!(vals[0][0], 0.0);
        assert!(vals[0][1].is_infinite());

        // Last row: all positions valid
        assert!(vals[3].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn causal_mask_with_offset() {
        let mask = causal_mask(2, 3, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[2, 5]);
        let vals: Vec<Vec<f32>> = mask.to_vec2().unwrap();
        assert_eq!(&vals[0][..4], &[0.0, 0.0, 0.0, 0.0]);
        assert_eq!(vals[0][4], f32::NEG_INFINITY);
        assert!(vals[1].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn causal_mask_keeps_dtype() {
        let mask = causal_mask(3, 0, DType::BF16, &Device::Cpu).unwrap();
        assert_eq!(mask.dtype(), DType::BF16);
    }

    proptest! {
        /// Each row masks exactly the positions after it.
        #[test]
        fn causal_mask_structure(seq_len in 1usize..10, offset in 0usize..10) {
            let mask = causal_mask(seq_len, offset, DType::F32, &Device::Cpu).unwrap();
            let vals: Vec<Vec<f32>> = mask.to_vec2().unwrap();
            for (i, row) in vals.iter().enumerate() {
                let open = row.iter().filter(|v| **v == 0.0).count();
                prop_assert_eq!(open, offset + i + 1);
                prop_assert!(row[..open].iter().all(|v| *v == 0.0));
            }
        }
    }
}
