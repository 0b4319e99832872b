//! Rotary Position Embeddings (RoPE).
//!
//! RoPE encodes position information by rotating query and key vectors
//! in the complex plane. Only the first `rotary_dim` channels of each head
//! are rotated; the rest pass through unchanged (partial rotary).
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

use crate::error::{EmberError, Result};
use candle_core::{Device, Tensor};

/// Rotary Position Embedding implementation.
///
/// Uses the non-interleaved ("rotate half") channel layout.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Inverse frequencies: [1, rotary_dim / 2]
    inv_freq: Tensor,
    /// Number of rotated channels per head.
    rotary_dim: usize,
}

impl RotaryEmbedding {
    /// Create a new rotary embedding.
    ///
    /// # Arguments
    ///
    /// * `rotary_dim` - Channels per head that are rotated (must be even)
    /// * `theta` - Base frequency (default 10000.0)
    /// * `device` - Device for tensors
    pub fn new(rotary_dim: usize, theta: f64, device: &Device) -> Result<Self> {
        if rotary_dim % 2 != 0 {
            return Err(EmberError::ConfigurationInvalid(format!(
                "rotary dimension {} must be even",
                rotary_dim
            )));
        }

        // Compute inverse frequencies: 1 / (theta^(2i/d)) for i in [0, d/2)
        let half_dim = rotary_dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / rotary_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        Ok(Self {
            inv_freq,
            rotary_dim,
        })
    }

    /// Cosine and sine tables for `seq_len` positions starting at `offset`.
    ///
    /// Both are [seq_len, rotary_dim / 2] in f32.
    fn cos_sin(&self, offset: usize, seq_len: usize) -> Result<(Tensor, Tensor)> {
        let positions: Vec<f32> = (offset..offset + seq_len).map(|p| p as f32).collect();
        let positions = Tensor::from_vec(positions, (seq_len, 1), self.inv_freq.device())?;

        // freqs = positions * inv_freq -> [seq_len, half_dim]
        let freqs = positions.matmul(&self.inv_freq)?;
        Ok((freqs.cos()?, freqs.sin()?))
    }

    /// Apply rotary embeddings to a query or key tensor.
    ///
    /// # Arguments
    ///
    /// * `x` - Tensor [batch, heads, seq_len, head_dim]
    /// * `offset` - Number of positions already held in the cache
    pub fn apply(&self, x: &Tensor, offset: usize) -> Result<Tensor> {
        let (_, _, seq_len, head_dim) = x.dims4()?;
        if self.rotary_dim == 0 {
            return Ok(x.clone());
        }
        if self.rotary_dim > head_dim {
            return Err(EmberError::ShapeMismatch(format!(
                "rotary dimension {} exceeds head dimension {}",
                self.rotary_dim, head_dim
            )));
        }

        let (cos, sin) = self.cos_sin(offset, seq_len)?;
        // [1, 1, seq_len, half_dim] for broadcasting
        let cos = cos.to_dtype(x.dtype())?.unsqueeze(0)?.unsqueeze(0)?;
        let sin = sin.to_dtype(x.dtype())?.unsqueeze(0)?.unsqueeze(0)?;

        let half_dim = self.rotary_dim / 2;
        let x1 = x.narrow(3, 0, half_dim)?;
        let x2 = x.narrow(3, half_dim, half_dim)?;

        // [x1, x2] -> [x1*cos - x2*sin, x2*cos + x1*sin]
        let out1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
        let out2 = (x2.broadcast_mul(&cos)? + x1.broadcast_mul(&sin)?)?;

        let mut parts = vec![out1, out2];
        if self.rotary_dim < head_dim {
            parts.push(x.narrow(3, self.rotary_dim, head_dim - self.rotary_dim)?);
        }
        Ok(Tensor::cat(&parts, 3)?)
    }

    /// Get the number of rotated channels.
    pub fn rotary_dim(&self) -> usize {
        self.rotary_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

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
    fn rope_apply_shape() {
        let rope = RotaryEmbedding::new(64, 10000.0, &Device::Cpu).unwrap();
        assert_eq!(rope.rotary_dim(), 64);

        // [batch=1, heads=8, seq_len=16, head_dim=64]
        let x = Tensor::randn(0.0f32, 1.0, &[1, 8, 16, 64], &Device::Cpu).unwrap();
        let rotated = rope.apply(&x, 0).unwrap();
        assert_eq!(rotated.dims(), x.dims());
    }

    #[test]
    fn rope_position_zero_is_identity() {
        let rope = RotaryEmbedding::new(16, 10000.0, &Device::Cpu).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, &[1, 2, 1, 16], &Device::Cpu).unwrap();
        let rotated = rope.apply(&x, 0).unwrap();
        assert!(max_abs_diff(&x, &rotated) < 1e-6);
    }

    #[test]
    fn rope_partial_passes_trailing_channels() {
        // head_dim 16, rotate only the first 4 channels
        let rope = RotaryEmbedding::new(4, 10000.0, &Device::Cpu).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, &[1, 2, 5, 16], &Device::Cpu).unwrap();
        let rotated = rope.apply(&x, 7).unwrap();

        let tail_in: Vec<f32> = x.narrow(3, 4, 12).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let tail_out: Vec<f32> = rotated
            .narrow(3, 4, 12)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(tail_in, tail_out);

        let head_diff = max_abs_diff(
            &x.narrow(3, 0, 4).unwrap(),
            &rotated.narrow(3, 0, 4).unwrap(),
        );
        assert!(head_diff > 0.0);
    }

    #[test]
    fn rope_preserves_pair_norms() {
        let rope = RotaryEmbedding::new(8, 10000.0, &Device::Cpu).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, &[1, 1, 3, 8], &Device::Cpu).unwrap();
        let rotated = rope.apply(&x, 42).unwrap();

        let norm = |t: &Tensor| -> Vec<f32> {
            let a = t.narrow(3, 0, 4).unwrap().sqr().unwrap();
            let b = t.narrow(3, 4, 4).unwrap().sqr().unwrap();
            (a + b).unwrap().flatten_all().unwrap().to_vec1().unwrap()
        };
        for (before, after) in norm(&x).iter().zip(norm(&rotated)) {
            assert!((before - after).abs() < 1e-4);
        }
    }

    #[test]
    fn rope_odd_dimension_rejected() {
        assert!(RotaryEmbedding::new(7, 10000.0, &Device::Cpu).is_err());
    }

    #[test]
    fn rope_zero_dimension_is_noop() {
        let rope = RotaryEmbedding::new(0, 10000.0, &Device::Cpu).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, &[1, 2, 3, 8], &Device::Cpu).unwrap();
        let rotated = rope.apply(&x, 5).unwrap();
        assert_eq!(max_abs_diff(&x, &rotated), 0.0);
    }

    proptest! {
        /// Rotating a suffix at offset `split` matches rotating the full sequence.
        #[test]
        fn rope_offset_is_additive(
            seq_len in 2usize..12,
            split_frac in 0.1f64..0.9,
            base_offset in 0usize..64,
        ) {
            let split = ((seq_len as f64 * split_frac) as usize).clamp(1, seq_len - 1);
            let rope = RotaryEmbedding::new(8, 10000.0, &Device::Cpu).unwrap();
            let x = Tensor::randn(0.0f32, 1.0, &[1, 2, seq_len, 12], &Device::Cpu).unwrap();

            let full = rope.apply(&x, base_offset).unwrap();
            let head = rope.apply(&x.narrow(2, 0, split).unwrap(), base_offset).unwrap();
            let tail = rope
                .apply(&x.narrow(2, split, seq_len - split).unwrap(), base_offset + split)
                .unwrap();
            let pieced = Tensor::cat(&[head, tail], 2).unwrap();

            prop_assert!(max_abs_diff(&full, &pieced) < 1e-5);
        }
    }
}
