//! Layer normalization variants.
//!
//! - [`LayerNorm`]: mean/variance normalization with weight and bias,
//!   always computed in f32 and cast back to the input dtype.
//! - [`RmsNorm`]: root-mean-square normalization without centering.
//!
//! # Formulas
//!
//! `LayerNorm(x) = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias`
//!
//! `RMSNorm(x) = x * weight / sqrt(mean(x^2) + eps)`
//!
//! # Reference
//!
//! [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)

use super::WeightTable;
use crate::error::{EmberError, Result};
use candle_core::{DType, Device, Tensor, D};

/// Which normalization a model family uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    /// LayerNorm with weight and bias.
    Layer,
    /// RMSNorm with weight only.
    Rms,
}

/// Layer normalization promoted to f32.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    /// Scale, stored in f32.
    weight: Tensor,
    /// Shift, stored in f32.
    bias: Option<Tensor>,
    /// Small constant for numerical stability.
    eps: f64,
}

impl LayerNorm {
    /// Create a new LayerNorm with given weight and optional bias.
    pub fn new(weight: Tensor, bias: Option<Tensor>, eps: f64) -> Result<Self> {
        let hidden_size = weight.dims1()?;
        if let Some(bias) = &bias {
            if bias.dims1()? != hidden_size {
                return Err(EmberError::ShapeMismatch(format!(
                    "layer norm bias has {} elements, weight has {}",
                    bias.dims1()?,
                    hidden_size
                )));
            }
        }
        Ok(Self {
            weight: weight.to_dtype(DType::F32)?,
            bias: bias.map(|b| b.to_dtype(DType::F32)).transpose()?,
            eps,
        })
    }

    /// Create a LayerNorm with unit weight and zero bias (for testing).
    pub fn ones(hidden_size: usize, eps: f64, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(hidden_size, DType::F32, device)?;
        let bias = Tensor::zeros(hidden_size, DType::F32, device)?;
        Self::new(weight, Some(bias), eps)
    }

    /// Forward pass over the last dimension.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;

        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normalized = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;

        let output = normalized.broadcast_mul(&self.weight)?;
        let output = match &self.bias {
            Some(bias) => output.broadcast_add(bias)?,
            None => output,
        };
        Ok(output.to_dtype(dtype)?)
    }
}

/// RMS Layer Normalization.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter.
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
}

impl RmsNorm {
    /// Create a new RMSNorm layer with given weight.
    pub fn new(weight: Tensor, eps: f64) -> Result<Self> {
        weight.dims1()?;
        Ok(Self { weight, eps })
    }

    /// Create a new RMSNorm layer with ones (for testing).
    pub fn ones(hidden_size: usize, eps: f64, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(hidden_size, DType::F32, device)?;
        Ok(Self { weight, eps })
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., hidden_size]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;

        // 1/sqrt(mean + eps)
        let rsqrt = (mean_sq + self.eps)?.sqrt()?.recip()?;

        let normalized = x.broadcast_mul(&rsqrt)?;
        Ok(normalized.broadcast_mul(&self.weight.to_dtype(x.dtype())?)?)
    }
}

/// A normalization layer of either kind.
#[derive(Debug, Clone)]
pub enum Norm {
    /// LayerNorm.
    Layer(LayerNorm),
    /// RMSNorm.
    Rms(RmsNorm),
}

impl Norm {
    /// Build from `<prefix>.weight` (and `<prefix>.bias` for LayerNorm).
    pub fn load(weights: &mut WeightTable, prefix: &str, kind: NormKind, eps: f64) -> Result<Self> {
        let weight = weights.take(&format!("{}.weight", prefix))?;
        match kind {
            NormKind::Layer => {
                let bias = weights.take_optional(&format!("{}.bias", prefix));
                Ok(Self::Layer(LayerNorm::new(weight, bias, eps)?))
            }
            NormKind::Rms => Ok(Self::Rms(RmsNorm::new(weight, eps)?)),
        }
    }

    /// Forward pass.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Layer(norm) => norm.forward(x),
            Self::Rms(norm) => norm.forward(x),
        }
    }
}
