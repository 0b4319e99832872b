//! SiLU-gated feed-forward block.
//!
//! # Formula
//!
//! `GatedMlp(x) = down_proj(silu(gate_proj(x)) * up_proj(x))`
//!
//! Where `silu(x) = x * sigmoid(x)`. All three projections are bias-free.
//!
//! # Reference
//!
//! [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)

use super::{Linear, WeightTable};
use crate::error::Result;
use crate::quantization::QuantizationPlan;
use candle_core::Tensor;
use candle_nn::ops::silu;

/// Gated MLP block.
#[derive(Debug, Clone)]
pub struct GatedMlp {
    /// Gate projection: hidden -> intermediate
    gate_proj: Linear,
    /// Up projection: hidden -> intermediate
    up_proj: Linear,
    /// Down projection: intermediate -> hidden
    down_proj: Linear,
}

impl GatedMlp {
    /// Create from the three projections.
    pub fn new(gate_proj: Linear, up_proj: Linear, down_proj: Linear) -> Self {
        Self {
            gate_proj,
            up_proj,
            down_proj,
        }
    }

    /// Load `<prefix>.{gate,up,down}_proj`.
    pub fn load(
        weights: &mut WeightTable,
        prefix: &str,
        plan: Option<&QuantizationPlan>,
    ) -> Result<Self> {
        Ok(Self {
            gate_proj: Linear::load(weights, &format!("{}.gate_proj", prefix), false, plan)?,
            up_proj: Linear::load(weights, &format!("{}.up_proj", prefix), false, plan)?,
            down_proj: Linear::load(weights, &format!("{}.down_proj", prefix), false, plan)?,
        })
    }

    /// Forward pass over `[..., hidden_size]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x)?;
        let up = self.up_proj.forward(x)?;
        let activated = (silu(&gate)? * up)?;
        self.down_proj.forward(&activated)
    }

    /// Get the intermediate size.
    pub fn intermediate_size(&self) -> usize {
        self.gate_proj.out_features()
    }

    /// Number of quantized projections.
    pub fn quantized_count(&self) -> usize {
        [&self.gate_proj, &self.up_proj, &self.down_proj]
            .iter()
            .filter(|l| l.is_quantized())
            .count()
    }
}
