//! Linear projections, dense or quantized.
//!
//! Weights follow the checkpoint layout `[out_features, in_features]`, so a
//! projection is `x @ W^T + b`.

use super::WeightTable;
use crate::error::{EmberError, Result};
use crate::quantization::{QuantizationPlan, QuantizedLinear};
use candle_core::{Tensor, D};

/// `x @ weight^T + bias` over the last dimension of `x`.
pub fn project(x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let in_features = x.dim(D::Minus1)?;
    let rows = x.elem_count() / in_features.max(1);
    let out_features = weight.dims2()?.0;

    // Reshape to 2D for matmul
    let x_2d = x.reshape((rows, in_features))?;
    let out = x_2d.matmul(&weight.t()?)?;

    let dims = x.dims();
    let mut out_shape = dims[..dims.len() - 1].to_vec();
    out_shape.push(out_features);
    let out = out.reshape(out_shape)?;

    match bias {
        Some(bias) => Ok(out.broadcast_add(&bias.to_dtype(out.dtype())?)?),
        None => Ok(out),
    }
}

/// Full-precision linear layer.
#[derive(Debug, Clone)]
pub struct DenseLinear {
    /// Weight: [out_features, in_features]
    weight: Tensor,
    /// Optional bias: [out_features]
    bias: Option<Tensor>,
}

impl DenseLinear {
    /// Create from a weight and optional bias.
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (out_features, _) = weight.dims2()?;
        if let Some(bias) = &bias {
            if bias.dims1()? != out_features {
                return Err(EmberError::ShapeMismatch(format!(
                    "bias has {} elements, weight has {} rows",
                    bias.dims1()?,
                    out_features
                )));
            }
        }
        Ok(Self { weight, bias })
    }

    /// Forward pass.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        project(x, &self.weight, self.bias.as_ref())
    }

    /// Get the weight.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

/// A linear layer that is either dense or group-wise quantized.
#[derive(Debug, Clone)]
pub enum Linear {
    /// Full precision.
    Dense(DenseLinear),
    /// Affine quantized.
    Quantized(QuantizedLinear),
}

impl Linear {
    /// Consume `<prefix>.weight` (and `.bias`, `.scales`, `.biases`) from the
    /// weight table.
    ///
    /// With a plan, a layer the plan selects is either read as a packed
    /// checkpoint tensor (when `.scales` is present) or quantized from its
    /// float weight. Scales on a layer the plan excludes, or an integer
    /// weight without scales, fail with [`EmberError::QuantizationMismatch`].
    pub fn load(
        weights: &mut WeightTable,
        prefix: &str,
        with_bias: bool,
        plan: Option<&QuantizationPlan>,
    ) -> Result<Self> {
        let weight = weights.take(&format!("{}.weight", prefix))?;
        let bias = if with_bias {
            Some(weights.take(&format!("{}.bias", prefix))?)
        } else {
            None
        };
        let scales = weights.take_optional(&format!("{}.scales", prefix));
        let biases = weights.take_optional(&format!("{}.biases", prefix));
        let out_features = weight.dims2()?.0;

        match (scales, plan) {
            (Some(scales), Some(plan)) => {
                if !plan.should_quantize(out_features) {
                    return Err(EmberError::QuantizationMismatch(format!(
                        "{} carries scales but layers with {} outputs are kept in full precision",
                        prefix, out_features
                    )));
                }
                let biases = biases.ok_or_else(|| {
                    EmberError::QuantizationMismatch(format!("{} has scales but no biases", prefix))
                })?;
                let linear = QuantizedLinear::from_packed(&weight, scales, biases, bias, plan.spec())?;
                Ok(Self::Quantized(linear))
            }
            (Some(_), None) => Err(EmberError::QuantizationMismatch(format!(
                "{} carries scales but the model declares no quantization",
                prefix
            ))),
            (None, _) if !weight.dtype().is_float() => {
                Err(EmberError::QuantizationMismatch(format!(
                    "{} has a {:?} weight without scales",
                    prefix,
                    weight.dtype()
                )))
            }
            (None, Some(plan)) if plan.should_quantize(out_features) => {
                let linear = QuantizedLinear::quantize(&weight, bias, plan.spec())?;
                Ok(Self::Quantized(linear))
            }
            (None, _) => Ok(Self::Dense(DenseLinear::new(weight, bias)?)),
        }
    }

    /// Forward pass.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Dense(linear) => linear.forward(x),
            Self::Quantized(linear) => linear.forward(x),
        }
    }

    /// Output dimension.
    pub fn out_features(&self) -> usize {
        match self {
            Self::Dense(linear) => linear.weight.dims()[0],
            Self::Quantized(linear) => linear.out_features(),
        }
    }

    /// Whether the weights are quantized.
    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized(_))
    }
}
