//! Weight quantization.
//!
//! Linear layers may be stored as group-wise affine quantized weights
//! ([`QuantizedLinear`]). Which layers are quantized is decided by a
//! [`QuantizationPlan`]:
//!
//! - a layer whose output dimension is [`NON_QUANTIZABLE_OUT_DIM`] never is;
//! - the LM head (output dimension `vocab_size`) is only quantized when the
//!   checkpoint already carries `lm_head.scales`;
//! - every other linear layer is.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ember_core::quantization::QuantizationPlan;
//!
//! let plan = QuantizationPlan::new(spec, &weights, config.vocab_size);
//! if plan.should_quantize(out_features) {
//!     // expect `<prefix>.scales` and `<prefix>.biases`
//! }
//! ```

mod affine;

pub use affine::{pack_codes, unpack_codes, QuantizedLinear};

use crate::model::{QuantizationSpec, WeightTable};

/// Output dimension that is always kept in full precision.
pub const NON_QUANTIZABLE_OUT_DIM: usize = 8;

/// Tensor whose presence marks a checkpoint with a quantized LM head.
const HEAD_SCALES: &str = "lm_head.scales";

/// Decides which linear layers of a model are quantized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantizationPlan {
    spec: QuantizationSpec,
    vocab_size: usize,
    quantize_head: bool,
}

impl QuantizationPlan {
    /// Build a plan for a checkpoint.
    pub fn new(spec: QuantizationSpec, weights: &WeightTable, vocab_size: usize) -> Self {
        Self::with_head(spec, vocab_size, weights.contains(HEAD_SCALES))
    }

    /// Build a plan with an explicit choice for the LM head.
    pub fn with_head(spec: QuantizationSpec, vocab_size: usize, quantize_head: bool) -> Self {
        Self {
            spec,
            vocab_size,
            quantize_head,
        }
    }

    /// Whether a linear layer with `out_features` outputs is quantized.
    pub fn should_quantize(&self, out_features: usize) -> bool {
        if out_features == NON_QUANTIZABLE_OUT_DIM {
            return false;
        }
        self.quantize_head || out_features != self.vocab_size
    }

    /// Group size and bit width.
    pub fn spec(&self) -> QuantizationSpec {
        self.spec
    }

    /// Whether the LM head is quantized.
    pub fn quantizes_head(&self) -> bool {
        self.quantize_head
    }
}
