//! Group-wise affine quantization.
//!
//! Each row of a `[out_features, in_features]` weight is split into groups of
//! `group_size` consecutive values. Every group stores one scale and one bias
//! and `bits`-bit codes such that:
//!
//! `w ≈ scale * q + bias`, with `q ∈ [0, 2^bits - 1]`
//!
//! Checkpoints store the codes packed into `u32` words, lowest bits first.
//! In memory the codes are kept unpacked as `u8`. The forward pass never
//! materializes the float weight: it multiplies activations by the raw codes
//! group by group and applies scales and biases to the per-group partial sums.

use crate::error::{EmberError, Result};
use crate::model::QuantizationSpec;
use candle_core::{DType, Tensor, D};

/// A linear layer with group-wise affine quantized weights.
#[derive(Debug, Clone)]
pub struct QuantizedLinear {
    /// Codes: [out_features, in_features] as u8.
    codes: Tensor,
    /// Per-group scales: [out_features, in_features / group_size] as f32.
    scales: Tensor,
    /// Per-group zero points: [out_features, in_features / group_size] as f32.
    biases: Tensor,
    /// Optional additive bias: [out_features].
    bias: Option<Tensor>,
    /// Quantization parameters.
    spec: QuantizationSpec,
    in_features: usize,
    out_features: usize,
}

impl QuantizedLinear {
    /// Quantize a full-precision weight `[out_features, in_features]`.
    pub fn quantize(weight: &Tensor, bias: Option<Tensor>, spec: QuantizationSpec) -> Result<Self> {
        spec.validate()?;
        let (out_features, in_features) = weight.dims2()?;
        let groups = Self::group_count(in_features, &spec)?;

        let w = weight
            .to_dtype(DType::F32)?
            .reshape((out_features, groups, spec.group_size))?;
        let w_max = w.max_keepdim(2)?;
        let w_min = w.min_keepdim(2)?;

        let n_bins = spec.max_code() as f64;
        // Constant groups would divide by zero
        let scales = ((w_max - &w_min)? / n_bins)?.maximum(1e-8)?;

        let codes = w
            .broadcast_sub(&w_min)?
            .broadcast_div(&scales)?
            .round()?
            .clamp(0.0, n_bins)?
            .to_dtype(DType::U8)?
            .reshape((out_features, in_features))?;

        Ok(Self {
            codes,
            scales: scales.squeeze(2)?,
            biases: w_min.squeeze(2)?,
            bias,
            spec,
            in_features,
            out_features,
        })
    }

    /// Build from a checkpoint's packed `u32` weight, scales and biases.
    pub fn from_packed(
        packed: &Tensor,
        scales: Tensor,
        biases: Tensor,
        bias: Option<Tensor>,
        spec: QuantizationSpec,
    ) -> Result<Self> {
        spec.validate()?;
        if packed.dtype() != DType::U32 {
            return Err(EmberError::QuantizationMismatch(format!(
                "packed weight must be u32, found {:?}",
                packed.dtype()
            )));
        }
        let (out_features, words_per_row) = packed.dims2()?;
        let in_features = words_per_row * spec.codes_per_word();
        let groups = Self::group_count(in_features, &spec)?;

        for (name, t) in [("scales", &scales), ("biases", &biases)] {
            if t.dims() != &[out_features, groups] {
                return Err(EmberError::QuantizationMismatch(format!(
                    "{} shape {:?} does not match {} bits / group {} for weight [{}, {}]",
                    name,
                    t.dims(),
                    spec.bits,
                    spec.group_size,
                    out_features,
                    in_features
                )));
            }
        }

        let words: Vec<u32> = packed.flatten_all()?.to_vec1()?;
        let codes = Tensor::from_vec(
            unpack_codes(&words, spec.bits)?,
            (out_features, in_features),
            packed.device(),
        )?;

        Ok(Self {
            codes,
            scales: scales.to_dtype(DType::F32)?,
            biases: biases.to_dtype(DType::F32)?,
            bias,
            spec,
            in_features,
            out_features,
        })
    }

    fn group_count(in_features: usize, spec: &QuantizationSpec) -> Result<usize> {
        if in_features % spec.group_size != 0 {
            return Err(EmberError::QuantizationMismatch(format!(
                "in_features {} is not a multiple of group size {}",
                in_features, spec.group_size
            )));
        }
        Ok(in_features / spec.group_size)
    }

    /// Reconstruct the f32 weight `[out_features, in_features]`.
    pub fn dequantize(&self) -> Result<Tensor> {
        let groups = self.in_features / self.spec.group_size;
        let w = self
            .codes
            .to_dtype(DType::F32)?
            .reshape((self.out_features, groups, self.spec.group_size))?
            .broadcast_mul(&self.scales.unsqueeze(2)?)?
            .broadcast_add(&self.biases.unsqueeze(2)?)?;
        Ok(w.reshape((self.out_features, self.in_features))?)
    }

    /// Codes packed into `u32` words, as a checkpoint stores them.
    pub fn packed_weight(&self) -> Result<Tensor> {
        let codes: Vec<u8> = self.codes.flatten_all()?.to_vec1()?;
        let words = pack_codes(&codes, self.spec.bits)?;
        let words_per_row = self.in_features / self.spec.codes_per_word();
        Ok(Tensor::from_vec(
            words,
            (self.out_features, words_per_row),
            self.codes.device(),
        )?)
    }

    /// Forward pass: `x @ dequantize(W)^T + b`.
    ///
    /// With `W[o, g, s] = scale[o, g] * q[o, g, s] + bias[o, g]`, each group
    /// contributes `scale * (x_g · q_g) + bias * sum(x_g)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let groups = self.in_features / self.spec.group_size;
        let in_features = x.dim(D::Minus1)?;
        if in_features != self.in_features {
            return Err(EmberError::ShapeMismatch(format!(
                "input has {} features, layer expects {}",
                in_features, self.in_features
            )));
        }
        let rows = x.elem_count() / in_features;

        // [groups, rows, group_size]
        let x_groups = x
            .reshape((rows, groups, self.spec.group_size))?
            .transpose(0, 1)?
            .contiguous()?;
        // [groups, group_size, out_features]
        let codes = self
            .codes
            .to_dtype(dtype)?
            .reshape((self.out_features, groups, self.spec.group_size))?
            .permute((1, 2, 0))?
            .contiguous()?;

        // [groups, 1, out_features]
        let scales = self.scales.to_dtype(dtype)?.t()?.unsqueeze(1)?;
        let biases = self.biases.to_dtype(dtype)?.t()?.unsqueeze(1)?;

        let dot = x_groups.matmul(&codes)?.broadcast_mul(&scales)?;
        let offset = x_groups.sum_keepdim(2)?.broadcast_mul(&biases)?;
        let mut y = (dot + offset)?.sum(0)?;

        if let Some(bias) = &self.bias {
            y = y.broadcast_add(&bias.to_dtype(dtype)?)?;
        }

        let mut out_dims = x.dims().to_vec();
        out_dims.pop();
        out_dims.push(self.out_features);
        Ok(y.reshape(out_dims)?)
    }

    /// Per-group scales.
    pub fn scales(&self) -> &Tensor {
        &self.scales
    }

    /// Per-group zero points.
    pub fn biases(&self) -> &Tensor {
        &self.biases
    }

    /// Quantization parameters.
    pub fn spec(&self) -> QuantizationSpec {
        self.spec
    }

    /// Output dimension.
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Input dimension.
    pub fn in_features(&self) -> usize {
        self.in_features
    }
}

/// Split `u32` words into `bits`-wide codes, lowest bits first.
pub fn unpack_codes(words: &[u32], bits: usize) -> Result<Vec<u8>> {
    check_bits(bits)?;
    let per_word = 32 / bits;
    let mask = (1u32 << bits) - 1;
    let mut codes = Vec::with_capacity(words.len() * per_word);
    for &word in words {
        for j in 0..per_word {
            codes.push(((word >> (j * bits)) & mask) as u8);
        }
    }
    Ok(codes)
}

/// Pack `bits`-wide codes into `u32` words, lowest bits first.
pub fn pack_codes(codes: &[u8], bits: usize) -> Result<Vec<u32>> {
    check_bits(bits)?;
    let per_word = 32 / bits;
    let max_code = (1u32 << bits) - 1;
    if let Some(&code) = codes.iter().find(|&&c| c as u32 > max_code) {
        return Err(EmberError::QuantizationMismatch(format!(
            "code {} does not fit in {} bits",
            code, bits
        )));
    }
    Ok(codes
        .chunks(per_word)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u32, |word, (j, &code)| word | ((code as u32) << (j * bits)))
        })
        .collect())
}

fn check_bits(bits: usize) -> Result<()> {
    if !matches!(bits, 2 | 4 | 8) {
        return Err(EmberError::ConfigurationInvalid(format!(
            "unsupported quantization bit width {}",
            bits
        )));
    }
    Ok(())
}
