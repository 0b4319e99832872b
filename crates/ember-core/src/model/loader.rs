//! SafeTensors weight loading.
//!
//! A model directory holds one or more `*.safetensors` shards. All shards are
//! read into a single [`WeightTable`] keyed by dotted parameter name
//! (`model.layers.0.self_attn.q_proj.weight`). Model construction consumes
//! the table: every parameter is `take`n exactly once.
//!
//! # Example
//!
//! ```ignore
//! use ember_core::model::WeightTable;
//!
//! let mut weights = WeightTable::from_dir(dir, &Device::Cpu, DType::F32)?;
//! let embed = weights.take("model.embed_tokens.weight")?;
//! ```

use crate::error::{EmberError, Result};
use candle_core::safetensors::Load;
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Parameter name to tensor mapping read from checkpoint shards.
#[derive(Debug, Default)]
pub struct WeightTable {
    /// Loaded tensors indexed by name.
    tensors: HashMap<String, Tensor>,
}

impl WeightTable {
    /// Wrap an existing name to tensor map.
    pub fn new(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    /// Load every `.safetensors` shard in a directory.
    pub fn from_dir(dir: &Path, device: &Device, dtype: DType) -> Result<Self> {
        Self::from_dir_with_progress(dir, device, dtype, |_| {})
    }

    /// Load every shard, reporting the fraction of shards read after each one.
    pub fn from_dir_with_progress(
        dir: &Path,
        device: &Device,
        dtype: DType,
        mut progress: impl FnMut(f64),
    ) -> Result<Self> {
        let shards = Self::shard_paths(dir)?;
        tracing::debug!(dir = %dir.display(), shards = shards.len(), "loading weight shards");

        let mut tensors = HashMap::new();
        for (i, path) in shards.iter().enumerate() {
            tensors.extend(Self::load_safetensors_file(path, device, dtype)?);
            progress((i + 1) as f64 / shards.len() as f64);
        }

        tracing::info!(tensors = tensors.len(), "weights loaded");
        Ok(Self { tensors })
    }

    /// Create a weight table from a single file.
    pub fn from_file(path: &Path, device: &Device, dtype: DType) -> Result<Self> {
        let tensors = Self::load_safetensors_file(path, device, dtype)?;
        Ok(Self { tensors })
    }

    /// Sorted shard paths in a directory.
    fn shard_paths(dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(dir).map_err(|e| {
            EmberError::WeightLoadFailure(format!("cannot read {}: {}", dir.display(), e))
        })?;

        let mut shards = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().map_or(false, |e| e == "safetensors") {
                shards.push(path);
            }
        }

        // Sort for deterministic loading order
        shards.sort();

        if shards.is_empty() {
            return Err(EmberError::WeightLoadFailure(format!(
                "no .safetensors files found in {}",
                dir.display()
            )));
        }
        Ok(shards)
    }

    /// Load tensors from a single safetensors file.
    ///
    /// Floating point tensors are converted to `dtype`; integer tensors
    /// (packed quantized weights) keep their stored type.
    fn load_safetensors_file(
        path: &Path,
        device: &Device,
        dtype: DType,
    ) -> Result<HashMap<String, Tensor>> {
        let data = fs::read(path).map_err(|e| {
            EmberError::WeightLoadFailure(format!("cannot read {}: {}", path.display(), e))
        })?;
        let safetensors = SafeTensors::deserialize(&data).map_err(|e| {
            EmberError::WeightLoadFailure(format!(
                "failed to deserialize {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut tensors = HashMap::new();
        for (name, view) in safetensors.tensors() {
            let tensor = view.load(device)?;
            let tensor = if tensor.dtype().is_float() && tensor.dtype() != dtype {
                tensor.to_dtype(dtype)?
            } else {
                tensor
            };
            tensors.insert(name, tensor);
        }

        Ok(tensors)
    }

    /// Remove and return a tensor, failing if it is absent.
    pub fn take(&mut self, name: &str) -> Result<Tensor> {
        self.tensors
            .remove(name)
            .ok_or_else(|| EmberError::WeightLoadFailure(format!("tensor not found: {}", name)))
    }

    /// Remove and return a tensor if present.
    pub fn take_optional(&mut self, name: &str) -> Option<Tensor> {
        self.tensors.remove(name)
    }

    /// Get a tensor by name without consuming it.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Insert or replace a tensor.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Check if a tensor exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Get all remaining tensor names, sorted.
    pub fn tensor_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Get the number of remaining tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Check if no tensors remain.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Write every remaining tensor to one safetensors file.
    pub fn save(&self, path: &Path) -> Result<()> {
        candle_core::safetensors::save(&self.tensors, path)?;
        Ok(())
    }

    /// Drop the table, logging any parameters nothing consumed.
    pub fn finish(self) {
        if !self.tensors.is_empty() {
            tracing::warn!(
                unused = ?self.tensor_names(),
                "checkpoint tensors not consumed by the model"
            );
        }
    }
}
