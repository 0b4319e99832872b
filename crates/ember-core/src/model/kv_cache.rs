//! KV cache for transformer inference.
//!
//! Each layer keeps the keys and values of every position it has seen so
//! far, before grouped-query repetition. Caches are plain values threaded
//! through `forward` calls; nothing here is shared or global.

use crate::error::{EmberError, Result};
use candle_core::Tensor;

/// Keys and values cached for one layer.
#[derive(Debug, Clone)]
pub struct KvCacheEntry {
    /// Cached keys: [batch, num_kv_heads, seq_len, head_dim]
    keys: Tensor,
    /// Cached values: [batch, num_kv_heads, seq_len, head_dim]
    values: Tensor,
}

impl KvCacheEntry {
    /// Start an entry from the first keys and values.
    pub fn new(keys: Tensor, values: Tensor) -> Result<Self> {
        keys.dims4()?;
        if keys.dims() != values.dims() {
            return Err(EmberError::ShapeMismatch(format!(
                "keys {:?} and values {:?} differ",
                keys.dims(),
                values.dims()
            )));
        }
        Ok(Self { keys, values })
    }

    /// Append new positions along the sequence axis.
    pub fn extend(self, keys: &Tensor, values: &Tensor) -> Result<Self> {
        let keys = Tensor::cat(&[&self.keys, keys], 2)?;
        let values = Tensor::cat(&[&self.values, values], 2)?;
        Self::new(keys, values)
    }

    /// Number of cached positions.
    pub fn seq_len(&self) -> usize {
        self.keys.dims()[2]
    }

    /// Cached keys.
    pub fn keys(&self) -> &Tensor {
        &self.keys
    }

    /// Cached values.
    pub fn values(&self) -> &Tensor {
        &self.values
    }
}

/// Cache for all layers, ordered by layer index.
#[derive(Debug, Clone, Default)]
pub struct KvCache {
    entries: Vec<KvCacheEntry>,
}

impl KvCache {
    /// Build from per-layer entries.
    pub fn new(entries: Vec<KvCacheEntry>) -> Self {
        Self { entries }
    }

    /// Number of positions held (from the first layer).
    pub fn seq_len(&self) -> usize {
        self.entries.first().map(|e| e.seq_len()).unwrap_or(0)
    }

    /// Whether every layer holds the same number of positions.
    pub fn is_aligned(&self) -> bool {
        let len = self.seq_len();
        self.entries.iter().all(|e| e.seq_len() == len)
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no layer is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get the entry for a layer.
    pub fn entry(&self, layer_idx: usize) -> Option<&KvCacheEntry> {
        self.entries.get(layer_idx)
    }

    /// Take the per-layer entries.
    pub fn into_entries(self) -> Vec<KvCacheEntry> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn kv(seq: usize) -> (Tensor, Tensor) {
        let device = Device::Cpu;
        (
            Tensor::zeros((1, 2, seq, 8), DType::F32, &device).unwrap(),
            Tensor::ones((1, 2, seq, 8), DType::F32, &device).unwrap(),
        )
    }

    #[test]
    fn entry_grows_along_sequence() {
        let (k, v) = kv(4);
        let entry = KvCacheEntry::new(k, v).unwrap();
        assert_eq!(entry.seq_len(), 4);

        let (k, v) = kv(1);
        let entry = entry.extend(&k, &v).unwrap();
        assert_eq!(entry.seq_len(), 5);
        assert_eq!(entry.keys().dims(), &[1, 2, 5, 8]);
        assert_eq!(entry.values().dims(), &[1, 2, 5, 8]);
    }

    #[test]
    fn entry_rejects_mismatched_values() {
        let (k, _) = kv(4);
        let (_, v) = kv(3);
        assert!(KvCacheEntry::new(k, v).is_err());
    }

    #[test]
    fn cache_alignment() {
        let (k4, v4) = kv(4);
        let (k3, v3) = kv(3);
        let aligned = KvCache::new(vec![
            KvCacheEntry::new(k4.clone(), v4.clone()).unwrap(),
            KvCacheEntry::new(k4.clone(), v4.clone()).unwrap(),
        ]);
        assert!(aligned.is_aligned());
        assert_eq!(aligned.seq_len(), 4);
        assert_eq!(aligned.len(), 2);

        let ragged = KvCache::new(vec![
            KvCacheEntry::new(k4, v4).unwrap(),
            KvCacheEntry::new(k3, v3).unwrap(),
        ]);
        assert!(!ragged.is_aligned());
    }

    #[test]
    fn empty_cache() {
        let cache = KvCache::default();
        assert!(cache.is_empty());
        assert_eq!(cache.seq_len(), 0);
        assert!(cache.is_aligned());
        assert!(cache.entry(0).is_none());
    }
}
