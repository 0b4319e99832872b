//! Tokenizer integration for text-to-token and token-to-text conversion.
//!
//! Generation only needs three things from a tokenizer, captured by
//! [`TokenCodec`]. [`HfTokenizer`] provides them from a HuggingFace
//! `tokenizer.json`.

use crate::error::{EmberError, Result};
use std::path::Path;
use tokenizers::Tokenizer;

/// Text and token id conversion used by generation.
pub trait TokenCodec: Send + Sync {
    /// Encode text to token ids.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids to text.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Token that ends generation.
    fn stop_token_id(&self) -> Option<u32>;
}

/// Tokenizer backed by the HuggingFace tokenizers library.
#[derive(Clone)]
pub struct HfTokenizer {
    /// Underlying HuggingFace tokenizer.
    inner: Tokenizer,
    /// BOS token ID.
    bos_token_id: Option<u32>,
    /// EOS token ID.
    eos_token_id: Option<u32>,
    /// UNK token ID.
    unk_token_id: Option<u32>,
}

impl HfTokenizer {
    /// Wrap an already constructed tokenizer.
    pub fn new(inner: Tokenizer) -> Self {
        let bos_token_id = ["<s>", "<|begin_of_text|>", "<|endoftext|>"]
            .iter()
            .find_map(|t| inner.token_to_id(t));
        let eos_token_id = ["</s>", "<|end_of_text|>", "<|endoftext|>"]
            .iter()
            .find_map(|t| inner.token_to_id(t));
        let unk_token_id = inner.token_to_id("<unk>");

        Self {
            inner,
            bos_token_id,
            eos_token_id,
            unk_token_id,
        }
    }

    /// Load a tokenizer from a tokenizer.json file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = Tokenizer::from_file(path.as_ref())
            .map_err(|e| EmberError::Tokenizer(format!("failed to load tokenizer: {}", e)))?;
        Ok(Self::new(inner))
    }

    /// Load a tokenizer from a model directory.
    ///
    /// Looks for tokenizer.json in the directory.
    pub fn from_dir<P: AsRef<Path>>(model_dir: P) -> Result<Self> {
        let tokenizer_path = model_dir.as_ref().join("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(EmberError::Tokenizer(format!(
                "tokenizer.json not found in {}",
                model_dir.as_ref().display()
            )));
        }
        Self::from_file(tokenizer_path)
    }

    /// Get vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Get BOS token ID.
    pub fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    /// Get EOS token ID.
    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    /// String to token ID.
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}

impl TokenCodec for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| EmberError::Tokenizer(format!("failed to encode text: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| EmberError::Tokenizer(format!("failed to decode tokens: {}", e)))
    }

    /// EOS when the vocabulary has one, otherwise `<unk>`.
    fn stop_token_id(&self) -> Option<u32> {
        self.eos_token_id.or(self.unk_token_id)
    }
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("bos_token_id", &self.bos_token_id)
            .field("eos_token_id", &self.eos_token_id)
            .field("unk_token_id", &self.unk_token_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn word_level(words: &[&str]) -> Tokenizer {
        let vocab: serde_json::Map<String, serde_json::Value> = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.to_string(), serde_json::Value::from(i as u32)))
            .collect();
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
        });
        Tokenizer::from_str(&json.to_string()).unwrap()
    }

    #[test]
    fn stop_token_prefers_eos() {
        let tokenizer = HfTokenizer::new(word_level(&["<unk>", "<s>", "</s>", "hello"]));
        assert_eq!(tokenizer.bos_token_id(), Some(1));
        assert_eq!(tokenizer.stop_token_id(), Some(2));
    }

    #[test]
    fn stop_token_falls_back_to_unk() {
        let tokenizer = HfTokenizer::new(word_level(&["<unk>", "hello", "world"]));
        assert_eq!(tokenizer.eos_token_id(), None);
        assert_eq!(tokenizer.stop_token_id(), Some(0));
    }

    #[test]
    fn encode_maps_words_and_unknowns() {
        let tokenizer = HfTokenizer::new(word_level(&["<unk>", "hello", "world"]));
        let ids = tokenizer.encode("hello world again").unwrap();
        assert_eq!(ids, vec![1, 2, 0]);
    }

    #[test]
    fn missing_tokenizer_file() {
        let result = HfTokenizer::from_dir("/nonexistent/model");
        assert!(matches!(result, Err(EmberError::Tokenizer(_))));
    }
}
