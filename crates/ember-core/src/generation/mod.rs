//! Autoregressive token generation.
//!
//! [`TokenIterator`] yields one sampled token per step: the first step runs
//! the whole prompt without a cache, every later step runs only the previous
//! token against the carried cache. [`generate`] drives the iterator with a
//! token budget and a stop token, reporting progress after every token.
//!
//! # Example
//!
//! ```ignore
//! use ember_core::generation::{generate, GenerationConfig, Sampler};
//!
//! let config = GenerationConfig::greedy(32);
//! let mut sampler = Sampler::new(&config, 0);
//! let tokens = generate(model.as_ref(), &prompt, &config, &mut sampler, eos, |tokens, progress| {
//!     println!("{} tokens ({:.0}%)", tokens.len(), progress * 100.0);
//! })?;
//! ```

mod sampler;

pub use sampler::{argmax, Sampler};

use crate::error::{EmberError, Result};
use crate::model::{KvCache, LanguageModel};
use candle_core::{DType, IndexOp, Tensor};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Parameters of one generation call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Upper bound on produced tokens.
    pub max_new_tokens: usize,
    /// Softmax temperature. Zero means greedy.
    pub temperature: f32,
    /// Sample instead of taking the argmax.
    pub do_sample: bool,
    /// Restrict sampling to the most likely tokens.
    #[serde(default)]
    pub top_k: Option<usize>,
}

impl GenerationConfig {
    /// Greedy decoding of at most `max_new_tokens` tokens.
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            temperature: 0.0,
            do_sample: false,
            top_k: None,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            temperature: 1.0,
            do_sample: true,
            top_k: None,
        }
    }
}

/// Yields sampled tokens, one forward pass per item.
///
/// The iterator never ends by itself; callers bound it.
pub struct TokenIterator<'a> {
    model: &'a dyn LanguageModel,
    sampler: &'a mut Sampler,
    /// Tokens fed to the next forward pass.
    pending: Vec<u32>,
    cache: Option<KvCache>,
    step: usize,
    failed: bool,
}

impl<'a> TokenIterator<'a> {
    /// Start generating after `prompt`.
    pub fn new(model: &'a dyn LanguageModel, prompt: &[u32], sampler: &'a mut Sampler) -> Self {
        Self {
            model,
            sampler,
            pending: prompt.to_vec(),
            cache: None,
            step: 0,
            failed: false,
        }
    }

    /// Number of positions held in the cache.
    pub fn cached_len(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.seq_len())
    }

    fn next_token(&mut self) -> Result<u32> {
        if self.pending.is_empty() {
            return Err(EmberError::ShapeMismatch("empty prompt".to_string()));
        }
        let ids = Tensor::new(self.pending.as_slice(), self.model.device())?.unsqueeze(0)?;
        let (logits, cache) = self.model.forward(&ids, self.cache.take())?;
        self.cache = Some(cache);

        // Logits of the last position: [vocab]
        let seq_len = logits.dim(1)?;
        let last: Vec<f32> = logits.i((0, seq_len - 1))?.to_dtype(DType::F32)?.to_vec1()?;

        let token = self.sampler.sample(&last, self.step)?;
        self.pending = vec![token];
        self.step += 1;
        Ok(token)
    }
}

impl Iterator for TokenIterator<'_> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = self.next_token();
        self.failed = result.is_err();
        Some(result)
    }
}

/// Generate up to `config.max_new_tokens` tokens after `prompt`.
///
/// Stops before appending the stop token. `on_token` runs once per produced
/// token, in order, with all tokens so far and `produced / max_new_tokens`.
/// Returns the produced tokens, prompt excluded.
pub fn generate<F>(
    model: &dyn LanguageModel,
    prompt: &[u32],
    config: &GenerationConfig,
    sampler: &mut Sampler,
    stop_token: Option<u32>,
    mut on_token: F,
) -> Result<Vec<u32>>
where
    F: FnMut(&[u32], f64),
{
    let start = Instant::now();
    let mut tokens = Vec::with_capacity(config.max_new_tokens);
    tracing::debug!(
        prompt_tokens = prompt.len(),
        max_new_tokens = config.max_new_tokens,
        greedy = sampler.is_greedy(),
        "generation started"
    );

    let mut iter = TokenIterator::new(model, prompt, sampler);
    while tokens.len() < config.max_new_tokens {
        let Some(token) = iter.next() else { break };
        let token = token?;
        if Some(token) == stop_token {
            tracing::debug!(token, "stop token sampled");
            break;
        }
        tokens.push(token);
        on_token(&tokens, tokens.len() as f64 / config.max_new_tokens as f64);
    }

    let elapsed = start.elapsed().as_secs_f64();
    tracing::debug!(
        produced = tokens.len(),
        tokens_per_second = tokens.len() as f64 / elapsed.max(f64::EPSILON),
        "generation finished"
    );
    Ok(tokens)
}
