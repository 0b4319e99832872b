//! A loaded model together with its tokenizer.

use candle_core::{DType, Device};
use ember_core::{
    generation::{generate, GenerationConfig, Sampler},
    model::{create_model, HfTokenizer, LanguageModel, ModelConfig, QuantizationSpec, TokenCodec, WeightTable},
    Result,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// How a checkpoint directory is turned into a model.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Working dtype for float weights and activations.
    pub dtype: DType,
    /// Quantize eligible layers at load time, overriding the checkpoint.
    pub quantization: Option<QuantizationSpec>,
    /// Device the weights are placed on.
    pub device: Device,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            dtype: DType::F32,
            quantization: None,
            device: Device::Cpu,
        }
    }
}

/// Result of one generation call.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Decoded completion, prompt excluded.
    pub text: String,
    /// Produced token ids.
    pub tokens: Vec<u32>,
    /// Produced tokens divided by wall-clock seconds.
    pub tokens_per_second: f64,
}

/// A model ready to generate.
pub struct ModelSession {
    model: Arc<dyn LanguageModel>,
    tokenizer: Arc<dyn TokenCodec>,
}

impl ModelSession {
    /// Pair a model with a tokenizer.
    pub fn new(model: Arc<dyn LanguageModel>, tokenizer: Arc<dyn TokenCodec>) -> Self {
        Self { model, tokenizer }
    }

    /// Load `config.json`, `tokenizer.json` and every weight shard in `dir`.
    ///
    /// `progress` receives the loaded fraction in `[0, 1]`.
    pub fn from_dir(
        dir: &Path,
        options: &LoadOptions,
        mut progress: impl FnMut(f64),
    ) -> Result<Self> {
        let config = ModelConfig::from_file(&dir.join("config.json"))?;
        tracing::info!(
            dir = %dir.display(),
            model_type = %config.model_type,
            layers = config.num_hidden_layers,
            quantized = config.quantization.is_some(),
            "model config read"
        );
        let tokenizer = HfTokenizer::from_dir(dir)?;

        // Shards make up most of the load time; model construction the rest
        let weights = WeightTable::from_dir_with_progress(dir, &options.device, options.dtype, |p| {
            progress(p * 0.9)
        })?;
        let model = create_model(&config, weights, &options.device, options.quantization)?;
        progress(1.0);

        Ok(Self::new(model, Arc::new(tokenizer)))
    }

    /// Generate a completion for `prompt`, blocking the calling thread.
    ///
    /// `on_text` receives the decoded completion so far and the fraction of
    /// the token budget used, once per produced token.
    pub fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        seed: u64,
        mut on_text: impl FnMut(&str, f64),
    ) -> Result<GenerationOutput> {
        let prompt_ids = self.tokenizer.encode(prompt)?;
        let mut sampler = Sampler::new(config, seed);
        let start = Instant::now();

        let mut decode_error = None;
        let tokens = generate(
            self.model.as_ref(),
            &prompt_ids,
            config,
            &mut sampler,
            self.tokenizer.stop_token_id(),
            |tokens, progress| match self.tokenizer.decode(tokens) {
                Ok(text) => on_text(&text, progress),
                Err(e) => {
                    decode_error.get_or_insert(e);
                }
            },
        )?;
        if let Some(e) = decode_error {
            return Err(e);
        }

        let elapsed = start.elapsed().as_secs_f64();
        let text = self.tokenizer.decode(&tokens)?;
        let tokens_per_second = tokens.len() as f64 / elapsed.max(f64::EPSILON);
        tracing::info!(
            prompt_tokens = prompt_ids.len(),
            produced = tokens.len(),
            tokens_per_second,
            "completion generated"
        );

        Ok(GenerationOutput {
            text,
            tokens,
            tokens_per_second,
        })
    }

    /// The language model.
    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    /// The tokenizer.
    pub fn tokenizer(&self) -> &Arc<dyn TokenCodec> {
        &self.tokenizer
    }
}

impl std::fmt::Debug for ModelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSession")
            .field("vocab_size", &self.model.vocab_size())
            .field("num_layers", &self.model.num_layers())
            .finish()
    }
}
