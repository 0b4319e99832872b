//! Model lifecycle and the async generation surface.
//!
//! A [`Runner`] owns at most one loaded [`ModelSession`] and publishes its
//! [`ModelState`] through a `tokio::sync::watch` channel. Loading and
//! generation run on the blocking pool so async callers are never stalled by
//! tensor work.

use crate::session::{LoadOptions, ModelSession};
use anyhow::{Context, Result};
use async_trait::async_trait;
use candle_core::{DType, Device};
use ember_core::{generation::GenerationConfig, model::QuantizationSpec, EmberError};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Where a runner is in its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelState {
    /// No model has been loaded.
    Uninitialized,
    /// Weights are being read. Progress is in `[0, 1]`.
    Loading {
        /// Fraction loaded.
        progress: f64,
    },
    /// A model is loaded and idle.
    Ready {
        /// Throughput of the last generation, if any ran.
        tokens_per_second: Option<f64>,
    },
    /// A completion is being produced.
    Generating {
        /// Fraction of the token budget used.
        progress: f64,
    },
    /// The last load or generation failed.
    Failed(String),
}

impl ModelState {
    /// Whether a load is in flight.
    pub fn is_loading(&self) -> bool {
        matches!(self, ModelState::Loading { .. })
    }
}

/// What happened to a load request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The model was loaded and is ready.
    Loaded,
    /// Another load was already in flight; this request was dropped.
    Discarded,
}

/// Configuration for a [`Runner`].
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Seed of the first generation; later generations advance it by one.
    pub seed: u64,
    /// Generation parameters used when the caller has none.
    pub generation: GenerationConfig,
    /// How checkpoints are loaded.
    pub load: LoadOptions,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            generation: GenerationConfig::default(),
            load: LoadOptions::default(),
        }
    }
}

/// Builder for creating a Runner.
#[derive(Debug, Default)]
pub struct RunnerBuilder {
    config: RunnerConfig,
}

impl RunnerBuilder {
    /// Create a new runner builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sampling seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Set the default generation parameters.
    pub fn generation(mut self, config: GenerationConfig) -> Self {
        self.config.generation = config;
        self
    }

    /// Set the working dtype.
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.config.load.dtype = dtype;
        self
    }

    /// Quantize eligible layers at load time.
    pub fn quantization(mut self, spec: QuantizationSpec) -> Self {
        self.config.load.quantization = Some(spec);
        self
    }

    /// Set the device weights are placed on.
    pub fn device(mut self, device: Device) -> Self {
        self.config.load.device = device;
        self
    }

    /// Build the runner.
    pub fn build(self) -> Runner {
        Runner::new(self.config)
    }
}

/// Published state and the load-in-flight flag.
///
/// A load owns the lifecycle while the flag is set: generation still runs on
/// the previous model but does not publish its states until the load ends.
struct Lifecycle {
    state: watch::Sender<ModelState>,
    loading: AtomicBool,
}

impl Lifecycle {
    fn new() -> Self {
        let (state, _) = watch::channel(ModelState::Uninitialized);
        Self {
            state,
            loading: AtomicBool::new(false),
        }
    }

    /// Claim the lifecycle for a load. False when one is already in flight.
    fn try_begin_load(&self) -> bool {
        if self
            .loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.state.send_replace(ModelState::Loading { progress: 0.0 });
        true
    }

    fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    /// Publish a generation state unless a load owns the lifecycle.
    fn publish_generation(&self, next: ModelState) {
        self.state.send_if_modified(|state| {
            if self.is_loading() {
                return false;
            }
            *state = next;
            true
        });
    }
}

/// Releases the load flag when a load ends, including when its future is dropped.
struct LoadGuard<'a>(&'a Lifecycle);

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.0.loading.store(false, Ordering::Release);
    }
}

/// Owns the loaded model and drives loading and generation.
pub struct Runner {
    config: RunnerConfig,
    session: RwLock<Option<Arc<ModelSession>>>,
    lifecycle: Arc<Lifecycle>,
    generations: AtomicU64,
}

impl Runner {
    /// Create a runner with no model loaded.
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            session: RwLock::new(None),
            lifecycle: Arc::new(Lifecycle::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Create a new runner builder.
    pub fn builder() -> RunnerBuilder {
        RunnerBuilder::new()
    }

    /// Get runner configuration.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<ModelState> {
        self.lifecycle.state.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> ModelState {
        self.lifecycle.state.borrow().clone()
    }

    /// Whether a model is loaded.
    pub fn is_loaded(&self) -> bool {
        self.session.read().is_some()
    }

    /// Whether a load is in flight.
    pub fn is_loading(&self) -> bool {
        self.lifecycle.is_loading()
    }

    /// Load a checkpoint directory, replacing any loaded model on success.
    ///
    /// Returns [`LoadOutcome::Discarded`] without doing anything when another
    /// load is in flight.
    pub async fn load(&self, dir: impl Into<PathBuf>) -> Result<LoadOutcome> {
        let dir = dir.into();

        if !self.lifecycle.try_begin_load() {
            tracing::debug!(dir = %dir.display(), "load already in flight, request discarded");
            return Ok(LoadOutcome::Discarded);
        }
        let _guard = LoadGuard(&self.lifecycle);
        tracing::info!(dir = %dir.display(), "loading model");

        let lifecycle = self.lifecycle.clone();
        let options = self.config.load.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            ModelSession::from_dir(&dir, &options, |progress| {
                lifecycle.state.send_replace(ModelState::Loading { progress });
            })
        })
        .await
        .context("load task panicked");

        match loaded {
            Ok(Ok(session)) => {
                self.install(session);
                Ok(LoadOutcome::Loaded)
            }
            Ok(Err(e)) => {
                self.fail(e.to_string());
                Err(e.into())
            }
            Err(e) => {
                self.fail(e.to_string());
                Err(e)
            }
        }
    }

    /// Make an already built session the loaded model.
    pub fn install(&self, session: ModelSession) {
        *self.session.write() = Some(Arc::new(session));
        self.lifecycle.state.send_replace(ModelState::Ready {
            tokens_per_second: None,
        });
        tracing::info!("model ready");
    }

    /// Generate a completion for `prompt`.
    ///
    /// `on_text` receives the decoded completion so far and the fraction of
    /// the token budget used, once per produced token and in order. Fails
    /// with [`EmberError::ModelNotLoaded`] without changing state when no
    /// model is loaded. While a load is in flight the previous model answers
    /// and the published state keeps tracking the load.
    pub async fn generate<F>(
        &self,
        config: GenerationConfig,
        prompt: &str,
        mut on_text: F,
    ) -> Result<String>
    where
        F: FnMut(&str, f64) + Send + 'static,
    {
        let session = self
            .session
            .read()
            .clone()
            .ok_or(EmberError::ModelNotLoaded)?;

        let seed = self
            .config
            .seed
            .wrapping_add(self.generations.fetch_add(1, Ordering::Relaxed));
        self.lifecycle
            .publish_generation(ModelState::Generating { progress: 0.0 });

        let lifecycle = self.lifecycle.clone();
        let prompt = prompt.to_string();
        let output = tokio::task::spawn_blocking(move || {
            session.generate(&prompt, &config, seed, |text, progress| {
                lifecycle.publish_generation(ModelState::Generating { progress });
                on_text(text, progress);
            })
        })
        .await
        .context("generation task panicked");

        match output {
            Ok(Ok(output)) => {
                self.lifecycle.publish_generation(ModelState::Ready {
                    tokens_per_second: Some(output.tokens_per_second),
                });
                Ok(output.text)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "generation failed");
                self.lifecycle
                    .publish_generation(ModelState::Failed(e.to_string()));
                Err(e.into())
            }
            Err(e) => {
                tracing::warn!(error = %e, "generation failed");
                self.lifecycle
                    .publish_generation(ModelState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    fn fail(&self, message: String) {
        tracing::warn!(error = %message, "load failed");
        self.lifecycle.state.send_replace(ModelState::Failed(message));
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("state", &*self.lifecycle.state.borrow())
            .finish()
    }
}

/// Anything that can turn a prompt into a completion.
#[async_trait]
pub trait RunnableLlm: Send + Sync {
    /// Parameters used when the caller has no preference.
    fn default_generation_config(&self) -> GenerationConfig;

    /// Generate a completion, passing the text so far to `callback` after
    /// every token.
    async fn generate(
        &self,
        config: GenerationConfig,
        prompt: &str,
        callback: Option<Box<dyn for<'a> FnMut(&'a str) + Send>>,
    ) -> Result<String>;
}

#[async_trait]
impl RunnableLlm for Runner {
    fn default_generation_config(&self) -> GenerationConfig {
        self.config.generation
    }

    async fn generate(
        &self,
        config: GenerationConfig,
        prompt: &str,
        callback: Option<Box<dyn for<'a> FnMut(&'a str) + Send>>,
    ) -> Result<String> {
        let mut callback = callback;
        Runner::generate(self, config, prompt, move |text, _| {
            if let Some(callback) = callback.as_mut() {
                callback(text);
            }
        })
        .await
    }
}

/// Tidy raw decoded text for display.
///
/// Drops a leading `"<s> "` and turns escaped `\n` sequences into newlines.
pub fn clean_completion(text: &str) -> String {
    text.strip_prefix("<s> ")
        .unwrap_or(text)
        .replace("\\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use ember_core::model::{
        create_model, random_weights, KvCache, LanguageModel, ModelConfig, TokenCodec,
    };
    use std::fs;
    use std::sync::Mutex;

    /// Maps bytes to ids and ids to `t<id>` words.
    struct ByteCodec;

    impl TokenCodec for ByteCodec {
        fn encode(&self, text: &str) -> ember_core::Result<Vec<u32>> {
            Ok(text.bytes().map(|b| b as u32 % 48).collect())
        }

        fn decode(&self, ids: &[u32]) -> ember_core::Result<String> {
            Ok(ids.iter().map(|id| format!("t{id}")).collect::<Vec<_>>().join(" "))
        }

        fn stop_token_id(&self) -> Option<u32> {
            None
        }
    }

    /// Produces NaN logits on every step.
    struct NanModel {
        device: Device,
    }

    impl LanguageModel for NanModel {
        fn forward(&self, ids: &Tensor, cache: Option<KvCache>) -> ember_core::Result<(Tensor, KvCache)> {
            let logits = Tensor::full(f32::NAN, (1, ids.dim(1)?, 8), &self.device)?;
            Ok((logits, cache.unwrap_or_default()))
        }

        fn vocab_size(&self) -> usize {
            8
        }

        fn num_layers(&self) -> usize {
            0
        }

        fn device(&self) -> &Device {
            &self.device
        }
    }

    fn toy_config() -> ModelConfig {
        ModelConfig {
            model_type: "stablelm_epoch".to_string(),
            vocab_size: 48,
            hidden_size: 16,
            intermediate_size: 32,
            num_attention_heads: 4,
            num_key_value_heads: Some(4),
            num_hidden_layers: 2,
            partial_rotary_factor: 0.25,
            rope_theta: 10_000.0,
            layer_norm_eps: 1e-5,
            use_qkv_bias: true,
            tie_word_embeddings: false,
            quantization: None,
        }
    }

    fn toy_session() -> ModelSession {
        let config = toy_config();
        let weights = random_weights(&config, 7, &Device::Cpu).unwrap();
        let model = create_model(&config, weights, &Device::Cpu, None).unwrap();
        ModelSession::new(model, Arc::new(ByteCodec))
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ember_runner_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Checkpoint directory with config, word-level tokenizer and weights.
    fn write_checkpoint(dir: &std::path::Path) {
        let config = toy_config();
        fs::write(dir.join("config.json"), serde_json::to_string(&config).unwrap()).unwrap();

        let mut vocab = serde_json::Map::new();
        vocab.insert("<unk>".to_string(), 0.into());
        for i in 1..config.vocab_size {
            vocab.insert(format!("w{i}"), i.into());
        }
        let tokenizer = serde_json::json!({
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
        fs::write(dir.join("tokenizer.json"), tokenizer.to_string()).unwrap();

        random_weights(&config, 11, &Device::Cpu)
            .unwrap()
            .save(&dir.join("model.safetensors"))
            .unwrap();
    }

    #[tokio::test]
    async fn generate_without_model_keeps_state() {
        let runner = Runner::builder().build();
        let err = runner
            .generate(GenerationConfig::greedy(4), "hi", |_, _| {})
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<EmberError>(),
            Some(EmberError::ModelNotLoaded)
        ));
        assert_eq!(runner.state(), ModelState::Uninitialized);
    }

    #[tokio::test]
    async fn generate_streams_text_and_reports_throughput() {
        let runner = Runner::builder().build();
        runner.install(toy_session());
        assert_eq!(runner.state(), ModelState::Ready { tokens_per_second: None });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let text = runner
            .generate(GenerationConfig::greedy(5), "abc", move |text, progress| {
                sink.lock().unwrap().push((text.to_string(), progress));
            })
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen.last().unwrap().0, text);
        assert_eq!(seen.iter().map(|(_, p)| *p).collect::<Vec<_>>(), vec![0.2, 0.4, 0.6, 0.8, 1.0]);
        assert_eq!(text.split(' ').count(), 5);

        match runner.state() {
            ModelState::Ready { tokens_per_second: Some(tps) } => assert!(tps > 0.0),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn greedy_generation_repeats() {
        let runner = Runner::builder().build();
        runner.install(toy_session());

        let first = runner.generate(GenerationConfig::greedy(6), "abc", |_, _| {}).await.unwrap();
        let second = runner.generate(GenerationConfig::greedy(6), "abc", |_, _| {}).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn same_seed_same_sampled_completion() {
        let sampling = GenerationConfig {
            max_new_tokens: 10,
            temperature: 1.2,
            do_sample: true,
            top_k: None,
        };
        let run = || async {
            let runner = Runner::builder().seed(42).generation(sampling).build();
            runner.install(toy_session());
            runner.generate(sampling, "abc", |_, _| {}).await.unwrap()
        };

        assert_eq!(run().await, run().await);
    }

    #[tokio::test]
    async fn non_finite_logits_fail_the_runner() {
        let runner = Runner::builder().build();
        runner.install(ModelSession::new(
            Arc::new(NanModel { device: Device::Cpu }),
            Arc::new(ByteCodec),
        ));

        let err = runner
            .generate(GenerationConfig::greedy(3), "abc", |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EmberError>(),
            Some(EmberError::NonFiniteLogits { step: 0 })
        ));
        assert!(matches!(runner.state(), ModelState::Failed(_)));
    }

    #[tokio::test]
    async fn load_from_directory() {
        let dir = temp_dir("load");
        write_checkpoint(&dir);

        let runner = Runner::builder().build();
        let mut states = runner.subscribe();
        assert_eq!(runner.load(&dir).await.unwrap(), LoadOutcome::Loaded);
        assert!(runner.is_loaded());
        assert!(states.has_changed().unwrap());
        assert_eq!(
            *states.borrow_and_update(),
            ModelState::Ready { tokens_per_second: None }
        );

        let text = runner
            .generate(GenerationConfig::greedy(4), "w3 w7 w9", |_, _| {})
            .await
            .unwrap();
        assert!(text.split_whitespace().count() <= 4);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn failed_load_reports_message() {
        let runner = Runner::builder().build();
        assert!(runner.load("/nonexistent/model").await.is_err());
        assert!(!runner.is_loaded());
        assert!(matches!(runner.state(), ModelState::Failed(_)));
    }

    #[tokio::test]
    async fn load_while_loading_is_discarded() {
        let runner = Runner::builder().build();
        assert!(runner.lifecycle.try_begin_load());

        let outcome = runner.load("/nonexistent/model").await.unwrap();
        assert_eq!(outcome, LoadOutcome::Discarded);
        assert!(runner.is_loading());
        assert_eq!(runner.state(), ModelState::Loading { progress: 0.0 });
    }

    #[tokio::test]
    async fn generation_during_load_keeps_load_in_flight() {
        let runner = Runner::builder().build();
        runner.install(toy_session());
        assert!(runner.lifecycle.try_begin_load());
        runner
            .lifecycle
            .state
            .send_replace(ModelState::Loading { progress: 0.3 });

        // The previous model still answers, without touching the load's state
        let text = runner
            .generate(GenerationConfig::greedy(2), "abc", |_, _| {})
            .await
            .unwrap();
        assert_eq!(text.split(' ').count(), 2);
        assert_eq!(runner.state(), ModelState::Loading { progress: 0.3 });

        let outcome = runner.load("/nonexistent/model").await.unwrap();
        assert_eq!(outcome, LoadOutcome::Discarded);
        assert_eq!(runner.state(), ModelState::Loading { progress: 0.3 });
    }

    #[tokio::test]
    async fn finished_load_releases_the_lifecycle() {
        let runner = Runner::builder().build();
        assert!(runner.load("/nonexistent/model").await.is_err());
        assert!(!runner.is_loading());

        // A new load is attempted rather than discarded
        assert!(runner.load("/nonexistent/model").await.is_err());
        assert!(matches!(runner.state(), ModelState::Failed(_)));
    }

    #[tokio::test]
    async fn runnable_llm_callback_sees_text() {
        let runner = Runner::builder().generation(GenerationConfig::greedy(3)).build();
        runner.install(toy_session());
        let llm: &dyn RunnableLlm = &runner;

        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();
        let config = llm.default_generation_config();
        let text = llm
            .generate(
                config,
                "abc",
                Some(Box::new(move |_: &str| *counter.lock().unwrap() += 1)),
            )
            .await
            .unwrap();

        assert_eq!(*count.lock().unwrap(), 3);
        assert_eq!(text.split(' ').count(), 3);
    }

    #[test]
    fn clean_completion_strips_bos_and_unescapes() {
        assert_eq!(clean_completion("<s> Hello\\nworld"), "Hello\nworld");
        assert_eq!(clean_completion("plain"), "plain");
        assert_eq!(clean_completion("<s>no space"), "<s>no space");
    }
}
