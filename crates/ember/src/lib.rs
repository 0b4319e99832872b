//! # Ember
//!
//! On-device text generation with decoder-only transformer models.
//!
//! Ember wraps the `ember-core` engine in a small host-facing surface:
//! - **Runner**: loads a checkpoint directory on the blocking pool and tracks
//!   the model lifecycle through a watch channel
//! - **Streaming**: every produced token reports the decoded text so far
//! - **Quantization**: pre-quantized checkpoints, or quantize at load time
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ember::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runner = Runner::builder().seed(0).build();
//!     runner.load("models/stablelm-2-zephyr-1_6b-4bit").await?;
//!
//!     let text = runner
//!         .generate(GenerationConfig::default(), "Why is the sky blue?", |text, _| {
//!             print!("\r{}", clean_completion(text));
//!         })
//!         .await?;
//!
//!     println!("\n{}", clean_completion(&text));
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use ember_core::*;

mod runner;
mod session;

pub use runner::{
    clean_completion, LoadOutcome, ModelState, RunnableLlm, Runner, RunnerBuilder, RunnerConfig,
};
pub use session::{GenerationOutput, LoadOptions, ModelSession};

/// Commonly used types.
pub mod prelude {
    pub use crate::runner::{
        clean_completion, LoadOutcome, ModelState, RunnableLlm, Runner, RunnerBuilder,
        RunnerConfig,
    };
    pub use crate::session::{GenerationOutput, LoadOptions, ModelSession};
    pub use crate::{
        error::{EmberError, Result},
        generation::{GenerationConfig, Sampler},
        model::{HfTokenizer, LanguageModel, ModelConfig, QuantizationSpec, TokenCodec},
    };

    // Re-export useful external types
    pub use anyhow;
    pub use tokio;
    pub use tracing;
}
