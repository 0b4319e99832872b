//! Streaming generation through the runner.
//!
//! Loads a checkpoint directory and streams a completion while printing
//! lifecycle transitions.
//!
//! Run with:
//! ```bash
//! cargo run -p ember --example generate -- /path/to/stablelm-2-zephyr-1_6b "Why is the sky blue?"
//! ```

use anyhow::Result;
use ember::prelude::*;
use std::io::Write;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let model_dir = args
        .get(1)
        .map(|s| s.as_str())
        .unwrap_or("models/stablelm-2-zephyr-1_6b-4bit");
    let prompt = args
        .get(2)
        .map(|s| s.as_str())
        .unwrap_or("<|user|>\nWhy is the sky blue?<|endoftext|>\n<|assistant|>\n");

    let runner = Runner::builder()
        .seed(0)
        .generation(GenerationConfig {
            max_new_tokens: 100,
            temperature: 0.7,
            do_sample: true,
            top_k: Some(40),
        })
        .build();

    // Print lifecycle transitions as they happen
    let mut states = runner.subscribe();
    let watcher = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            match state {
                ModelState::Loading { progress } => {
                    tracing::info!("loading {:.0}%", progress * 100.0)
                }
                ModelState::Ready {
                    tokens_per_second: Some(tps),
                } => tracing::info!("ready, {:.1} tokens/s", tps),
                ModelState::Failed(message) => tracing::error!("failed: {}", message),
                _ => {}
            }
        }
    });

    if runner.load(model_dir).await? == LoadOutcome::Discarded {
        anyhow::bail!("a load was already in flight");
    }

    let config = runner.default_generation_config();
    let mut printed = 0;
    let text = runner
        .generate(config, prompt, move |text, _| {
            let text = clean_completion(text);
            if let Some(new) = text.get(printed..) {
                print!("{}", new);
                let _ = std::io::stdout().flush();
            }
            printed = text.len();
        })
        .await?;

    println!("\n\n--- completion ---\n{}", clean_completion(&text));

    drop(runner);
    watcher.await?;
    Ok(())
}
