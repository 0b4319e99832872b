//! Interactive text inference on the engine API.
//!
//! Loads a checkpoint directory and streams greedy completions for prompts
//! read from stdin. Pass `--quantize` to quantize eligible layers to 4 bits
//! while loading.
//!
//! Run with:
//! ```bash
//! cargo run -p ember-core --example text_inference -- /path/to/stablelm-2-1_6b --quantize
//! ```

use candle_core::{DType, Device};
use ember_core::generation::{Sampler, TokenIterator};
use ember_core::model::{create_model, HfTokenizer, ModelConfig, QuantizationSpec, TokenCodec, WeightTable};
use std::io::{self, Write};
use std::path::Path;
use std::time::Instant;

const MAX_NEW_TOKENS: usize = 50;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let model_dir = args
        .get(1)
        .map(|s| s.as_str())
        .unwrap_or("models/stablelm-2-1_6b");
    let quantize = args.iter().any(|a| a == "--quantize");
    let model_path = Path::new(model_dir);

    println!("Text Inference Example");
    println!("======================\n");

    let tokenizer = HfTokenizer::from_dir(model_path)?;
    println!("  Vocab size: {}", tokenizer.vocab_size());
    println!("  Stop token: {:?}", tokenizer.stop_token_id());

    let config = ModelConfig::from_file(&model_path.join("config.json"))?;
    println!(
        "\nModel: {} ({} layers, {} hidden)",
        config.model_type, config.num_hidden_layers, config.hidden_size
    );

    println!("Loading model weights...");
    let load_start = Instant::now();
    let device = Device::Cpu;
    let weights = WeightTable::from_dir(model_path, &device, DType::F32)?;
    let quantization = quantize.then(QuantizationSpec::default);
    let model = create_model(&config, weights, &device, quantization)?;
    println!("Loaded in {:.2}s", load_start.elapsed().as_secs_f64());

    println!("\n--- Text Generation ---");
    println!("Enter prompts (empty line to quit):\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut prompt = String::new();
        stdin.read_line(&mut prompt)?;
        let prompt = prompt.trim();

        if prompt.is_empty() {
            break;
        }

        let prompt_ids = tokenizer.encode(prompt)?;
        println!("\nTokens: {:?}", prompt_ids);

        print!("\nGenerated: ");
        stdout.flush()?;

        let gen_start = Instant::now();
        let mut sampler = Sampler::greedy();
        let mut produced = Vec::new();
        for token in TokenIterator::new(model.as_ref(), &prompt_ids, &mut sampler).take(MAX_NEW_TOKENS) {
            let token = token?;
            if Some(token) == tokenizer.stop_token_id() {
                break;
            }
            produced.push(token);
            print!("{}", tokenizer.decode(&[token])?);
            stdout.flush()?;
        }

        let gen_time = gen_start.elapsed();
        println!("\n");
        println!(
            "Generated {} tokens in {:.2}ms ({:.1} tok/s)",
            produced.len(),
            gen_time.as_secs_f64() * 1000.0,
            produced.len() as f64 / gen_time.as_secs_f64()
        );
        println!("\nFull output: {}", tokenizer.decode(&produced)?);
        println!();
    }

    println!("Goodbye!");
    Ok(())
}
