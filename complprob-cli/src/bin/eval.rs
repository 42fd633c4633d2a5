//! Labelled-dataset evaluation for complprob
//!
//! Reads a JSON array of items
//! `{"prompt", "completions", "prior"?, "end_of_prompt"?, "label"}`,
//! classifies them in chunks and reports accuracy and mean log-loss.

use anyhow::{Context, Result, bail};
use clap::Parser;
use complprob_cli::{ModelArgs, init_tracing, open_source};
use complprob_engine::{ClassificationUnit, predict_proba_examples};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Accuracy evaluation on a labelled dataset
#[derive(Parser)]
#[command(name = "complprob-eval")]
struct Cli {
    /// Path to the labelled items JSON
    dataset: PathBuf,

    #[command(flatten)]
    model: ModelArgs,

    /// Number of items classified per progress step
    #[arg(long, default_value_t = 16)]
    chunk_size: usize,

    /// Save detailed results to JSON
    #[arg(long)]
    output: Option<PathBuf>,

    /// Show only summary
    #[arg(long)]
    quiet: bool,

    /// Enable verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,
}

/// A single labelled item
#[derive(Debug, Deserialize)]
struct EvalItem {
    prompt: String,
    completions: Vec<String>,
    #[serde(default)]
    prior: Option<Vec<f64>>,
    #[serde(default)]
    end_of_prompt: Option<String>,
    label: String,
}

/// Result for a single item
#[derive(Debug, Serialize)]
struct ItemResult {
    prompt: String,
    label: String,
    prediction: String,
    correct: bool,
    label_probability: f64,
    probabilities: Vec<f64>,
}

/// Overall evaluation metrics
#[derive(Debug, Serialize)]
struct Metrics {
    model: String,
    num_examples: usize,
    accuracy: f64,
    mean_log_loss: f64,
    results: Vec<ItemResult>,
}

/// Unit and index of the expected completion for an item.
fn prepare(idx: usize, item: &EvalItem) -> Result<(ClassificationUnit, usize)> {
    let Some(label_idx) = item.completions.iter().position(|c| *c == item.label) else {
        bail!(
            "item {}: label {:?} is not one of its completions",
            idx + 1,
            item.label
        );
    };
    let mut unit = ClassificationUnit::new(item.prompt.clone(), item.completions.clone())
        .with_context(|| format!("item {}", idx + 1))?;
    if let Some(prior) = &item.prior {
        unit = unit
            .with_prior(prior.clone())
            .with_context(|| format!("item {}", idx + 1))?;
    }
    if let Some(end_of_prompt) = &item.end_of_prompt {
        unit = unit.with_end_of_prompt(end_of_prompt.clone());
    }
    Ok((unit, label_idx))
}

/// Negative natural log of the probability assigned to the label.
fn log_loss(label_probability: f64) -> f64 {
    -label_probability.max(f64::MIN_POSITIVE).ln()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("complprob_eval", cli.verbose);
    if cli.chunk_size == 0 {
        bail!("--chunk-size must be positive");
    }

    let settings = cli.model.settings()?;

    eprintln!("Loading dataset from {}...", cli.dataset.display());
    let data = std::fs::read_to_string(&cli.dataset)
        .with_context(|| format!("Failed to read {}", cli.dataset.display()))?;
    let items: Vec<EvalItem> = serde_json::from_str(&data).context("Failed to parse dataset")?;
    let prepared = items
        .iter()
        .enumerate()
        .map(|(idx, item)| prepare(idx, item))
        .collect::<Result<Vec<_>>>()?;
    eprintln!("Loaded {} examples", prepared.len());

    let mut local = None;
    let mut source = open_source(&settings, &mut local)?;
    let model_name = source.display_name().to_string();
    eprintln!("Model: {}", model_name);

    let pb = ProgressBar::new(prepared.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, ETA: {eta})")?
            .progress_chars("=>-"),
    );

    let mut results: Vec<ItemResult> = Vec::with_capacity(prepared.len());
    let mut correct = 0usize;
    let mut total_log_loss = 0.0f64;

    let start = std::time::Instant::now();
    for (chunk_idx, chunk) in prepared.chunks(cli.chunk_size).enumerate() {
        let units: Vec<ClassificationUnit> = chunk.iter().map(|(unit, _)| unit.clone()).collect();
        let posteriors = predict_proba_examples(&units, &mut source, &settings.classify)
            .with_context(|| {
                format!(
                    "Failed to classify items {}..{}",
                    chunk_idx * cli.chunk_size + 1,
                    chunk_idx * cli.chunk_size + chunk.len()
                )
            })?;

        for ((unit, label_idx), posterior) in chunk.iter().zip(posteriors) {
            let predicted = posterior.argmax(settings.classify.tie_break);
            let is_correct = predicted == *label_idx;
            let label_probability = posterior[*label_idx];
            if is_correct {
                correct += 1;
            }
            total_log_loss += log_loss(label_probability);

            let result = ItemResult {
                prompt: unit.prompt().to_string(),
                label: unit.completions()[*label_idx].clone(),
                prediction: unit.completions()[predicted].clone(),
                correct: is_correct,
                label_probability,
                probabilities: posterior.into_vec(),
            };
            if !cli.quiet {
                let status = if is_correct { "OK" } else { "NG" };
                pb.println(format!(
                    "[{}] {} p(label)={:.3} | {} -> {} (expected {})",
                    results.len() + 1,
                    status,
                    result.label_probability,
                    result.prompt.replace('\n', " "),
                    result.prediction,
                    result.label
                ));
            }
            results.push(result);
        }
        pb.inc(chunk.len() as u64);
    }
    pb.finish_and_clear();
    let elapsed = start.elapsed();

    let num_examples = results.len();
    let accuracy = if num_examples > 0 {
        correct as f64 / num_examples as f64
    } else {
        0.0
    };
    let mean_log_loss = if num_examples > 0 {
        total_log_loss / num_examples as f64
    } else {
        0.0
    };

    println!();
    println!("{}", "=".repeat(50));
    println!("Evaluation Results");
    println!("{}", "=".repeat(50));
    println!("Model:              {}", model_name);
    println!("Number of examples: {}", num_examples);
    println!("Accuracy:           {:.2}%", accuracy * 100.0);
    println!("Mean log-loss:      {:.4}", mean_log_loss);
    println!("Elapsed:            {:.1}s", elapsed.as_secs_f64());
    println!("{}", "=".repeat(50));

    if let Some(output_path) = &cli.output {
        let metrics = Metrics {
            model: model_name,
            num_examples,
            accuracy,
            mean_log_loss,
            results,
        };
        let json = serde_json::to_string_pretty(&metrics)?;
        std::fs::write(output_path, &json)
            .with_context(|| format!("Failed to write {}", output_path.display()))?;
        eprintln!("Detailed results saved to {}", output_path.display());
    }

    Ok(())
}
