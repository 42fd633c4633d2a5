//! One-shot zero-shot classification of a JSON input file
//!
//! Input is either a shared completion set:
//!
//! ```json
//! {"prompts": ["..."], "completions": ["positive", "negative"], "prior": [0.5, 0.5]}
//! ```
//!
//! or per-prompt units:
//!
//! ```json
//! {"examples": [{"prompt": "...", "completions": ["a", "b"], "prior": [0.9, 0.1]}]}
//! ```
//!
//! Predictions (or probabilities with `--proba`) are written to stdout as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use complprob_cli::{ModelArgs, init_tracing, open_source};
use complprob_engine::{
    ClassificationUnit, ClassifyConfig, ModelSource, Posterior, predict_proba,
    predict_proba_examples,
};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Zero-shot classification by completion probability
#[derive(Parser, Debug)]
#[command(name = "complprob")]
#[command(about = "Classify prompts by the probability of each completion", long_about = None)]
struct Cli {
    /// Input JSON file ("-" reads stdin)
    input: PathBuf,

    #[command(flatten)]
    model: ModelArgs,

    /// Output the posterior probabilities instead of the predicted labels
    #[arg(long)]
    proba: bool,

    /// Enable verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Input {
    Shared {
        prompts: Vec<String>,
        completions: Vec<String>,
        #[serde(default)]
        prior: Option<Vec<f64>>,
    },
    Examples {
        examples: Vec<ClassificationUnit>,
    },
}

#[derive(Debug, Serialize)]
struct Prediction {
    label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    probabilities: Option<Posterior>,
}

fn read_input(path: &Path) -> Result<Input> {
    let data = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?
    };
    serde_json::from_str(&data).context("Failed to parse input JSON")
}

fn classify(
    input: &Input,
    source: &mut ModelSource<'_>,
    config: &ClassifyConfig,
) -> Result<Vec<(String, Posterior)>> {
    let labelled = match input {
        Input::Shared {
            prompts,
            completions,
            prior,
        } => {
            let posteriors =
                predict_proba(prompts, completions, source, prior.as_deref(), config)?;
            posteriors
                .into_iter()
                .map(|p| (completions[p.argmax(config.tie_break)].clone(), p))
                .collect()
        }
        Input::Examples { examples } => {
            let posteriors = predict_proba_examples(examples, source, config)?;
            posteriors
                .into_iter()
                .zip(examples)
                .map(|(p, unit)| (unit.completions()[p.argmax(config.tie_break)].clone(), p))
                .collect()
        }
    };
    Ok(labelled)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("complprob", cli.verbose);

    let settings = cli.model.settings()?;
    let input = read_input(&cli.input)?;

    let mut local = None;
    let mut source = open_source(&settings, &mut local)?;
    tracing::info!("Classifying with {}", source.display_name());

    let start = std::time::Instant::now();
    let labelled = classify(&input, &mut source, &settings.classify)?;
    tracing::info!(
        "Classified {} prompts in {:.1}ms",
        labelled.len(),
        start.elapsed().as_secs_f64() * 1000.0
    );

    let predictions: Vec<Prediction> = labelled
        .into_iter()
        .map(|(label, p)| Prediction {
            label,
            probabilities: cli.proba.then_some(p),
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&predictions)?);
    Ok(())
}
