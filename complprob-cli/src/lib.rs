//! Shared command-line plumbing for the complprob binaries

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use complprob_engine::{BackendKind, LlamaCppModel, ModelSource, Settings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Model and settings options common to every binary
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Settings file (defaults to ~/.config/complprob/config.toml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Model variant id from the registry (e.g. smollm2-135m-q8, tinyllama-v0-q8)
    #[arg(long)]
    pub model: Option<String>,

    /// Direct GGUF file path (overrides --model)
    #[arg(long)]
    pub gguf: Option<PathBuf>,

    /// Path to tokenizer.json (required when using --gguf)
    #[arg(long)]
    pub tokenizer_json: Option<PathBuf>,

    /// Use the remote completions endpoint from the settings file
    #[arg(long)]
    pub remote: bool,

    /// Maximum number of (prompt, completion) pairs per model call
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Context window size for local models
    #[arg(long)]
    pub n_ctx: Option<u32>,
}

impl ModelArgs {
    /// Load settings and apply the command-line overrides.
    pub fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load_from(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => Settings::load().context("Failed to load settings")?,
        };

        if let Some(model) = &self.model {
            settings.model.variant = Some(model.clone());
        }
        if let Some(gguf) = &self.gguf {
            let tokenizer = self
                .tokenizer_json
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("--tokenizer-json is required when using --gguf"))?;
            settings.model.gguf_path = Some(gguf.to_string_lossy().into_owned());
            settings.model.tokenizer_path = Some(tokenizer.to_string_lossy().into_owned());
        }
        if self.remote {
            settings.model.backend = BackendKind::Remote;
        }
        if let Some(batch_size) = self.batch_size {
            settings.classify.batch_size = batch_size;
        }
        if let Some(n_ctx) = self.n_ctx {
            settings.model.n_ctx = n_ctx;
        }
        settings.classify.validate()?;
        Ok(settings)
    }
}

/// Open the log-probability source selected by `settings.model.backend`.
///
/// A local model is loaded into `slot`, which must outlive the returned scorer.
pub fn open_source<'a>(
    settings: &Settings,
    slot: &'a mut Option<LlamaCppModel>,
) -> Result<ModelSource<'a>> {
    match settings.model.backend {
        BackendKind::Local => {
            let model: &'a LlamaCppModel =
                slot.insert(settings.model.load().context("Failed to load local model")?);
            Ok(ModelSource::LlamaCpp(model.scorer()?))
        }
        BackendKind::Remote => Ok(ModelSource::Remote(
            settings
                .remote
                .connect()
                .context("Failed to set up remote source")?,
        )),
    }
}

/// Install the tracing subscriber.
///
/// Default: info level, with `verbose`: debug level. `RUST_LOG` wins over both.
pub fn init_tracing(bin_target: &str, verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let default_filter = format!(
        "{bin}={level},complprob_cli={level},complprob_engine={level},tower_http={level}",
        bin = bin_target,
        level = level
    );

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
