//! llama.cpp based GGUF inference for completion scoring
//!
//! Loads a GGUF model through the llama-cpp-2 crate and exposes it as a
//! [`LogProbSource`]. Tokenization always goes through an external
//! HuggingFace tokenizer so that token ids match the ones the classifier
//! computes prompt/completion boundaries with.
//!
//! Enabled by the `llamacpp` feature flag (on by default).

use super::error::{Result, SourceError};
use super::{Backend, HfTokenizer, LogProbSource, TokenId, Tokenize};
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::LlamaModel;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::token::LlamaToken;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::OnceLock;

/// Default context window when none is configured.
pub const DEFAULT_N_CTX: u32 = 2048;

/// Global llama.cpp backend (can only be initialized once)
static LLAMA_BACKEND: OnceLock<std::result::Result<LlamaBackend, String>> = OnceLock::new();

/// Get or initialize the global llama.cpp backend
fn get_backend() -> Result<&'static LlamaBackend> {
    let result = LLAMA_BACKEND.get_or_init(|| {
        let mut backend = LlamaBackend::init().map_err(|e| e.to_string())?;
        backend.void_logs();
        Ok(backend)
    });
    match result {
        Ok(backend) => Ok(backend),
        Err(e) => Err(SourceError::ModelLoad(
            format!("Failed to initialize llama.cpp backend: {}", e).into(),
        )),
    }
}

/// Log-probability of `target` under the distribution given by `logits`.
///
/// Only the first `vocab_size` logits take part in the normalization; some
/// models pad the output layer. Returns `None` when the target is outside
/// the vocabulary or the logits contain NaN.
fn log_prob_of(logits: &[f32], vocab_size: usize, target: usize) -> Option<f32> {
    let logits = &logits[..vocab_size.min(logits.len())];
    if target >= logits.len() || logits.iter().any(|x| x.is_nan()) {
        return None;
    }
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let log_sum_exp: f32 = logits
        .iter()
        .map(|&x| (x - max_logit).exp())
        .sum::<f32>()
        .ln()
        + max_logit;
    Some(logits[target] - log_sum_exp)
}

fn to_llama(ids: &[TokenId]) -> Vec<LlamaToken> {
    ids.iter().map(|&id| LlamaToken(id as i32)).collect()
}

fn inference<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> SourceError {
    SourceError::Inference(e.into())
}

/// A GGUF model loaded through llama.cpp, plus its external tokenizer.
pub struct LlamaCppModel {
    model: LlamaModel,
    n_ctx: u32,
    tokenizer: HfTokenizer,
    /// Number of threads for inference (0 = use llama.cpp default)
    n_threads: u32,
    display_name: String,
}

impl LlamaCppModel {
    /// Load a GGUF model with the default context window.
    pub fn from_file<P: AsRef<Path>, T: AsRef<Path>>(path: P, tokenizer_json: T) -> Result<Self> {
        Self::from_file_with_n_ctx(path, tokenizer_json, DEFAULT_N_CTX)
    }

    /// Load a GGUF model with explicit context window size.
    ///
    /// Runs on CPU; GPU offload is left to llama.cpp builds that enable it.
    pub fn from_file_with_n_ctx<P: AsRef<Path>, T: AsRef<Path>>(
        path: P,
        tokenizer_json: T,
        n_ctx: u32,
    ) -> Result<Self> {
        if n_ctx == 0 {
            return Err(SourceError::ModelLoad("n_ctx must be non-zero".into()));
        }
        let backend = get_backend()?;

        let model_params = LlamaModelParams::default().with_n_gpu_layers(0);

        tracing::info!("Loading GGUF model from {}", path.as_ref().display());
        let model = LlamaModel::load_from_file(backend, path.as_ref(), &model_params)
            .map_err(|e| SourceError::ModelLoad(e.into()))?;
        let tokenizer = HfTokenizer::from_file(tokenizer_json)?;

        Ok(Self {
            model,
            n_ctx,
            tokenizer,
            n_threads: 0,
            display_name: "custom".to_string(),
        })
    }

    /// Load the model a [`Backend`] points at.
    pub fn from_backend(backend: &Backend, n_ctx: u32) -> Result<Self> {
        let mut model =
            Self::from_file_with_n_ctx(&backend.gguf_path, &backend.tokenizer_json_path, n_ctx)?;
        model.display_name = backend.display_name.clone();
        Ok(model)
    }

    /// Set the number of threads for inference.
    /// 0 means use llama.cpp default (typically all cores).
    pub fn set_n_threads(&mut self, n: u32) {
        self.n_threads = n;
    }

    /// Get a human-readable model name for display
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Build LlamaContextParams with configured n_threads.
    ///
    /// `n_batch` equals the context window so a whole sequence fits in one decode.
    fn context_params(&self) -> LlamaContextParams {
        let params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.n_ctx))
            .with_n_batch(self.n_ctx);
        if self.n_threads > 0 {
            params
                .with_n_threads(self.n_threads as i32)
                .with_n_threads_batch(self.n_threads as i32)
        } else {
            params
        }
    }

    /// Create a scorer with its own llama.cpp context.
    pub fn scorer(&self) -> Result<LlamaCppScorer<'_>> {
        LlamaCppScorer::new(self)
    }
}

impl Tokenize for LlamaCppModel {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<TokenId>> {
        self.tokenizer.encode(text, add_special_tokens)
    }
}

/// Prefix state of a [`LlamaCppScorer`]: the prefix tokens and the logits
/// at its last position, which hold the distribution of the first
/// continuation token.
pub struct LlamaPrefix {
    tokens: Vec<LlamaToken>,
    last_logits: Vec<f32>,
}

/// Reusable scorer that keeps a single llama.cpp context alive.
///
/// Creating a `LlamaContext` is expensive. This struct amortizes the cost by
/// creating one context and reusing its KV cache. A prefilled prompt stays in
/// the cache; every continuation is decoded on top of it and the cache is
/// truncated back to the prompt afterwards.
/// Use one `LlamaCppScorer` per thread for parallel scoring.
pub struct LlamaCppScorer<'a> {
    model: &'a LlamaCppModel,
    ctx: LlamaContext<'a>,
    vocab_size: usize,
    /// Tokens currently held in the KV cache (sequence 0)
    cached: Vec<LlamaToken>,
}

impl<'a> LlamaCppScorer<'a> {
    /// Create a new scorer with a reusable context.
    pub fn new(model: &'a LlamaCppModel) -> Result<Self> {
        let backend = get_backend()?;

        let ctx = model
            .model
            .new_context(backend, model.context_params())
            .map_err(inference)?;

        let vocab_size = model.model.n_vocab() as usize;

        Ok(Self {
            model,
            ctx,
            vocab_size,
            cached: Vec::new(),
        })
    }

    /// Get a human-readable model name for display
    pub fn display_name(&self) -> &str {
        self.model.display_name()
    }

    fn check_fits(&self, needed: usize) -> Result<()> {
        let n_ctx = self.model.n_ctx as usize;
        if needed > n_ctx {
            return Err(SourceError::ContextOverflow { needed, n_ctx });
        }
        Ok(())
    }

    fn reset_cache(&mut self) {
        self.ctx.clear_kv_cache();
        self.cached.clear();
    }

    /// Decode `tokens` into sequence 0 starting at position `start`.
    ///
    /// `logits` selects the batch indices whose logits are kept.
    fn decode(
        &mut self,
        tokens: &[LlamaToken],
        start: usize,
        logits: impl Fn(usize) -> bool,
    ) -> Result<()> {
        let mut batch = LlamaBatch::new(tokens.len().max(512), 1);
        for (i, token) in tokens.iter().enumerate() {
            batch
                .add(*token, (start + i) as i32, &[0], logits(i))
                .map_err(inference)?;
        }
        self.ctx.decode(&mut batch).map_err(inference)
    }

    /// Log-probability of `target` using the logits at batch index `idx` of the last decode.
    fn log_prob_at(&self, idx: usize, target: LlamaToken) -> Result<f32> {
        let logits = self.ctx.get_logits_ith(idx as i32);
        log_prob_of(logits, self.vocab_size, target.0 as usize).ok_or_else(|| {
            inference(format!(
                "no valid log-probability for token {} (NaN logits or id outside vocabulary)",
                target.0
            ))
        })
    }

    /// Make sure the KV cache holds exactly `prefix`.
    fn restore_prefix(&mut self, prefix: &LlamaPrefix) -> Result<()> {
        if self.cached == prefix.tokens {
            return Ok(());
        }
        tracing::debug!("Re-decoding prefix of {} tokens", prefix.tokens.len());
        self.reset_cache();
        self.decode(&prefix.tokens, 0, |_| false)?;
        self.cached = prefix.tokens.clone();
        Ok(())
    }

    /// Drop everything after `len` tokens from the KV cache.
    fn truncate_cache(&mut self, len: usize) -> Result<()> {
        let removed = self
            .ctx
            .clear_kv_cache_seq(Some(0), Some(len as u32), None)
            .map_err(inference)?;
        if removed {
            self.cached.truncate(len);
        } else {
            // Partial removal is not supported by every memory layout
            self.reset_cache();
        }
        Ok(())
    }
}

impl Tokenize for LlamaCppScorer<'_> {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<TokenId>> {
        self.model.encode(text, add_special_tokens)
    }
}

impl LogProbSource for LlamaCppScorer<'_> {
    type Prefix = LlamaPrefix;

    fn supports_prefix_state(&self) -> bool {
        true
    }

    fn score_batch(&mut self, sequences: &[&[TokenId]]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(sequences.len());
        for sequence in sequences {
            let tokens = to_llama(sequence);
            if tokens.len() < 2 {
                results.push(Vec::new());
                continue;
            }
            self.check_fits(tokens.len())?;

            self.reset_cache();
            let last = tokens.len() - 1;
            self.decode(&tokens, 0, |i| i < last)?;

            let mut log_probs = Vec::with_capacity(last);
            for pos in 0..last {
                log_probs.push(self.log_prob_at(pos, tokens[pos + 1])?);
            }
            results.push(log_probs);
        }
        // The cache holds a full sequence now, not a reusable prefix
        self.reset_cache();
        Ok(results)
    }

    fn prefill(&mut self, prefix: &[TokenId]) -> Result<LlamaPrefix> {
        if prefix.is_empty() {
            return Err(inference("cannot prefill an empty prefix"));
        }
        let tokens = to_llama(prefix);
        self.check_fits(tokens.len())?;

        self.reset_cache();
        let last = tokens.len() - 1;
        self.decode(&tokens, 0, |i| i == last)?;

        let logits = self.ctx.get_logits_ith(last as i32);
        let last_logits = logits[..self.vocab_size.min(logits.len())].to_vec();
        if last_logits.iter().any(|x| x.is_nan()) {
            return Err(inference("NaN logits after prefill"));
        }
        self.cached = tokens.clone();

        Ok(LlamaPrefix {
            tokens,
            last_logits,
        })
    }

    fn score_with_prefix(
        &mut self,
        prefix: &LlamaPrefix,
        continuations: &[&[TokenId]],
    ) -> Result<Vec<Vec<f32>>> {
        let prefix_len = prefix.tokens.len();
        let mut results = Vec::with_capacity(continuations.len());

        for continuation in continuations {
            let tokens = to_llama(continuation);
            let Some(&first) = tokens.first() else {
                results.push(Vec::new());
                continue;
            };

            let first_log_prob = log_prob_of(&prefix.last_logits, self.vocab_size, first.0 as usize)
                .ok_or_else(|| inference(format!("token {} outside vocabulary", first.0)))?;
            let mut log_probs = Vec::with_capacity(tokens.len());
            log_probs.push(first_log_prob);

            // Single-token continuations are fully answered by the prefix logits
            if tokens.len() > 1 {
                // The last token is only ever a target, never a context
                let context = &tokens[..tokens.len() - 1];
                self.check_fits(prefix_len + context.len())?;
                self.restore_prefix(prefix)?;
                self.decode(context, prefix_len, |_| true)?;
                for (j, &target) in tokens.iter().enumerate().skip(1) {
                    log_probs.push(self.log_prob_at(j - 1, target)?);
                }
                self.truncate_cache(prefix_len)?;
            }

            results.push(log_probs);
        }
        Ok(results)
    }
}
