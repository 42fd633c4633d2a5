//! Tokenizers and log-probability sources
//!
//! The classifier never runs a language model itself. It talks to two narrow
//! interfaces: [`Tokenize`] turns text into token ids, and [`LogProbSource`]
//! returns the log-probability a model assigns to each actual next token of
//! a sequence. Two sources are provided: a local llama.cpp model and a remote
//! OpenAI-compatible completions endpoint.

pub mod error;
pub mod hf_download;
#[cfg(feature = "llamacpp")]
pub mod llamacpp;
pub mod model_config;
#[cfg(feature = "remote")]
pub mod remote;
mod tokenizer;

pub use error::SourceError;
pub use hf_download::download_file;
#[cfg(feature = "llamacpp")]
pub use llamacpp::{LlamaCppModel, LlamaCppScorer, LlamaPrefix};
pub use model_config::{ModelFamily, ModelRegistry, VariantConfig, registry};
#[cfg(feature = "remote")]
pub use remote::{RemoteConfig, RemoteSource};
pub use tokenizer::HfTokenizer;

use error::Result;
use std::path::PathBuf;

/// Token id as produced by a tokenizer.
pub type TokenId = u32;

/// Maps text to token ids for one specific model.
pub trait Tokenize {
    /// Encode `text`. When `add_special_tokens` is true the tokenizer's
    /// post-processor runs, which usually prepends a BOS token.
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<TokenId>>;
}

/// Produces next-token log-probabilities for token sequences.
///
/// Every returned value is `log Pr(token_i | token_0 .. token_{i-1})` for an
/// actual token of the input, never a distribution over the vocabulary.
pub trait LogProbSource {
    /// Reusable state for a scored prefix, e.g. a populated KV cache.
    type Prefix;

    /// Whether [`prefill`](Self::prefill) and
    /// [`score_with_prefix`](Self::score_with_prefix) are available.
    fn supports_prefix_state(&self) -> bool {
        false
    }

    /// Score whole sequences.
    ///
    /// For each input sequence the result holds `len - 1` values: the
    /// log-probability of `tokens[1..]`, each conditioned on everything
    /// before it. The first token has nothing to condition on.
    fn score_batch(&mut self, sequences: &[&[TokenId]]) -> Result<Vec<Vec<f32>>>;

    /// Run the model over `prefix` and keep whatever is needed to score
    /// continuations of it without recomputing the prefix.
    fn prefill(&mut self, _prefix: &[TokenId]) -> Result<Self::Prefix> {
        Err(SourceError::Unsupported("prefix state"))
    }

    /// Score continuations of a prefilled prefix.
    ///
    /// For each continuation the result holds one value per continuation
    /// token, conditioned on the prefix and the earlier continuation tokens.
    fn score_with_prefix(
        &mut self,
        _prefix: &Self::Prefix,
        _continuations: &[&[TokenId]],
    ) -> Result<Vec<Vec<f32>>> {
        Err(SourceError::Unsupported("prefix state"))
    }

    /// Score a single sequence, optionally as the continuation of `prefix`.
    fn score_sequence(
        &mut self,
        tokens: &[TokenId],
        prefix: Option<&Self::Prefix>,
    ) -> Result<Vec<f32>> {
        let mut scored = match prefix {
            Some(prefix) => self.score_with_prefix(prefix, &[tokens])?,
            None => self.score_batch(&[tokens])?,
        };
        scored
            .pop()
            .ok_or_else(|| SourceError::InvalidResponse("empty result for one sequence".into()))
    }
}

impl<T: Tokenize + ?Sized> Tokenize for &T {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<TokenId>> {
        (**self).encode(text, add_special_tokens)
    }
}

/// Location of a local model: a GGUF file plus its external `tokenizer.json`.
#[derive(Debug, Clone)]
pub struct Backend {
    pub gguf_path: PathBuf,
    pub tokenizer_json_path: PathBuf,
    /// Display name for the model (variant id for registry models, "custom" for GGUF paths)
    pub display_name: String,
}

impl Backend {
    /// Create a backend from a `(ModelFamily, VariantConfig)` pair.
    ///
    /// Downloads the GGUF and the external tokenizer from HuggingFace.
    pub fn from_variant(family: &ModelFamily, variant: &VariantConfig) -> Result<Self> {
        Ok(Backend {
            gguf_path: download_file(&family.repo_id, &variant.filename)?,
            tokenizer_json_path: download_file(family.tokenizer_repo(), "tokenizer.json")?,
            display_name: variant.id.clone(),
        })
    }

    /// Create a backend by looking up a variant id in the global registry.
    ///
    /// E.g. `Backend::from_variant_id("tinyllama-v0-q8")`
    pub fn from_variant_id(variant_id: &str) -> Result<Self> {
        let (family, variant) = registry()
            .find_variant(variant_id)
            .ok_or_else(|| SourceError::UnknownVariant(variant_id.to_string()))?;
        Self::from_variant(family, variant)
    }

    /// Create a backend from files already on disk.
    pub fn from_files(gguf_path: impl Into<PathBuf>, tokenizer_json_path: impl Into<PathBuf>) -> Self {
        Backend {
            gguf_path: gguf_path.into(),
            tokenizer_json_path: tokenizer_json_path.into(),
            display_name: "custom".to_string(),
        }
    }
}

/// A source picked at runtime.
///
/// Lets the binaries switch between the local and the remote backend while
/// the classifier stays generic over [`LogProbSource`].
#[cfg(all(feature = "llamacpp", feature = "remote"))]
pub enum ModelSource<'a> {
    LlamaCpp(LlamaCppScorer<'a>),
    Remote(RemoteSource),
}

/// Prefix state of a [`ModelSource`]. Only the local backend has one.
#[cfg(all(feature = "llamacpp", feature = "remote"))]
pub enum ModelPrefix {
    LlamaCpp(LlamaPrefix),
}

#[cfg(all(feature = "llamacpp", feature = "remote"))]
impl ModelSource<'_> {
    /// Human-readable backend name for logs and reports.
    pub fn display_name(&self) -> &str {
        match self {
            ModelSource::LlamaCpp(scorer) => scorer.display_name(),
            ModelSource::Remote(remote) => remote.model_name(),
        }
    }
}

#[cfg(all(feature = "llamacpp", feature = "remote"))]
impl Tokenize for ModelSource<'_> {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<TokenId>> {
        match self {
            ModelSource::LlamaCpp(scorer) => scorer.encode(text, add_special_tokens),
            ModelSource::Remote(remote) => remote.encode(text, add_special_tokens),
        }
    }
}

#[cfg(all(feature = "llamacpp", feature = "remote"))]
impl LogProbSource for ModelSource<'_> {
    type Prefix = ModelPrefix;

    fn supports_prefix_state(&self) -> bool {
        match self {
            ModelSource::LlamaCpp(scorer) => scorer.supports_prefix_state(),
            ModelSource::Remote(remote) => remote.supports_prefix_state(),
        }
    }

    fn score_batch(&mut self, sequences: &[&[TokenId]]) -> Result<Vec<Vec<f32>>> {
        match self {
            ModelSource::LlamaCpp(scorer) => scorer.score_batch(sequences),
            ModelSource::Remote(remote) => remote.score_batch(sequences),
        }
    }

    fn prefill(&mut self, prefix: &[TokenId]) -> Result<ModelPrefix> {
        match self {
            ModelSource::LlamaCpp(scorer) => scorer.prefill(prefix).map(ModelPrefix::LlamaCpp),
            ModelSource::Remote(_) => Err(SourceError::Unsupported("prefix state")),
        }
    }

    fn score_with_prefix(
        &mut self,
        prefix: &ModelPrefix,
        continuations: &[&[TokenId]],
    ) -> Result<Vec<Vec<f32>>> {
        match (self, prefix) {
            (ModelSource::LlamaCpp(scorer), ModelPrefix::LlamaCpp(prefix)) => {
                scorer.score_with_prefix(prefix, continuations)
            }
            (ModelSource::Remote(_), _) => Err(SourceError::Unsupported("prefix state")),
        }
    }
}
