//! Settings configuration
//!
//! Classification options and backend selection shared by the binaries.
//! Default values are defined in `config/default.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ClassifyConfig;
use crate::source::{self, Backend, registry};

/// Default configuration TOML embedded from config/default.toml
const DEFAULT_CONFIG_TOML: &str = include_str!("../config/default.toml");

/// Configuration settings for classification and model loading
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Options passed to every classification call
    pub classify: ClassifyConfig,
    /// Backend selection and local model settings
    pub model: ModelSettings,
    /// Remote endpoint settings
    pub remote: RemoteSettings,
}

/// Which log-probability source to use
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// llama.cpp with a GGUF file
    #[default]
    Local,
    /// OpenAI-compatible completions endpoint
    Remote,
}

/// Local model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default)]
    pub backend: BackendKind,
    /// Model variant id (optional, defaults to registry default)
    pub variant: Option<String>,
    /// Path to a GGUF file (used together with `tokenizer_path`, overrides `variant`)
    pub gguf_path: Option<String>,
    /// Path to the model's tokenizer.json
    pub tokenizer_path: Option<String>,
    /// llama.cpp context size in tokens
    pub n_ctx: u32,
    /// Number of threads for llama.cpp inference (0 = all cores, llama.cpp default)
    pub n_threads: u32,
}

/// Remote endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    pub base_url: String,
    pub model: String,
    pub api_key_env: Option<String>,
    /// HuggingFace repo holding the tokenizer.json of the remote model
    pub tokenizer_repo: Option<String>,
    /// Local tokenizer.json, takes precedence over `tokenizer_repo`
    pub tokenizer_path: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl ModelSettings {
    /// Resolve the configured model files, downloading registry models if needed.
    pub fn backend(&self) -> source::error::Result<Backend> {
        match (&self.gguf_path, &self.tokenizer_path) {
            (Some(gguf), Some(tokenizer)) => Ok(Backend::from_files(gguf, tokenizer)),
            (Some(_), None) => Err(source::SourceError::TokenizerLoad(
                "gguf_path requires tokenizer_path".into(),
            )),
            (None, Some(_)) => Err(source::SourceError::TokenizerLoad(
                "tokenizer_path requires gguf_path".into(),
            )),
            _ => {
                let id = match &self.variant {
                    Some(id) => id.clone(),
                    None => registry().default_model.clone(),
                };
                Backend::from_variant_id(&id)
            }
        }
    }
}

#[cfg(feature = "llamacpp")]
impl ModelSettings {
    /// Load the configured local model.
    pub fn load(&self) -> source::error::Result<source::LlamaCppModel> {
        let backend = self.backend()?;
        let mut model = source::LlamaCppModel::from_backend(&backend, self.n_ctx)?;
        model.set_n_threads(self.n_threads);
        Ok(model)
    }
}

impl RemoteSettings {
    /// Local path of the remote model's tokenizer.json, downloading it if needed.
    pub fn tokenizer_json_path(&self) -> source::error::Result<PathBuf> {
        if let Some(path) = &self.tokenizer_path {
            return Ok(PathBuf::from(path));
        }
        let repo = self.tokenizer_repo.as_deref().ok_or_else(|| {
            source::SourceError::TokenizerLoad(
                "remote backend needs tokenizer_path or tokenizer_repo".into(),
            )
        })?;
        source::download_file(repo, "tokenizer.json")
    }

    /// Connection settings for [`source::RemoteSource`].
    #[cfg(feature = "remote")]
    pub fn connection(&self) -> source::RemoteConfig {
        source::RemoteConfig {
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            api_key_env: self.api_key_env.clone(),
            timeout_secs: self.timeout_secs,
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
        }
    }

    /// Create a client for the configured endpoint.
    #[cfg(feature = "remote")]
    pub fn connect(&self) -> source::error::Result<source::RemoteSource> {
        let tokenizer = source::HfTokenizer::from_file(self.tokenizer_json_path()?)?;
        source::RemoteSource::new(self.connection(), tokenizer)
    }
}

impl Default for Settings {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG_TOML).expect("embedded default.toml must be valid")
    }
}

/// Overlay user values on `base`, descending into tables present in both.
fn merge_into(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(inner)), toml::Value::Table(value)) => merge_into(inner, value),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Parse user TOML content merged on top of default.toml.
fn parse_with_defaults(user_content: &str) -> Result<Settings> {
    let mut merged: toml::Table = toml::from_str(DEFAULT_CONFIG_TOML)?;
    merge_into(&mut merged, toml::from_str(user_content)?);
    let settings: Settings = toml::Value::Table(merged).try_into()?;
    settings.classify.validate()?;
    Ok(settings)
}

impl Settings {
    /// `~/.config/complprob/config.toml` (platform equivalent elsewhere).
    pub fn config_file() -> Option<PathBuf> {
        ProjectDirs::from("com", "complprob", "complprob")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Settings from the user config file, or the embedded defaults when there is none.
    pub fn load() -> Result<Self> {
        match Self::config_file().filter(|path| path.exists()) {
            Some(path) => Self::load_from(&path),
            None => {
                debug!("No user config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load settings from a specific file, merged on top of defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!("Loading config from {}", path.display());
        let content = fs::read_to_string(path)?;
        parse_with_defaults(&content)
    }
}
