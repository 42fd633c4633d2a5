//! TOML-based model configuration
//!
//! All registered GGUF models are defined in `models.toml` at the crate root.
//! This module deserializes that file and provides a global registry for lookup.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Top-level config parsed from `models.toml`
#[derive(Debug, Deserialize)]
pub struct ModelRegistry {
    /// Default variant id (e.g. "smollm2-135m-q8")
    pub default_model: String,
    /// Model families keyed by short name (e.g. "tinyllama-v0")
    pub models: HashMap<String, ModelFamily>,
}

/// A model family (one HuggingFace repo, multiple quantisation variants)
#[derive(Debug, Deserialize)]
pub struct ModelFamily {
    pub repo_id: String,
    /// Repo holding `tokenizer.json` when it differs from `repo_id`
    #[serde(default)]
    pub tokenizer_repo_id: Option<String>,
    pub display_name: String,
    /// Quantisation variants keyed by short name (e.g. "q8", "f16")
    pub variants: HashMap<String, VariantConfig>,
}

impl ModelFamily {
    /// Repo to fetch `tokenizer.json` from.
    pub fn tokenizer_repo(&self) -> &str {
        self.tokenizer_repo_id.as_deref().unwrap_or(&self.repo_id)
    }
}

/// A single downloadable GGUF variant
#[derive(Debug, Deserialize)]
pub struct VariantConfig {
    /// Unique variant id (e.g. "tinyllama-v0-q8")
    pub id: String,
    /// GGUF filename in the HuggingFace repo
    pub filename: String,
    /// Human-readable name shown in listings
    pub display_name: String,
}

static REGISTRY: OnceLock<ModelRegistry> = OnceLock::new();

/// Return the global model registry, parsed once from the embedded `models.toml`.
pub fn registry() -> &'static ModelRegistry {
    REGISTRY.get_or_init(|| {
        let toml_str = include_str!("../../models.toml");
        toml::from_str(toml_str).expect("embedded models.toml must be valid")
    })
}

impl ModelRegistry {
    /// Look up a variant by its unique id (e.g. "tinyllama-v0-q8").
    ///
    /// Returns `(family, variant)` if found.
    pub fn find_variant(&self, variant_id: &str) -> Option<(&ModelFamily, &VariantConfig)> {
        self.iter_variants().find(|(_, variant)| variant.id == variant_id)
    }

    /// Return the default `(family, variant)` pair.
    pub fn default_variant(&self) -> Option<(&ModelFamily, &VariantConfig)> {
        self.find_variant(&self.default_model)
    }

    /// All variant ids across every model family, sorted.
    pub fn all_variant_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.iter_variants().map(|(_, v)| v.id.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    /// Iterate over all `(family, variant)` pairs.
    pub fn iter_variants(&self) -> impl Iterator<Item = (&ModelFamily, &VariantConfig)> {
        self.models
            .values()
            .flat_map(|f| f.variants.values().map(move |v| (f, v)))
    }
}
