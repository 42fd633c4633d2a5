//! Model files from the HuggingFace Hub
//!
//! Files already in the local HuggingFace cache are used without touching
//! the network; anything else is fetched once and cached.

use super::error::{Result, SourceError};
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Cache, Repo};
use std::path::PathBuf;

/// Local path of `filename` in the model repo `repo_id`.
///
/// Set `HF_TOKEN` for private repositories.
pub fn download_file(repo_id: &str, filename: &str) -> Result<PathBuf> {
    let cache = Cache::from_env();
    if let Some(path) = cache.repo(Repo::model(repo_id.to_string())).get(filename) {
        tracing::debug!("Using cached {} from {}", filename, repo_id);
        return Ok(path);
    }

    let api = ApiBuilder::new()
        .with_cache_dir(cache.path().clone())
        .with_token(std::env::var("HF_TOKEN").ok())
        .build()
        .map_err(|e| SourceError::Download(e.into()))?;

    tracing::info!("Downloading {} from {}...", filename, repo_id);
    let path = api
        .model(repo_id.to_string())
        .get(filename)
        .map_err(|e| SourceError::Download(e.into()))?;
    tracing::info!("Downloaded to {}", path.display());
    Ok(path)
}
