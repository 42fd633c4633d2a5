//! HuggingFace `tokenizer.json` adapter

use super::error::{Result, SourceError};
use super::{TokenId, Tokenize};
use std::path::Path;

/// External HuggingFace tokenizer.
///
/// Used by both sources so that prompt and completion token ids come from
/// the same vocabulary the model was trained with.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    /// Load and configure a tokenizer from a `tokenizer.json` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut inner =
            tokenizers::Tokenizer::from_file(path.as_ref()).map_err(SourceError::TokenizerLoad)?;
        // Padding and truncation would change the token ids we score.
        inner.with_padding(None);
        inner
            .with_truncation(None)
            .map_err(SourceError::TokenizerLoad)?;
        Ok(Self { inner })
    }
}

impl Tokenize for HfTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<TokenId>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(SourceError::Tokenize)?;
        Ok(encoding.get_ids().to_vec())
    }
}
