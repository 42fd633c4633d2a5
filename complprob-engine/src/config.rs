//! Per-call classification options

use crate::error::{ClassifyError, Result};
use crate::posterior::TieBreak;
use crate::scorer::Aggregation;
use serde::{Deserialize, Serialize};

/// How completion tokens are derived from the text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Continuation {
    /// Encode `end_of_prompt + completion` on its own, without special
    /// tokens, and append it to the prompt tokens.
    #[default]
    Independent,
    /// Encode `prompt + end_of_prompt + completion` as one text. The prompt
    /// tokens must be a strict prefix of the result.
    Joint,
}

/// Options passed explicitly to every classification entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifyConfig {
    /// Maximum number of (prompt, completion) items per source call
    pub batch_size: usize,
    /// Separator between prompt and completion
    pub end_of_prompt: String,
    pub aggregation: Aggregation,
    pub tie_break: TieBreak,
    pub continuation: Continuation,
    /// Reuse the prompt's prefix state across its completions when the source supports it
    pub share_prompt_prefix: bool,
    /// Run the tokenizer's post-processor (e.g. BOS) on prompts
    pub add_special_tokens: bool,
    /// Weight of the prompt-free completion score subtracted from each score
    pub discount_completions: f64,
    /// Normalize each distribution to sum 1; off returns `exp(score) * prior`
    pub normalize: bool,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            end_of_prompt: " ".to_string(),
            aggregation: Aggregation::Mean,
            tie_break: TieBreak::FirstIndex,
            continuation: Continuation::Independent,
            share_prompt_prefix: true,
            add_special_tokens: true,
            discount_completions: 0.0,
            normalize: true,
        }
    }
}

impl ClassifyConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_end_of_prompt(mut self, end_of_prompt: impl Into<String>) -> Self {
        self.end_of_prompt = end_of_prompt.into();
        self
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    /// Check the options that can be wrong regardless of input.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ClassifyError::invalid("batch_size must be greater than 0"));
        }
        if !self.discount_completions.is_finite() || self.discount_completions < 0.0 {
            return Err(ClassifyError::invalid(format!(
                "discount_completions must be finite and non-negative, got {}",
                self.discount_completions
            )));
        }
        if let Aggregation::LengthNormalized { alpha } = self.aggregation {
            if !alpha.is_finite() {
                return Err(ClassifyError::invalid("length normalization alpha must be finite"));
            }
        }
        Ok(())
    }
}
