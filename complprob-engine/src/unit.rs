//! A prompt with its own candidate completions

use crate::error::{ClassifyError, Result};
use crate::posterior::normalize_prior;
use serde::{Deserialize, Serialize};

/// One prompt, its candidate completions and an optional prior over them.
///
/// The constructor validates the unit, so every instance holds at least one
/// completion and, when present, a prior normalized to sum 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawUnit")]
pub struct ClassificationUnit {
    prompt: String,
    completions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prior: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_of_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    normalize: Option<bool>,
}

#[derive(Deserialize)]
struct RawUnit {
    prompt: String,
    completions: Vec<String>,
    #[serde(default)]
    prior: Option<Vec<f64>>,
    #[serde(default)]
    end_of_prompt: Option<String>,
    #[serde(default)]
    normalize: Option<bool>,
}

impl TryFrom<RawUnit> for ClassificationUnit {
    type Error = ClassifyError;

    fn try_from(raw: RawUnit) -> Result<Self> {
        let unit = ClassificationUnit::new(raw.prompt, raw.completions)?;
        let unit = match raw.prior {
            Some(prior) => unit.with_prior(prior)?,
            None => unit,
        };
        let unit = match raw.end_of_prompt {
            Some(eop) => unit.with_end_of_prompt(eop),
            None => unit,
        };
        Ok(match raw.normalize {
            Some(normalize) => unit.with_normalize(normalize),
            None => unit,
        })
    }
}

impl ClassificationUnit {
    /// Create a unit with a uniform prior. Fails on an empty completion list.
    pub fn new<P, I, S>(prompt: P, completions: I) -> Result<Self>
    where
        P: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let completions: Vec<String> = completions.into_iter().map(Into::into).collect();
        if completions.is_empty() {
            return Err(ClassifyError::invalid("completions must not be empty"));
        }
        Ok(Self {
            prompt: prompt.into(),
            completions,
            prior: None,
            end_of_prompt: None,
            normalize: None,
        })
    }

    /// Attach a prior. It is validated against the completion count and
    /// normalized to sum 1.
    pub fn with_prior(mut self, prior: impl Into<Vec<f64>>) -> Result<Self> {
        let prior = prior.into();
        self.prior = Some(normalize_prior(&prior, self.completions.len(), None)?);
        Ok(self)
    }

    /// Override the separator placed between this unit's prompt and its completions.
    pub fn with_end_of_prompt(mut self, end_of_prompt: impl Into<String>) -> Self {
        self.end_of_prompt = Some(end_of_prompt.into());
        self
    }

    /// Override whether this unit's distribution is normalized.
    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = Some(normalize);
        self
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn completions(&self) -> &[String] {
        &self.completions
    }

    /// Normalized prior, `None` meaning uniform.
    pub fn prior(&self) -> Option<&[f64]> {
        self.prior.as_deref()
    }

    pub fn end_of_prompt(&self) -> Option<&str> {
        self.end_of_prompt.as_deref()
    }

    pub fn normalize(&self) -> Option<bool> {
        self.normalize
    }
}
