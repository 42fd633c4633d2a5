//! Posterior distribution over the completions of one unit
//!
//! Bayes' rule in the log domain: `score[i] + ln(prior[i])`, shifted by the
//! maximum before exponentiation and normalized by the sum. [`likelihood`]
//! skips the normalization and returns the joint values themselves.

use crate::error::{ClassifyError, Result};
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// Which index wins when several completions share the highest posterior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Lowest completion index wins.
    #[default]
    FirstIndex,
    /// Highest completion index wins.
    LastIndex,
}

/// Probabilities, one per completion, in completion order.
///
/// Built by [`posterior`] they sum to 1; built by [`likelihood`] they are the
/// unnormalized `exp(score) * prior` values.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Posterior(Vec<f64>);

impl Posterior {
    /// Index of the most probable completion.
    pub fn argmax(&self, tie_break: TieBreak) -> usize {
        let mut best = 0;
        for (i, &p) in self.0.iter().enumerate().skip(1) {
            let better = match tie_break {
                TieBreak::FirstIndex => p > self.0[best],
                TieBreak::LastIndex => p >= self.0[best],
            };
            if better {
                best = i;
            }
        }
        best
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.0
    }
}

impl Deref for Posterior {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.0
    }
}

impl From<Posterior> for Vec<f64> {
    fn from(p: Posterior) -> Self {
        p.0
    }
}

/// Validate a prior for `n` completions and normalize it to sum to 1.
///
/// `unit` is only used for error messages.
pub fn normalize_prior(prior: &[f64], n: usize, unit: Option<usize>) -> Result<Vec<f64>> {
    let fail = |message: String| match unit {
        Some(unit) => ClassifyError::invalid_unit(unit, message),
        None => ClassifyError::invalid(message),
    };
    if prior.len() != n {
        return Err(fail(format!(
            "prior has {} entries, expected {}",
            prior.len(),
            n
        )));
    }
    if let Some(bad) = prior.iter().find(|p| !p.is_finite() || **p < 0.0) {
        return Err(fail(format!(
            "prior entries must be finite and non-negative, got {}",
            bad
        )));
    }
    let total: f64 = prior.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return Err(fail("prior must have a positive, finite sum".to_string()));
    }
    Ok(prior.iter().map(|p| p / total).collect())
}

/// Combine completion scores with a prior (uniform when `None`).
///
/// A zero prior entry yields exactly zero. Identical scores with a uniform
/// prior yield exactly `1 / n` for every entry. NaN scores, or scores that
/// leave no finite mass after the prior, are [`ClassifyError::DegenerateScores`].
pub fn posterior(scores: &[f64], prior: Option<&[f64]>, unit: usize) -> Result<Posterior> {
    check_scores(scores, prior, unit)?;

    // The uniform prior adds the same constant to every entry, which the
    // max shift cancels, so it is left out.
    let log_joint: Vec<f64> = match prior {
        Some(prior) => scores
            .iter()
            .zip(prior)
            .map(|(s, p)| if *p == 0.0 { f64::NEG_INFINITY } else { s + p.ln() })
            .collect(),
        None => scores.to_vec(),
    };

    let max = log_joint.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return Err(ClassifyError::DegenerateScores { unit });
    }

    let weights: Vec<f64> = log_joint.iter().map(|u| (u - max).exp()).collect();
    let total: f64 = weights.iter().sum();
    Ok(Posterior(weights.into_iter().map(|w| w / total).collect()))
}

/// `exp(score[i]) * prior[i]` without normalization, or `exp(score[i])`
/// when there is no prior. A zero prior entry yields exactly zero.
pub fn likelihood(scores: &[f64], prior: Option<&[f64]>, unit: usize) -> Result<Posterior> {
    check_scores(scores, prior, unit)?;
    Ok(Posterior(
        scores
            .iter()
            .enumerate()
            .map(|(i, s)| match prior {
                Some(prior) if prior[i] == 0.0 => 0.0,
                Some(prior) => s.exp() * prior[i],
                None => s.exp(),
            })
            .collect(),
    ))
}

fn check_scores(scores: &[f64], prior: Option<&[f64]>, unit: usize) -> Result<()> {
    if scores.is_empty() {
        return Err(ClassifyError::invalid_unit(unit, "no completions to score"));
    }
    if scores.iter().any(|s| s.is_nan()) {
        return Err(ClassifyError::DegenerateScores { unit });
    }
    match prior {
        Some(prior) if prior.len() != scores.len() => Err(ClassifyError::invalid_unit(
            unit,
            format!(
                "prior has {} entries, expected {}",
                prior.len(),
                scores.len()
            ),
        )),
        _ => Ok(()),
    }
}
