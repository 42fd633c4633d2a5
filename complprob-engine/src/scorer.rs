//! Completion scoring
//!
//! Turns the per-token log-probabilities of one completion into a single
//! score. The source returns the log-probability of `tokens[1..]` for a full
//! `prompt ++ completion` sequence; only the positions that belong to the
//! completion count.

use serde::{Deserialize, Serialize};

/// How per-token log-probabilities of a completion are reduced to one score.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Arithmetic mean. Makes completions of different token lengths comparable.
    #[default]
    Mean,
    /// Plain sum, i.e. the log-probability of the whole completion.
    Sum,
    /// `sum / len^alpha`. `alpha = 0` is `Sum`, `alpha = 1` is `Mean`.
    LengthNormalized { alpha: f64 },
    /// Caller-provided reduction. Not representable in settings files.
    #[serde(skip)]
    Custom(fn(&[f64]) -> f64),
}

impl Aggregation {
    /// Reduce `log_probs` to one value. Callers guarantee a non-empty slice.
    pub fn apply(&self, log_probs: &[f64]) -> f64 {
        let sum: f64 = log_probs.iter().sum();
        let len = log_probs.len() as f64;
        match self {
            Aggregation::Mean => sum / len,
            Aggregation::Sum => sum,
            Aggregation::LengthNormalized { alpha } => sum / len.powf(*alpha),
            Aggregation::Custom(f) => f(log_probs),
        }
    }
}

/// Slice the completion's log-probabilities out of a full-sequence result.
///
/// `sequence_log_probs[i]` is the log-probability of token `i + 1`, so the
/// first completion token (at position `prompt_len`) sits at index
/// `prompt_len - 1`. Returns `None` when the lengths do not line up.
pub fn completion_log_probs(sequence_log_probs: &[f32], prompt_len: usize) -> Option<&[f32]> {
    if prompt_len == 0 || prompt_len > sequence_log_probs.len() {
        return None;
    }
    Some(&sequence_log_probs[prompt_len - 1..])
}

/// Score one completion from its per-token log-probabilities.
pub fn score_completion(log_probs: &[f32], aggregation: &Aggregation) -> f64 {
    let values: Vec<f64> = log_probs.iter().map(|&lp| f64::from(lp)).collect();
    aggregation.apply(&values)
}

/// Score with a marginal discount: `agg(conditional) - discount * agg(marginal)`.
///
/// An empty `marginal` contributes nothing.
pub fn score_discounted(
    conditional: &[f32],
    marginal: &[f32],
    discount: f64,
    aggregation: &Aggregation,
) -> f64 {
    let score = score_completion(conditional, aggregation);
    if discount == 0.0 || marginal.is_empty() {
        return score;
    }
    score - discount * score_completion(marginal, aggregation)
}
