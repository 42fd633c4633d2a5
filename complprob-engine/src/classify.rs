//! Classification entry points
//!
//! Two input shapes are supported: a completion set shared by every prompt
//! ([`predict_proba`], [`predict`]) and per-prompt units with their own
//! completions and priors ([`predict_proba_examples`], [`predict_examples`]).
//! Input is validated and fully tokenized before the model is called, so a
//! bad input never costs a model call.

use crate::config::ClassifyConfig;
use crate::error::{ClassifyError, Result};
use crate::posterior::{Posterior, likelihood, normalize_prior, posterior};
use crate::schedule::{CompletionLogProbs, EncodedUnit, encode_unit, score_units};
use crate::scorer::{score_completion, score_discounted};
use crate::source::{LogProbSource, TokenId, Tokenize};
use crate::unit::ClassificationUnit;

/// Posterior over `completions` for every prompt, in prompt order.
///
/// `prior` applies to every prompt and defaults to uniform. When
/// `config.discount_completions` is positive, each score is reduced by the
/// discounted score of the completion without the prompt, which needs a
/// tokenizer that prepends a special token such as BOS.
pub fn predict_proba<M, P, C>(
    prompts: &[P],
    completions: &[C],
    model: &mut M,
    prior: Option<&[f64]>,
    config: &ClassifyConfig,
) -> Result<Vec<Posterior>>
where
    M: Tokenize + LogProbSource + ?Sized,
    P: AsRef<str>,
    C: AsRef<str>,
{
    let prior = validate_shared(prompts, completions, prior, config)?;
    let marginal_units = if config.discount_completions > 0.0 {
        Some(encode_marginal(completions, &*model, config)?)
    } else {
        None
    };

    let log_probs = conditional_shared(prompts, completions, model, config)?;
    let marginal = match marginal_units {
        Some(units) => Some(score_marginal(model, &units, config)?),
        None => None,
    };
    shared_posteriors(&log_probs, marginal.as_deref(), prior.as_deref(), config)
}

/// [`predict_proba`] with the prompt-free completion log-probabilities
/// already computed by [`log_probs_marginal`].
///
/// The marginals are weighted by `config.discount_completions`, so the same
/// marginals can be reused across calls without scoring them again.
pub fn predict_proba_with_marginals<M, P, C>(
    prompts: &[P],
    completions: &[C],
    model: &mut M,
    prior: Option<&[f64]>,
    marginals: &[Vec<f32>],
    config: &ClassifyConfig,
) -> Result<Vec<Posterior>>
where
    M: Tokenize + LogProbSource + ?Sized,
    P: AsRef<str>,
    C: AsRef<str>,
{
    let prior = validate_shared(prompts, completions, prior, config)?;
    if marginals.len() != completions.len() {
        return Err(ClassifyError::invalid(format!(
            "got {} marginals for {} completions",
            marginals.len(),
            completions.len()
        )));
    }
    let log_probs = conditional_shared(prompts, completions, model, config)?;
    shared_posteriors(&log_probs, Some(marginals), prior.as_deref(), config)
}

/// Most probable completion for every prompt.
pub fn predict<M, P, C>(
    prompts: &[P],
    completions: &[C],
    model: &mut M,
    prior: Option<&[f64]>,
    config: &ClassifyConfig,
) -> Result<Vec<String>>
where
    M: Tokenize + LogProbSource + ?Sized,
    P: AsRef<str>,
    C: AsRef<str>,
{
    let posteriors = predict_proba(prompts, completions, model, prior, config)?;
    Ok(posteriors
        .iter()
        .map(|p| completions[p.argmax(config.tie_break)].as_ref().to_string())
        .collect())
}

/// Posterior over each unit's own completions, one independently sized
/// distribution per unit.
///
/// A unit's `end_of_prompt` and `normalize` override the config. Completion
/// discounting does not apply to units.
pub fn predict_proba_examples<M>(
    units: &[ClassificationUnit],
    model: &mut M,
    config: &ClassifyConfig,
) -> Result<Vec<Posterior>>
where
    M: Tokenize + LogProbSource + ?Sized,
{
    let log_probs = conditional_units(units, model, config)?;
    log_probs
        .iter()
        .zip(units)
        .enumerate()
        .map(|(i, (per_completion, unit))| {
            let scores: Vec<f64> = per_completion
                .iter()
                .map(|lps| score_completion(lps, &config.aggregation))
                .collect();
            let normalize = unit.normalize().unwrap_or(config.normalize);
            combine(&scores, unit.prior(), normalize, i)
        })
        .collect()
}

/// Most probable completion of every unit.
pub fn predict_examples<M>(
    units: &[ClassificationUnit],
    model: &mut M,
    config: &ClassifyConfig,
) -> Result<Vec<String>>
where
    M: Tokenize + LogProbSource + ?Sized,
{
    let posteriors = predict_proba_examples(units, model, config)?;
    Ok(posteriors
        .iter()
        .zip(units)
        .map(|(p, unit)| unit.completions()[p.argmax(config.tie_break)].clone())
        .collect())
}

/// Per-token log-probabilities of every completion given every prompt:
/// `[prompt][completion][token]`.
pub fn log_probs_conditional<M, P, C>(
    prompts: &[P],
    completions: &[C],
    model: &mut M,
    config: &ClassifyConfig,
) -> Result<CompletionLogProbs>
where
    M: Tokenize + LogProbSource + ?Sized,
    P: AsRef<str>,
    C: AsRef<str>,
{
    validate_shared(prompts, completions, None, config)?;
    conditional_shared(prompts, completions, model, config)
}

/// Per-token log-probabilities of each completion without a prompt:
/// `[completion][token]`.
///
/// Each completion is scored right after the tokenizer's special prefix, so
/// a tokenizer that prepends nothing is rejected as invalid input.
pub fn log_probs_marginal<M, C>(
    completions: &[C],
    model: &mut M,
    config: &ClassifyConfig,
) -> Result<Vec<Vec<f32>>>
where
    M: Tokenize + LogProbSource + ?Sized,
    C: AsRef<str>,
{
    config.validate()?;
    if completions.is_empty() {
        return Err(ClassifyError::invalid("completions must not be empty"));
    }
    let units = encode_marginal(completions, &*model, config)?;
    score_marginal(model, &units, config)
}

/// Per-token log-probabilities of each unit's completions: `[unit][completion][token]`.
pub fn log_probs_conditional_examples<M>(
    units: &[ClassificationUnit],
    model: &mut M,
    config: &ClassifyConfig,
) -> Result<CompletionLogProbs>
where
    M: Tokenize + LogProbSource + ?Sized,
{
    conditional_units(units, model, config)
}

/// Log-probability of every token of every text given the tokens before it.
///
/// Values are aligned with the text's own tokens. Special tokens the
/// tokenizer prepends (e.g. BOS) are not reported but serve as context, so
/// the first token carries `None` only when nothing was prepended.
pub fn token_logprobs<M, T>(
    texts: &[T],
    model: &mut M,
    config: &ClassifyConfig,
) -> Result<Vec<Vec<Option<f32>>>>
where
    M: Tokenize + LogProbSource + ?Sized,
    T: AsRef<str>,
{
    config.validate()?;
    if texts.is_empty() {
        return Err(ClassifyError::invalid("texts must not be empty"));
    }
    let special = special_prefix(&*model, config.add_special_tokens)?;

    let encoded: Vec<(Vec<TokenId>, usize)> = texts
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let ids = model
                .encode(text.as_ref(), config.add_special_tokens)
                .map_err(|e| ClassifyError::invalid_unit(i, format!("cannot tokenize text: {}", e)))?;
            let skip = if !special.is_empty() && ids.starts_with(&special) {
                special.len()
            } else {
                0
            };
            Ok((ids, skip))
        })
        .collect::<Result<_>>()?;

    // texts of fewer than two tokens need no model call
    let scorable: Vec<usize> = (0..encoded.len())
        .filter(|&i| encoded[i].0.len() >= 2)
        .collect();
    let mut scored: Vec<Vec<f32>> = vec![Vec::new(); encoded.len()];
    for (batch_idx, batch) in scorable.chunks(config.batch_size).enumerate() {
        let refs: Vec<&[TokenId]> = batch.iter().map(|&i| encoded[i].0.as_slice()).collect();
        let fail = |source| ClassifyError::Source {
            batch: batch_idx,
            unit: batch[0],
            source,
        };
        let lps = model.score_batch(&refs).map_err(fail)?;
        if lps.len() != batch.len() {
            return Err(fail(crate::source::SourceError::InvalidResponse(format!(
                "got {} results for {} sequences",
                lps.len(),
                batch.len()
            ))));
        }
        for (&i, lps) in batch.iter().zip(lps) {
            scored[i] = lps;
        }
    }

    Ok(encoded
        .iter()
        .zip(scored)
        .map(|(&(ref ids, skip), lps)| {
            if ids.len() == skip {
                return Vec::new();
            }
            if skip > 0 {
                lps[skip - 1..].iter().copied().map(Some).collect()
            } else {
                std::iter::once(None)
                    .chain(lps.into_iter().map(Some))
                    .collect()
            }
        })
        .collect())
}

fn validate_shared<P, C>(
    prompts: &[P],
    completions: &[C],
    prior: Option<&[f64]>,
    config: &ClassifyConfig,
) -> Result<Option<Vec<f64>>> {
    config.validate()?;
    if prompts.is_empty() {
        return Err(ClassifyError::invalid("prompts must not be empty"));
    }
    if completions.is_empty() {
        return Err(ClassifyError::invalid("completions must not be empty"));
    }
    prior
        .map(|prior| normalize_prior(prior, completions.len(), None))
        .transpose()
}

fn conditional_shared<M, P, C>(
    prompts: &[P],
    completions: &[C],
    model: &mut M,
    config: &ClassifyConfig,
) -> Result<CompletionLogProbs>
where
    M: Tokenize + LogProbSource + ?Sized,
    P: AsRef<str>,
    C: AsRef<str>,
{
    let encoded = prompts
        .iter()
        .enumerate()
        .map(|(i, prompt)| {
            encode_unit(
                &*model,
                prompt.as_ref(),
                completions,
                &config.end_of_prompt,
                config,
                i,
            )
        })
        .collect::<Result<Vec<_>>>()?;
    score_units(model, &encoded, config.batch_size, config.share_prompt_prefix)
}

fn conditional_units<M>(
    units: &[ClassificationUnit],
    model: &mut M,
    config: &ClassifyConfig,
) -> Result<CompletionLogProbs>
where
    M: Tokenize + LogProbSource + ?Sized,
{
    config.validate()?;
    if units.is_empty() {
        return Err(ClassifyError::invalid("units must not be empty"));
    }
    let encoded = units
        .iter()
        .enumerate()
        .map(|(i, unit)| {
            let end_of_prompt = unit.end_of_prompt().unwrap_or(&config.end_of_prompt);
            encode_unit(
                &*model,
                unit.prompt(),
                unit.completions(),
                end_of_prompt,
                config,
                i,
            )
        })
        .collect::<Result<Vec<_>>>()?;
    score_units(model, &encoded, config.batch_size, config.share_prompt_prefix)
}

/// Tokens the tokenizer adds in front of every text, e.g. `[BOS]`.
fn special_prefix<M>(model: &M, add_special_tokens: bool) -> Result<Vec<TokenId>>
where
    M: Tokenize + ?Sized,
{
    if !add_special_tokens {
        return Ok(Vec::new());
    }
    model
        .encode("", true)
        .map_err(|e| ClassifyError::invalid(format!("cannot tokenize the empty text: {}", e)))
}

fn combine(
    scores: &[f64],
    prior: Option<&[f64]>,
    normalize: bool,
    unit: usize,
) -> Result<Posterior> {
    if normalize {
        posterior(scores, prior, unit)
    } else {
        likelihood(scores, prior, unit)
    }
}

fn shared_posteriors(
    log_probs: &CompletionLogProbs,
    marginal: Option<&[Vec<f32>]>,
    prior: Option<&[f64]>,
    config: &ClassifyConfig,
) -> Result<Vec<Posterior>> {
    log_probs
        .iter()
        .enumerate()
        .map(|(unit, per_completion)| {
            let scores: Vec<f64> = per_completion
                .iter()
                .enumerate()
                .map(|(j, lps)| match marginal {
                    Some(marginal) => score_discounted(
                        lps,
                        &marginal[j],
                        config.discount_completions,
                        &config.aggregation,
                    ),
                    None => score_completion(lps, &config.aggregation),
                })
                .collect();
            combine(&scores, prior, config.normalize, unit)
        })
        .collect()
}

/// Each completion as its own unit behind the tokenizer's special prefix.
///
/// Without a special prefix the first completion token would have no
/// context to be scored against, so that case is rejected.
fn encode_marginal<M, C>(
    completions: &[C],
    model: &M,
    config: &ClassifyConfig,
) -> Result<Vec<EncodedUnit>>
where
    M: Tokenize + ?Sized,
    C: AsRef<str>,
{
    let special = special_prefix(model, true)?;
    if special.is_empty() {
        return Err(ClassifyError::invalid(
            "discounting completions needs a tokenizer that prepends a special token such as BOS",
        ));
    }
    completions
        .iter()
        .enumerate()
        .map(|(j, completion)| {
            let tokenization = |reason: String| ClassifyError::Tokenization {
                unit: 0,
                completion: j,
                reason,
            };
            let ids = model
                .encode(
                    &format!("{}{}", config.end_of_prompt, completion.as_ref()),
                    false,
                )
                .map_err(|e| tokenization(e.to_string()))?;
            if ids.is_empty() {
                return Err(tokenization("completion encodes to no tokens".to_string()));
            }
            Ok(EncodedUnit {
                prompt: special.clone(),
                completions: vec![ids],
            })
        })
        .collect()
}

fn score_marginal<M>(
    model: &mut M,
    units: &[EncodedUnit],
    config: &ClassifyConfig,
) -> Result<Vec<Vec<f32>>>
where
    M: LogProbSource + ?Sized,
{
    tracing::debug!("Scoring {} completions without prompt", units.len());
    let scored = score_units(model, units, config.batch_size, config.share_prompt_prefix)?;
    Ok(scored
        .into_iter()
        .map(|mut lps| lps.pop().unwrap_or_default())
        .collect())
}
