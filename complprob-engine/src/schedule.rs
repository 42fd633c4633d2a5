//! Batch planning and execution
//!
//! Every unit is tokenized before the first source call. The flattened
//! (unit, completion) work items are cut into batches of at most
//! `batch_size` items in input order, and results are scattered back into
//! per-unit slots, so batching never changes what is returned.
//!
//! When the source keeps prefix state, a prompt is prefilled once and all of
//! its completions are scored against it. Only the current prefix is held,
//! which is enough because items of one unit are consecutive in the plan.
//! Consecutive units with identical prompt tokens share one prefill.

use crate::config::{ClassifyConfig, Continuation};
use crate::error::{ClassifyError, Result};
use crate::scorer::completion_log_probs;
use crate::source::{LogProbSource, SourceError, TokenId, Tokenize};

/// Token ids of one unit: the prompt and the scorable tokens of each completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedUnit {
    pub prompt: Vec<TokenId>,
    pub completions: Vec<Vec<TokenId>>,
}

/// Encode a prompt and its completions.
///
/// Scorable tokens are the completion's own tokens after the prompt: the
/// encoding of `end_of_prompt + completion` without special tokens for
/// [`Continuation::Independent`], or the suffix of the joint encoding beyond
/// the prompt tokens for [`Continuation::Joint`]. A completion without any
/// scorable token is a [`ClassifyError::Tokenization`] error.
pub fn encode_unit<T, S>(
    tokenizer: &T,
    prompt: &str,
    completions: &[S],
    end_of_prompt: &str,
    config: &ClassifyConfig,
    unit: usize,
) -> Result<EncodedUnit>
where
    T: Tokenize + ?Sized,
    S: AsRef<str>,
{
    let prompt_ids = tokenizer
        .encode(prompt, config.add_special_tokens)
        .map_err(|e| ClassifyError::invalid_unit(unit, format!("cannot tokenize prompt: {}", e)))?;
    if prompt_ids.is_empty() {
        return Err(ClassifyError::invalid_unit(
            unit,
            "prompt encodes to no tokens, nothing to condition the completions on",
        ));
    }

    let mut encoded = Vec::with_capacity(completions.len());
    for (index, completion) in completions.iter().enumerate() {
        let tokenization = |reason: String| ClassifyError::Tokenization {
            unit,
            completion: index,
            reason,
        };
        let completion = completion.as_ref();
        let ids = match config.continuation {
            Continuation::Independent => tokenizer
                .encode(&format!("{}{}", end_of_prompt, completion), false)
                .map_err(|e| tokenization(e.to_string()))?,
            Continuation::Joint => {
                let full = tokenizer
                    .encode(
                        &format!("{}{}{}", prompt, end_of_prompt, completion),
                        config.add_special_tokens,
                    )
                    .map_err(|e| tokenization(e.to_string()))?;
                if !full.starts_with(&prompt_ids) {
                    return Err(tokenization(
                        "prompt tokens are not a prefix of the prompt+completion tokens".into(),
                    ));
                }
                full[prompt_ids.len()..].to_vec()
            }
        };
        if ids.is_empty() {
            return Err(tokenization(format!(
                "completion {:?} has no tokens after the prompt",
                completion
            )));
        }
        encoded.push(ids);
    }

    Ok(EncodedUnit {
        prompt: prompt_ids,
        completions: encoded,
    })
}

/// One (unit, completion) pair to score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub unit: usize,
    pub completion: usize,
}

/// All work items of one call, in input order, cut into batches.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    items: Vec<WorkItem>,
    batch_size: usize,
}

impl BatchPlan {
    /// Build a plan from the completion count of every unit.
    ///
    /// A `batch_size` of 0 is treated as 1.
    pub fn new(completion_counts: impl IntoIterator<Item = usize>, batch_size: usize) -> Self {
        let items = completion_counts
            .into_iter()
            .enumerate()
            .flat_map(|(unit, count)| {
                (0..count).map(move |completion| WorkItem { unit, completion })
            })
            .collect();
        Self {
            items,
            batch_size: batch_size.max(1),
        }
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.items.len().div_ceil(self.batch_size)
    }

    pub fn batches(&self) -> impl Iterator<Item = &[WorkItem]> {
        self.items.chunks(self.batch_size)
    }
}

/// Per-token log-probabilities of every completion: `[unit][completion][token]`.
pub type CompletionLogProbs = Vec<Vec<Vec<f32>>>;

/// Score every completion of every unit.
///
/// Uses prefix state when `share_prefix` is set and the source supports it,
/// and full `prompt ++ completion` sequences otherwise. Both paths return
/// the same values up to the source's numerical noise.
pub fn score_units<S>(
    source: &mut S,
    units: &[EncodedUnit],
    batch_size: usize,
    share_prefix: bool,
) -> Result<CompletionLogProbs>
where
    S: LogProbSource + ?Sized,
{
    let plan = BatchPlan::new(units.iter().map(|u| u.completions.len()), batch_size);
    let use_prefix = share_prefix && source.supports_prefix_state();
    tracing::debug!(
        "Planned {} items for {} units in {} batches (prefix sharing: {})",
        plan.len(),
        units.len(),
        plan.num_batches(),
        use_prefix
    );

    let mut results: CompletionLogProbs = units
        .iter()
        .map(|u| vec![Vec::new(); u.completions.len()])
        .collect();

    let mut runner = if use_prefix {
        Runner::Prefix { current: None }
    } else {
        Runner::Full
    };
    for (batch_idx, batch) in plan.batches().enumerate() {
        tracing::debug!(
            "Scoring batch {}/{} ({} items)",
            batch_idx + 1,
            plan.num_batches(),
            batch.len()
        );
        runner.run(source, units, batch, batch_idx, &mut results)?;
    }
    Ok(results)
}

enum Runner<P> {
    Full,
    /// Prefix state of the unit whose completions are being scored.
    Prefix { current: Option<(usize, P)> },
}

impl<P> Runner<P> {
    fn run<S>(
        &mut self,
        source: &mut S,
        units: &[EncodedUnit],
        batch: &[WorkItem],
        batch_idx: usize,
        results: &mut CompletionLogProbs,
    ) -> Result<()>
    where
        S: LogProbSource<Prefix = P> + ?Sized,
    {
        match self {
            Runner::Full => run_full(source, units, batch, batch_idx, results),
            Runner::Prefix { current } => {
                for group in batch.chunk_by(|a, b| a.unit == b.unit) {
                    let unit = group[0].unit;
                    let fail = |err| ClassifyError::Source {
                        batch: batch_idx,
                        unit,
                        source: err,
                    };
                    let encoded = &units[unit];

                    let prefix = match current.take() {
                        Some((u, prefix)) if u == unit || units[u].prompt == encoded.prompt => {
                            &current.insert((unit, prefix)).1
                        }
                        stale => {
                            // release the previous unit's state before building the next one
                            drop(stale);
                            let prefix = source.prefill(&encoded.prompt).map_err(fail)?;
                            &current.insert((unit, prefix)).1
                        }
                    };

                    let continuations: Vec<&[TokenId]> = group
                        .iter()
                        .map(|item| encoded.completions[item.completion].as_slice())
                        .collect();
                    let scored = source
                        .score_with_prefix(prefix, &continuations)
                        .map_err(fail)?;
                    if scored.len() != group.len() {
                        return Err(fail(SourceError::InvalidResponse(format!(
                            "got {} results for {} continuations",
                            scored.len(),
                            group.len()
                        ))));
                    }
                    for (item, lps) in group.iter().zip(scored) {
                        let expected = encoded.completions[item.completion].len();
                        if lps.len() != expected {
                            return Err(fail(SourceError::InvalidResponse(format!(
                                "got {} log-probabilities for {} continuation tokens",
                                lps.len(),
                                expected
                            ))));
                        }
                        results[unit][item.completion] = lps;
                    }
                }
                Ok(())
            }
        }
    }
}

fn run_full<S>(
    source: &mut S,
    units: &[EncodedUnit],
    batch: &[WorkItem],
    batch_idx: usize,
    results: &mut CompletionLogProbs,
) -> Result<()>
where
    S: LogProbSource + ?Sized,
{
    let fail = |unit, source| ClassifyError::Source {
        batch: batch_idx,
        unit,
        source,
    };
    let sequences: Vec<Vec<TokenId>> = batch
        .iter()
        .map(|item| {
            let encoded = &units[item.unit];
            let mut seq = encoded.prompt.clone();
            seq.extend_from_slice(&encoded.completions[item.completion]);
            seq
        })
        .collect();
    let refs: Vec<&[TokenId]> = sequences.iter().map(Vec::as_slice).collect();

    let scored = source
        .score_batch(&refs)
        .map_err(|e| fail(batch[0].unit, e))?;
    if scored.len() != batch.len() {
        return Err(fail(
            batch[0].unit,
            SourceError::InvalidResponse(format!(
                "got {} results for {} sequences",
                scored.len(),
                batch.len()
            )),
        ));
    }

    for (item, lps) in batch.iter().zip(scored) {
        let encoded = &units[item.unit];
        let expected = encoded.completions[item.completion].len();
        let completion = completion_log_probs(&lps, encoded.prompt.len())
            .filter(|c| c.len() == expected)
            .ok_or_else(|| {
                fail(
                    item.unit,
                    SourceError::InvalidResponse(format!(
                        "got {} log-probabilities for a sequence of {} tokens",
                        lps.len(),
                        encoded.prompt.len() + expected
                    )),
                )
            })?;
        results[item.unit][item.completion] = completion.to_vec();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::error::Result as SourceResult;

    /// One token per character; `^` stands for BOS.
    struct CharTokenizer;

    impl Tokenize for CharTokenizer {
        fn encode(&self, text: &str, add_special_tokens: bool) -> SourceResult<Vec<TokenId>> {
            let mut ids: Vec<TokenId> = if add_special_tokens { vec![1] } else { vec![] };
            ids.extend(text.chars().map(|c| c as TokenId));
            Ok(ids)
        }
    }

    /// Log-probability of a token is `-(token % 7) - 0.01 * previous`.
    struct ArithSource {
        prefix: bool,
        prefills: usize,
        batch_calls: usize,
    }

    fn lp(prev: TokenId, tok: TokenId) -> f32 {
        -((tok % 7) as f32) - 0.01 * prev as f32
    }

    impl LogProbSource for ArithSource {
        type Prefix = Vec<TokenId>;

        fn supports_prefix_state(&self) -> bool {
            self.prefix
        }

        fn score_batch(&mut self, sequences: &[&[TokenId]]) -> SourceResult<Vec<Vec<f32>>> {
            self.batch_calls += 1;
            Ok(sequences
                .iter()
                .map(|s| s.windows(2).map(|w| lp(w[0], w[1])).collect())
                .collect())
        }

        fn prefill(&mut self, prefix: &[TokenId]) -> SourceResult<Vec<TokenId>> {
            self.prefills += 1;
            Ok(prefix.to_vec())
        }

        fn score_with_prefix(
            &mut self,
            prefix: &Vec<TokenId>,
            continuations: &[&[TokenId]],
        ) -> SourceResult<Vec<Vec<f32>>> {
            Ok(continuations
                .iter()
                .map(|c| {
                    let mut prev = *prefix.last().unwrap();
                    c.iter()
                        .map(|&t| {
                            let v = lp(prev, t);
                            prev = t;
                            v
                        })
                        .collect()
                })
                .collect())
        }
    }

    fn source(prefix: bool) -> ArithSource {
        ArithSource {
            prefix,
            prefills: 0,
            batch_calls: 0,
        }
    }

    #[test]
    fn test_encode_independent() {
        let config = ClassifyConfig::default();
        let unit = encode_unit(&CharTokenizer, "ab", &["c", "de"], " ", &config, 0).unwrap();
        assert_eq!(unit.prompt, vec![1, 'a' as u32, 'b' as u32]);
        assert_eq!(unit.completions[0], vec![' ' as u32, 'c' as u32]);
        assert_eq!(unit.completions[1].len(), 3);
    }

    #[test]
    fn test_encode_joint() {
        let config = ClassifyConfig {
            continuation: Continuation::Joint,
            ..Default::default()
        };
        let unit = encode_unit(&CharTokenizer, "ab", &["c"], "", &config, 0).unwrap();
        assert_eq!(unit.completions[0], vec!['c' as u32]);
    }

    #[test]
    fn test_empty_completion_is_a_tokenization_error() {
        let config = ClassifyConfig::default();
        let err = encode_unit(&CharTokenizer, "ab", &["x", ""], "", &config, 5).unwrap_err();
        assert!(matches!(
            err,
            ClassifyError::Tokenization {
                unit: 5,
                completion: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_plan_preserves_order_and_bounds_batches() {
        let plan = BatchPlan::new([2, 3], 2);
        assert_eq!(plan.len(), 5);
        assert_eq!(plan.num_batches(), 3);
        let batches: Vec<_> = plan.batches().collect();
        assert_eq!(batches[0], &[WorkItem { unit: 0, completion: 0 }, WorkItem { unit: 0, completion: 1 }]);
        assert_eq!(batches[1][0], WorkItem { unit: 1, completion: 0 });
        assert_eq!(batches[2].len(), 1);

        let single = BatchPlan::new([2, 3], 100);
        assert_eq!(single.num_batches(), 1);
        assert_eq!(BatchPlan::new([1], 0).num_batches(), 1);
    }

    #[test]
    fn test_prefix_and_full_paths_agree() {
        let config = ClassifyConfig::default();
        let units = vec![
            encode_unit(&CharTokenizer, "hello", &["a", "bc", "def"], " ", &config, 0).unwrap(),
            encode_unit(&CharTokenizer, "hi", &["xy"], " ", &config, 1).unwrap(),
        ];

        let mut full = source(false);
        let expected = score_units(&mut full, &units, 32, true).unwrap();
        assert_eq!(full.prefills, 0);
        assert_eq!(full.batch_calls, 1);

        for batch_size in [1, 2, 4] {
            let mut shared = source(true);
            let got = score_units(&mut shared, &units, batch_size, true).unwrap();
            assert_eq!(got, expected);
            // one prefill per unit, even when a unit spans batches
            assert_eq!(shared.prefills, 2);
            assert_eq!(shared.batch_calls, 0);
        }
    }

    #[test]
    fn test_repeated_prompt_is_prefilled_once() {
        let config = ClassifyConfig::default();
        let units = vec![
            encode_unit(&CharTokenizer, "same", &["a", "b"], " ", &config, 0).unwrap(),
            encode_unit(&CharTokenizer, "same", &["cd"], " ", &config, 1).unwrap(),
            encode_unit(&CharTokenizer, "other", &["a"], " ", &config, 2).unwrap(),
            encode_unit(&CharTokenizer, "same", &["a"], " ", &config, 3).unwrap(),
        ];
        let expected = score_units(&mut source(false), &units, 32, true).unwrap();

        for batch_size in [1, 3, 32] {
            let mut shared = source(true);
            let got = score_units(&mut shared, &units, batch_size, true).unwrap();
            assert_eq!(got, expected);
            // units 0 and 1 share a prefill; unit 3 follows a different prompt
            assert_eq!(shared.prefills, 3);
        }

        let mut twins = source(true);
        score_units(&mut twins, &units[..2], 32, true).unwrap();
        assert_eq!(twins.prefills, 1);
    }

    #[test]
    fn test_share_prefix_can_be_disabled() {
        let config = ClassifyConfig::default();
        let units = vec![encode_unit(&CharTokenizer, "p", &["a", "b"], " ", &config, 0).unwrap()];
        let mut src = source(true);
        score_units(&mut src, &units, 1, false).unwrap();
        assert_eq!(src.prefills, 0);
        assert_eq!(src.batch_calls, 2);
    }

    struct ShortSource;

    impl LogProbSource for ShortSource {
        type Prefix = ();

        fn score_batch(&mut self, sequences: &[&[TokenId]]) -> SourceResult<Vec<Vec<f32>>> {
            Ok(sequences.iter().map(|_| vec![-1.0]).collect())
        }
    }

    #[test]
    fn test_wrong_result_length_is_a_source_error() {
        let config = ClassifyConfig::default();
        let units = vec![encode_unit(&CharTokenizer, "abc", &["de"], " ", &config, 0).unwrap()];
        let err = score_units(&mut ShortSource, &units, 8, true).unwrap_err();
        assert!(matches!(err, ClassifyError::Source { batch: 0, unit: 0, .. }));
    }
}
