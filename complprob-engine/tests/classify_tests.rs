//! Integration tests for the classification entry points
//!
//! All tests run against the deterministic mock model in `common`, so no
//! model download is needed.

mod common;

use common::{DEFAULT_LOG_PROB, MockModel};
use complprob_engine::{
    Aggregation, ClassificationUnit, ClassifyConfig, ClassifyError, Continuation, Posterior,
    TieBreak, log_probs_conditional, log_probs_conditional_examples, predict, predict_examples,
    predict_proba, predict_proba_examples,
};

// ============================================================================
// Helper functions
// ============================================================================

const SENTIMENTS: [&str; 3] = ["positive", "neutral", "negative"];

fn sentiment_model() -> MockModel {
    MockModel::new()
        .rule("loved", "positive", -0.05)
        .rule("hated", "negative", -0.1)
        .rule("okay", "neutral", -0.3)
        .rule("fine", "neutral", -0.5)
}

fn sentiment_prompts() -> Vec<String> {
    [
        "I loved the new Batman movie!",
        "The food was okay, nothing special.",
        "I hated waiting in line.",
        "Service was fine.",
        "Absolutely loved it.",
    ]
    .iter()
    .map(|t| format!("Tweet: {}\nSentiment:", t))
    .collect()
}

fn assert_sums_to_one(p: &[f64]) {
    let total: f64 = p.iter().sum();
    assert!((total - 1.0).abs() < 1e-6, "sum is {}", total);
    assert!(p.iter().all(|&x| (0.0..=1.0).contains(&x)));
}

// ============================================================================
// Posterior properties
// ============================================================================

mod posterior_properties {
    use super::*;

    #[test]
    fn test_rows_sum_to_one_for_any_valid_prior() {
        let priors: [Option<&[f64]>; 4] = [
            None,
            Some(&[0.125, 0.125, 0.75]),
            Some(&[1.0, 0.0, 0.0]),
            Some(&[3.0, 2.0, 1.0]),
        ];
        for prior in priors {
            let probs = predict_proba(
                &sentiment_prompts(),
                &SENTIMENTS,
                &mut sentiment_model(),
                prior,
                &ClassifyConfig::default(),
            )
            .unwrap();
            assert_eq!(probs.len(), 5);
            for row in &probs {
                assert_eq!(row.len(), 3);
                assert_sums_to_one(row);
            }
        }
    }

    #[test]
    fn test_equal_scores_and_uniform_prior_are_exactly_uniform() {
        // no rule fires, so every completion scores the default
        let probs = predict_proba(
            &["Nothing to see here"],
            &["alpha", "beta gamma", "delta"],
            &mut MockModel::new(),
            None,
            &ClassifyConfig::default(),
        )
        .unwrap();
        assert_eq!(&*probs[0], &[1.0 / 3.0; 3]);
    }

    #[test]
    fn test_raising_one_score_raises_only_its_posterior() {
        let prompts = ["cue here"];
        let completions = ["a", "b", "c"];
        let prior = Some(&[0.2, 0.3, 0.5][..]);
        let config = ClassifyConfig::default();

        let low = predict_proba(
            &prompts,
            &completions,
            &mut MockModel::new().rule("cue", "a", -2.0),
            prior,
            &config,
        )
        .unwrap();
        let high = predict_proba(
            &prompts,
            &completions,
            &mut MockModel::new().rule("cue", "a", -1.0),
            prior,
            &config,
        )
        .unwrap();

        assert!(high[0][0] > low[0][0]);
        assert!(high[0][1] < low[0][1]);
        assert!(high[0][2] < low[0][2]);
    }

    #[test]
    fn test_zero_prior_forces_exact_zero() {
        let probs = predict_proba(
            &sentiment_prompts(),
            &SENTIMENTS,
            &mut sentiment_model(),
            Some(&[0.0, 0.5, 0.5]),
            &ClassifyConfig::default(),
        )
        .unwrap();
        for row in &probs {
            assert_eq!(row[0], 0.0);
            assert_sums_to_one(row);
        }
    }

    #[test]
    fn test_prior_is_normalized_before_use() {
        let config = ClassifyConfig::default();
        let scaled = predict_proba(
            &sentiment_prompts(),
            &SENTIMENTS,
            &mut sentiment_model(),
            Some(&[2.0, 2.0, 4.0]),
            &config,
        )
        .unwrap();
        let normalized = predict_proba(
            &sentiment_prompts(),
            &SENTIMENTS,
            &mut sentiment_model(),
            Some(&[0.25, 0.25, 0.5]),
            &config,
        )
        .unwrap();
        assert_eq!(scaled, normalized);
    }
}

// ============================================================================
// Scheduling: batching, ordering, prefix sharing
// ============================================================================

mod scheduling {
    use super::*;

    #[test]
    fn test_batch_size_does_not_change_results() {
        let prompts = sentiment_prompts();
        let work = prompts.len() * SENTIMENTS.len();
        for prefix in [false, true] {
            let make = || {
                let model = sentiment_model();
                if prefix { model.with_prefix_support() } else { model }
            };
            let reference = predict_proba(
                &prompts,
                &SENTIMENTS,
                &mut make(),
                None,
                &ClassifyConfig::default().with_batch_size(work),
            )
            .unwrap();
            for batch_size in [1, 2, work, work + 10] {
                let mut model = make();
                let got = predict_proba(
                    &prompts,
                    &SENTIMENTS,
                    &mut model,
                    None,
                    &ClassifyConfig::default().with_batch_size(batch_size),
                )
                .unwrap();
                assert_eq!(got, reference, "batch_size {}", batch_size);
                assert!(model.max_batch <= batch_size);
            }
        }
    }

    #[test]
    fn test_batch_size_one_serializes_requests() {
        let mut model = sentiment_model();
        predict_proba(
            &sentiment_prompts(),
            &SENTIMENTS,
            &mut model,
            None,
            &ClassifyConfig::default().with_batch_size(1),
        )
        .unwrap();
        assert_eq!(model.batch_calls, 15);
        assert_eq!(model.max_batch, 1);
    }

    #[test]
    fn test_shuffled_input_gives_shuffled_output() {
        let prompts = sentiment_prompts();
        let permutation = [3, 0, 4, 1, 2];
        let shuffled: Vec<String> = permutation.iter().map(|&i| prompts[i].clone()).collect();
        let config = ClassifyConfig::default().with_batch_size(2);

        let original = predict_proba(&prompts, &SENTIMENTS, &mut sentiment_model(), None, &config)
            .unwrap();
        let permuted = predict_proba(&shuffled, &SENTIMENTS, &mut sentiment_model(), None, &config)
            .unwrap();
        for (k, &i) in permutation.iter().enumerate() {
            assert_eq!(permuted[k], original[i]);
        }
    }

    #[test]
    fn test_prefix_state_is_computed_once_per_prompt() {
        let prompts = sentiment_prompts();
        let config = ClassifyConfig::default().with_batch_size(2);

        let mut shared = sentiment_model().with_prefix_support();
        let with_sharing = predict_proba(&prompts, &SENTIMENTS, &mut shared, None, &config).unwrap();
        assert_eq!(shared.prefills, prompts.len());
        assert_eq!(shared.batch_calls, 0);

        let mut recompute = sentiment_model();
        let without = predict_proba(&prompts, &SENTIMENTS, &mut recompute, None, &config).unwrap();
        assert_eq!(recompute.prefills, 0);

        assert_eq!(with_sharing, without);
        assert!(shared.tokens_processed < recompute.tokens_processed);
    }

    #[test]
    fn test_prefix_sharing_can_be_switched_off() {
        let config = ClassifyConfig {
            share_prompt_prefix: false,
            ..Default::default()
        };
        let mut model = sentiment_model().with_prefix_support();
        predict_proba(&sentiment_prompts(), &SENTIMENTS, &mut model, None, &config).unwrap();
        assert_eq!(model.prefills, 0);
        assert!(model.batch_calls > 0);
    }

    #[test]
    fn test_joint_tokenization_matches_independent_for_word_tokens() {
        let independent = ClassifyConfig::default();
        let joint = ClassifyConfig {
            continuation: Continuation::Joint,
            ..Default::default()
        };
        let a = predict_proba(&sentiment_prompts(), &SENTIMENTS, &mut sentiment_model(), None, &independent)
            .unwrap();
        let b = predict_proba(&sentiment_prompts(), &SENTIMENTS, &mut sentiment_model(), None, &joint)
            .unwrap();
        assert_eq!(a, b);
    }
}

// ============================================================================
// Scenarios
// ============================================================================

mod scenarios {
    use super::*;

    #[test]
    fn test_batman_tweet_overcomes_prior() {
        let labels = predict(
            &["Tweet: I loved the new Batman movie!\nSentiment:"],
            &SENTIMENTS,
            &mut sentiment_model(),
            Some(&[0.125, 0.125, 0.75]),
            &ClassifyConfig::default(),
        )
        .unwrap();
        assert_eq!(labels, vec!["positive"]);
    }

    #[test]
    fn test_closest_planet() {
        let mut model = MockModel::new()
            .rule("closer", "Mercury", -0.2)
            .rule("closer", "Earth", -1.5);
        let labels = predict(
            &["Which planet is closer to the Sun: Mercury or Earth?"],
            &["Mercury", "Earth"],
            &mut model,
            None,
            &ClassifyConfig::default(),
        )
        .unwrap();
        assert_eq!(labels, vec!["Mercury"]);
    }

    #[test]
    fn test_heterogeneous_units() {
        let a = ClassificationUnit::new("Is the sky blue?", ["yes", "no"]).unwrap();
        let b = ClassificationUnit::new("Pick a color:", ["red", "green", "blue"])
            .unwrap()
            .with_prior(vec![2.0 / 3.0, 1.0 / 3.0, 0.0])
            .unwrap();
        let mut model = MockModel::new()
            .rule("sky", "yes", -0.1)
            .rule("color:", "blue", -0.01)
            .with_prefix_support();

        let probs =
            predict_proba_examples(&[a.clone(), b.clone()], &mut model, &ClassifyConfig::default())
                .unwrap();
        assert_eq!(probs.len(), 2);
        assert_eq!(probs[0].len(), 2);
        assert_eq!(probs[1].len(), 3);
        assert_eq!(probs[1][2], 0.0);
        assert_sums_to_one(&probs[0]);
        assert_sums_to_one(&probs[1]);

        let labels = predict_examples(&[a, b], &mut model, &ClassifyConfig::default()).unwrap();
        // "blue" is most likely but excluded by its prior
        assert_eq!(labels, vec!["yes", "red"]);
    }

    #[test]
    fn test_unit_end_of_prompt_override() {
        let unit = ClassificationUnit::new("Answer", ["ok"])
            .unwrap()
            .with_end_of_prompt(" :: ");
        let lps = log_probs_conditional_examples(
            &[unit],
            &mut MockModel::new(),
            &ClassifyConfig::default(),
        )
        .unwrap();
        // "::" becomes a scorable completion token
        assert_eq!(lps[0][0], vec![DEFAULT_LOG_PROB, DEFAULT_LOG_PROB]);
    }
}

// ============================================================================
// Configuration options
// ============================================================================

mod options {
    use super::*;

    #[test]
    fn test_tie_break_policy() {
        let tied = ["x", "y"];
        let first = predict(
            &["no cue"],
            &tied,
            &mut MockModel::new(),
            None,
            &ClassifyConfig::default(),
        )
        .unwrap();
        let last = predict(
            &["no cue"],
            &tied,
            &mut MockModel::new(),
            None,
            &ClassifyConfig::default().with_tie_break(TieBreak::LastIndex),
        )
        .unwrap();
        assert_eq!(first, vec!["x"]);
        assert_eq!(last, vec!["y"]);
    }

    #[test]
    fn test_sum_penalizes_long_completions() {
        let completions = ["very good", "bad"];
        let model = || {
            MockModel::new()
                .rule("review", "very", -1.0)
                .rule("review", "good", -1.0)
                .rule("review", "bad", -1.5)
        };
        let mean = predict(&["review"], &completions, &mut model(), None, &ClassifyConfig::default())
            .unwrap();
        let sum = predict(
            &["review"],
            &completions,
            &mut model(),
            None,
            &ClassifyConfig::default().with_aggregation(Aggregation::Sum),
        )
        .unwrap();
        assert_eq!(mean, vec!["very good"]);
        assert_eq!(sum, vec!["bad"]);
    }

    #[test]
    fn test_log_probs_conditional_is_ragged() {
        let lps = log_probs_conditional(
            &["review", "other"],
            &["very good", "bad"],
            &mut MockModel::new().rule("review", "bad", -0.5),
            &ClassifyConfig::default(),
        )
        .unwrap();
        assert_eq!(lps.len(), 2);
        assert_eq!(lps[0][0].len(), 2);
        assert_eq!(lps[0][1], vec![-0.5]);
        assert_eq!(lps[1][1], vec![DEFAULT_LOG_PROB]);
    }
}

// ============================================================================
// Errors: fail fast, no partial results
// ============================================================================

mod errors {
    use super::*;

    fn assert_rejected(call: impl FnOnce(&mut MockModel) -> Result<Vec<Posterior>, ClassifyError>) {
        let mut model = sentiment_model();
        let err = call(&mut model).unwrap_err();
        assert!(matches!(err, ClassifyError::InvalidInput { .. }), "{}", err);
        assert_eq!(model.calls, 0);
    }

    #[test]
    fn test_invalid_input_makes_no_model_call() {
        let config = ClassifyConfig::default();
        let no_prompts: [&str; 0] = [];
        let no_completions: [&str; 0] = [];

        assert_rejected(|m| predict_proba(&no_prompts, &SENTIMENTS, m, None, &config));
        assert_rejected(|m| predict_proba(&["p"], &no_completions, m, None, &config));
        assert_rejected(|m| predict_proba(&["p"], &SENTIMENTS, m, Some(&[0.5, 0.5]), &config));
        assert_rejected(|m| {
            predict_proba(&["p"], &SENTIMENTS, m, Some(&[0.5, 0.6, -0.1]), &config)
        });
        assert_rejected(|m| {
            predict_proba(&["p"], &SENTIMENTS, m, Some(&[0.0, 0.0, 0.0]), &config)
        });
        assert_rejected(|m| {
            let config = ClassifyConfig::default().with_batch_size(0);
            predict_proba(&["p"], &SENTIMENTS, m, None, &config)
        });
        assert_rejected(|m| predict_proba_examples(&[], m, &config));
    }

    #[test]
    fn test_empty_completion_fails_whole_call_before_scoring() {
        let mut model = sentiment_model().with_prefix_support();
        let err = predict_proba(
            &sentiment_prompts(),
            &["positive", "   "],
            &mut model,
            None,
            &ClassifyConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ClassifyError::Tokenization {
                unit: 0,
                completion: 1,
                ..
            }
        ));
        assert_eq!(model.calls, 0);
    }

    #[test]
    fn test_bad_unit_anywhere_fails_before_scoring() {
        let good = ClassificationUnit::new("fine prompt", ["a", "b"]).unwrap();
        let bad = ClassificationUnit::new("other prompt", ["c", ""]).unwrap();
        let mut model = MockModel::new();
        let err = predict_proba_examples(&[good, bad], &mut model, &ClassifyConfig::default())
            .unwrap_err();
        assert_eq!(err.unit(), Some(1));
        assert_eq!(model.calls, 0);
    }

    #[test]
    fn test_source_failure_names_batch_and_unit() {
        // batches of 2 over 5 prompts x 3 completions: call 3 covers items 6 and 7 (prompt 2)
        let mut model = sentiment_model().failing_on_call(3);
        let err = predict_proba(
            &sentiment_prompts(),
            &SENTIMENTS,
            &mut model,
            None,
            &ClassifyConfig::default().with_batch_size(2),
        )
        .unwrap_err();
        match err {
            ClassifyError::Source { batch, unit, .. } => {
                assert_eq!(batch, 3);
                assert_eq!(unit, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
        // no further calls after the failure
        assert_eq!(model.calls, 4);
    }

    #[test]
    fn test_source_failure_during_prefill() {
        let mut model = sentiment_model().with_prefix_support().failing_on_call(0);
        let err = predict(
            &sentiment_prompts(),
            &SENTIMENTS,
            &mut model,
            None,
            &ClassifyConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ClassifyError::Source { batch: 0, unit: 0, .. }));
    }
}
