//! Deterministic in-process tokenizer and log-probability source for tests

#![allow(dead_code)]

use complprob_engine::source::error::Result;
use complprob_engine::{LogProbSource, SourceError, TokenId, Tokenize};

pub const BOS: TokenId = 1;

/// Log-probability of any token that no rule matches.
pub const DEFAULT_LOG_PROB: f32 = -4.0;

/// Whitespace tokenizer with stable ids derived from the word itself.
pub struct WordTokenizer;

impl WordTokenizer {
    pub fn id(word: &str) -> TokenId {
        // FNV-1a, folded into a small id range above the special tokens
        let mut hash: u32 = 0x811c_9dc5;
        for byte in word.bytes() {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        10 + hash % 1_000_000
    }
}

impl Tokenize for WordTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<TokenId>> {
        let mut ids = if add_special_tokens { vec![BOS] } else { vec![] };
        ids.extend(text.split_whitespace().map(WordTokenizer::id));
        Ok(ids)
    }
}

/// `target` gets `log_prob` whenever `context` occurs anywhere before it.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub context: TokenId,
    pub target: TokenId,
    pub log_prob: f32,
}

/// Mock language model: rule-based log-probabilities plus call accounting.
#[derive(Default)]
pub struct MockModel {
    rules: Vec<Rule>,
    prefix_support: bool,
    /// Fail the n-th source call (0-based), counting every kind of call
    fail_on_call: Option<usize>,
    pub calls: usize,
    pub batch_calls: usize,
    pub prefills: usize,
    pub prefix_calls: usize,
    /// Tokens run through the "forward pass"
    pub tokens_processed: usize,
    /// Largest number of sequences seen in one call
    pub max_batch: usize,
}

impl MockModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix_support(mut self) -> Self {
        self.prefix_support = true;
        self
    }

    pub fn failing_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    /// Make `target` likely after `context` (both single words).
    pub fn rule(mut self, context: &str, target: &str, log_prob: f32) -> Self {
        self.rules.push(Rule {
            context: WordTokenizer::id(context),
            target: WordTokenizer::id(target),
            log_prob,
        });
        self
    }

    fn log_prob(&self, history: &[TokenId], target: TokenId) -> f32 {
        self.rules
            .iter()
            .filter(|r| r.target == target && history.contains(&r.context))
            .map(|r| r.log_prob)
            .fold(DEFAULT_LOG_PROB, f32::max)
    }

    fn begin_call(&mut self, sequences: usize) -> Result<()> {
        let call = self.calls;
        self.calls += 1;
        self.max_batch = self.max_batch.max(sequences);
        if self.fail_on_call == Some(call) {
            return Err(SourceError::Inference(format!("mock failure on call {}", call).into()));
        }
        Ok(())
    }
}

impl Tokenize for MockModel {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<TokenId>> {
        WordTokenizer.encode(text, add_special_tokens)
    }
}

impl LogProbSource for MockModel {
    type Prefix = Vec<TokenId>;

    fn supports_prefix_state(&self) -> bool {
        self.prefix_support
    }

    fn score_batch(&mut self, sequences: &[&[TokenId]]) -> Result<Vec<Vec<f32>>> {
        self.begin_call(sequences.len())?;
        self.batch_calls += 1;
        self.tokens_processed += sequences.iter().map(|s| s.len()).sum::<usize>();
        Ok(sequences
            .iter()
            .map(|s| (1..s.len()).map(|i| self.log_prob(&s[..i], s[i])).collect())
            .collect())
    }

    fn prefill(&mut self, prefix: &[TokenId]) -> Result<Vec<TokenId>> {
        if !self.prefix_support {
            return Err(SourceError::Unsupported("prefix state"));
        }
        self.begin_call(1)?;
        self.prefills += 1;
        self.tokens_processed += prefix.len();
        Ok(prefix.to_vec())
    }

    fn score_with_prefix(
        &mut self,
        prefix: &Vec<TokenId>,
        continuations: &[&[TokenId]],
    ) -> Result<Vec<Vec<f32>>> {
        self.begin_call(continuations.len())?;
        self.prefix_calls += 1;
        self.tokens_processed += continuations.iter().map(|c| c.len()).sum::<usize>();
        Ok(continuations
            .iter()
            .map(|c| {
                let mut history = prefix.clone();
                c.iter()
                    .map(|&t| {
                        let lp = self.log_prob(&history, t);
                        history.push(t);
                        lp
                    })
                    .collect()
            })
            .collect())
    }
}
