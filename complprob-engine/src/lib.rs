//! Zero-shot classification by completion probability
//!
//! Each candidate class is written as a completion of a prompt. A causal
//! language model scores how likely it is to produce each completion after
//! the prompt, and the scores are combined with a prior into a posterior
//! distribution over the classes.
//!
//! ```no_run
//! # #[cfg(feature = "llamacpp")]
//! # fn main() -> anyhow::Result<()> {
//! use complprob_engine::{ClassifyConfig, LlamaCppModel, predict};
//!
//! let model = LlamaCppModel::from_file("model.gguf", "tokenizer.json")?;
//! let mut scorer = model.scorer()?;
//! let labels = predict(
//!     &["Tweet: I loved the new Batman movie!\nSentiment:"],
//!     &["positive", "neutral", "negative"],
//!     &mut scorer,
//!     None,
//!     &ClassifyConfig::default(),
//! )?;
//! assert_eq!(labels.len(), 1);
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "llamacpp"))]
//! # fn main() {}
//! ```

pub mod classify;
pub mod config;
pub mod error;
pub mod posterior;
pub mod schedule;
pub mod scorer;
pub mod settings;
pub mod source;
pub mod unit;

pub use classify::{
    log_probs_conditional, log_probs_conditional_examples, log_probs_marginal, predict,
    predict_examples, predict_proba, predict_proba_examples, predict_proba_with_marginals,
    token_logprobs,
};
pub use config::{ClassifyConfig, Continuation};
pub use error::ClassifyError;
pub use posterior::{Posterior, TieBreak, likelihood, posterior};
pub use schedule::{BatchPlan, WorkItem};
pub use scorer::Aggregation;
pub use settings::{BackendKind, Settings};
pub use source::{Backend, HfTokenizer, LogProbSource, SourceError, TokenId, Tokenize};
pub use unit::ClassificationUnit;

#[cfg(feature = "llamacpp")]
pub use source::{LlamaCppModel, LlamaCppScorer};
#[cfg(feature = "remote")]
pub use source::{RemoteConfig, RemoteSource};
#[cfg(all(feature = "llamacpp", feature = "remote"))]
pub use source::{ModelPrefix, ModelSource};
