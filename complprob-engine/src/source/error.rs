//! Error types for tokenizers and log-probability sources

/// Errors raised by the external collaborators: tokenizers, model
/// loading and the log-probability sources themselves.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("unknown model variant: '{0}'")]
    UnknownVariant(String),

    #[error("download failed")]
    Download(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("model load failed")]
    ModelLoad(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("tokenizer load failed")]
    TokenizerLoad(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("tokenization failed")]
    Tokenize(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("inference failed")]
    Inference(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("sequence of {needed} tokens does not fit the context window of {n_ctx}")]
    ContextOverflow { needed: usize, n_ctx: usize },

    #[error("remote request failed")]
    Remote(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid response from remote source: {0}")]
    InvalidResponse(String),

    #[error("operation not supported by this source: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, SourceError>;
