//! OpenAI-compatible completions endpoint as a log-probability source
//!
//! Sends token-id prompts with `max_tokens = 0`, `echo = true` and
//! `logprobs = 0`, so the server returns the log-probability of every prompt
//! token and generates nothing. Works with hosted completion models and
//! with self-hosted servers that implement the same endpoint.
//!
//! Enabled by the `remote` feature flag (on by default).

use super::error::{Result, SourceError};
use super::{HfTokenizer, LogProbSource, TokenId, Tokenize};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection and retry settings for a [`RemoteSource`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL up to and including the API version, e.g. `http://localhost:8000/v1`
    pub base_url: String,
    /// Model name sent with every request
    pub model: String,
    /// Environment variable holding the bearer token (unset = no auth header)
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Retries after the first attempt for transport errors, 429 and 5xx
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every further retry
    pub retry_delay_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            model: "HuggingFaceTB/SmolLM2-135M-Instruct".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            timeout_secs: 60,
            max_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a [&'a [TokenId]],
    max_tokens: u32,
    echo: bool,
    logprobs: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    index: usize,
    logprobs: Option<ChoiceLogprobs>,
}

#[derive(Debug, Deserialize)]
struct ChoiceLogprobs {
    /// One entry per echoed token; the first one is `null`
    token_logprobs: Vec<Option<f32>>,
}

/// Whether a failed request is worth another attempt.
fn is_retryable(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Turn one choice into the `tokens[1..]` log-probabilities of its sequence.
fn choice_log_probs(choice: Choice, expected_len: usize) -> Result<Vec<f32>> {
    let logprobs = choice.logprobs.ok_or_else(|| {
        SourceError::InvalidResponse(format!("choice {} has no logprobs", choice.index))
    })?;
    if logprobs.token_logprobs.len() != expected_len {
        return Err(SourceError::InvalidResponse(format!(
            "choice {} echoed {} tokens, expected {}",
            choice.index,
            logprobs.token_logprobs.len(),
            expected_len
        )));
    }
    logprobs
        .token_logprobs
        .into_iter()
        .skip(1)
        .map(|lp| {
            lp.ok_or_else(|| {
                SourceError::InvalidResponse(format!(
                    "choice {} has a null log-probability after the first token",
                    choice.index
                ))
            })
        })
        .collect()
}

/// Log-probability source backed by a remote completions endpoint.
///
/// Has no prefix state: every sequence is sent in full.
pub struct RemoteSource {
    client: reqwest::blocking::Client,
    config: RemoteConfig,
    api_key: Option<String>,
    tokenizer: HfTokenizer,
}

impl RemoteSource {
    /// Create a source. `tokenizer` must match the remote model's vocabulary.
    pub fn new(config: RemoteConfig, tokenizer: HfTokenizer) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SourceError::Remote(e.into()))?;
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        if config.api_key_env.is_some() && api_key.is_none() {
            tracing::warn!(
                "{} is not set, sending requests without authorization",
                config.api_key_env.as_deref().unwrap_or_default()
            );
        }
        Ok(Self {
            client,
            config,
            api_key,
            tokenizer,
        })
    }

    /// Model name sent to the endpoint.
    pub fn model_name(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        format!("{}/completions", self.config.base_url.trim_end_matches('/'))
    }

    /// Send one request, retrying transient failures.
    fn post(&self, body: &CompletionRequest<'_>) -> Result<CompletionResponse> {
        let url = self.endpoint();
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut attempt = 0;
        loop {
            let mut request = self.client.post(&url).json(body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let failure = match request.send() {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<CompletionResponse>()
                        .map_err(|e| SourceError::InvalidResponse(e.to_string()));
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().unwrap_or_default();
                    let error = SourceError::Remote(format!("HTTP {}: {}", status, text).into());
                    if !is_retryable(status) {
                        return Err(error);
                    }
                    error
                }
                Err(e) => SourceError::Remote(e.into()),
            };

            if attempt >= self.config.max_retries {
                return Err(failure);
            }
            attempt += 1;
            tracing::warn!(
                "Request to {} failed ({}), retry {}/{} in {:?}",
                url,
                failure,
                attempt,
                self.config.max_retries,
                delay
            );
            std::thread::sleep(delay);
            delay *= 2;
        }
    }
}

impl Tokenize for RemoteSource {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<TokenId>> {
        self.tokenizer.encode(text, add_special_tokens)
    }
}

impl LogProbSource for RemoteSource {
    type Prefix = ();

    fn score_batch(&mut self, sequences: &[&[TokenId]]) -> Result<Vec<Vec<f32>>> {
        if sequences.is_empty() {
            return Ok(Vec::new());
        }
        let body = CompletionRequest {
            model: &self.config.model,
            prompt: sequences,
            max_tokens: 0,
            echo: true,
            logprobs: 0,
            temperature: 0.0,
        };
        tracing::debug!("Requesting log-probabilities for {} sequences", sequences.len());
        let mut response = self.post(&body)?;

        if response.choices.len() != sequences.len() {
            return Err(SourceError::InvalidResponse(format!(
                "got {} choices for {} sequences",
                response.choices.len(),
                sequences.len()
            )));
        }
        response.choices.sort_by_key(|c| c.index);

        response
            .choices
            .into_iter()
            .zip(sequences)
            .map(|(choice, sequence)| choice_log_probs(choice, sequence.len()))
            .collect()
    }
}
