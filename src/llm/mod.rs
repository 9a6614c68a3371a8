//! LLM completion client.
//!
//! Talks to an OpenAI-compatible chat-completions endpoint (Ollama's `/v1`
//! API included). Transient failures are retried internally with doubling
//! backoff; callers only ever see a completed response or a terminal
//! [`LlmError`].

use crate::config::LlmConfig;
use crate::error::{ConfigError, LlmError};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// The completion call as a seam: per-chunk flows take any implementation,
/// so they can be driven by scripted responses in tests while production
/// code uses [`LlmClient`].
pub trait Complete: Send + Sync {
    fn complete(&self, prompt: &str) -> impl Future<Output = Result<String, LlmError>> + Send;
}

impl Complete for LlmClient {
    fn complete(&self, prompt: &str) -> impl Future<Output = Result<String, LlmError>> + Send {
        LlmClient::complete(self, prompt)
    }
}

/// Client for an OpenAI-compatible chat-completions API
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_retries: u32,
    initial_backoff: Duration,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

impl LlmClient {
    /// Create a client from config, resolving the API key from the
    /// environment.
    pub fn new(config: &LlmConfig) -> Result<Self, ConfigError> {
        let api_key = config.api_key()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .unwrap_or_default();

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            max_retries: config.max_retries.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
        })
    }

    /// Send one prompt and return the model's full text response.
    ///
    /// Retries transient failures (timeouts, connection errors, 429, 5xx)
    /// up to `max_retries` total attempts with doubling backoff. Any other
    /// failure is terminal immediately.
    pub async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let mut backoff = self.initial_backoff;
        let mut last = String::new();

        for attempt in 1..=self.max_retries {
            match self.send(prompt).await {
                Ok(text) => return Ok(text),
                Err(LlmError::Transient(reason)) => {
                    tracing::warn!(
                        "LLM request attempt {}/{} failed: {}",
                        attempt,
                        self.max_retries,
                        reason
                    );
                    last = reason;
                    if attempt < self.max_retries {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
                Err(other) => return Err(other),
            }
        }

        Err(LlmError::RetriesExhausted {
            attempts: self.max_retries,
            last,
        })
    }

    async fn send(&self, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);

        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = format!("{} - {}", status, truncate(&body, 500));
            return if is_transient_status(status) {
                Err(LlmError::Transient(reason))
            } else {
                Err(LlmError::Terminal(reason))
            };
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Terminal(format!("malformed completion response: {}", e)))?;

        result
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| LlmError::Terminal("completion response had no content".to_string()))
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() || e.is_connect() {
        LlmError::Transient(e.to_string())
    } else {
        LlmError::Terminal(e.to_string())
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
