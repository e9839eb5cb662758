// LLM invocation layer
//
// The workflow only ever sees `dyn ChatModel`; provider selection, the 60 s
// per-call timeout and transient-failure retry all live here. Providers are
// configured, never named at call sites.

use crate::config::{LlmConfig, LlmProvider};
use crate::errors::ErrorCode;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

/// Per-call ceiling, independent of caller cancellation
const CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Attempts per call (first try + retries)
const MAX_ATTEMPTS: u32 = 3;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const OPENAI_BASE_URL: &str = "https://api.openai.com";

/// LLM failure classes; only the transient ones are retried
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request timed out after {0}s")]
    Timeout(u64),
    #[error("LLM rate limited")]
    RateLimited,
    #[error("LLM connection error: {0}")]
    Connection(String),
    #[error("LLM invocation failed: {0}")]
    Other(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout(_) | LlmError::RateLimited | LlmError::Connection(_)
        )
    }

    /// The envelope code this failure surfaces as
    pub fn error_code(&self) -> ErrorCode {
        match self {
            LlmError::Timeout(_) => ErrorCode::LlmTimeout,
            _ => ErrorCode::LlmError,
        }
    }
}

/// One-shot prompt-to-text completion
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// HTTP-backed implementation over the configured provider
pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()?;
        Ok(Self { http, config })
    }

    async fn invoke_once(&self, prompt: &str) -> Result<String, LlmError> {
        match self.config.provider {
            LlmProvider::Anthropic => self.invoke_anthropic(prompt).await,
            LlmProvider::OpenAi => self.invoke_openai(prompt).await,
        }
    }

    async fn invoke_anthropic(&self, prompt: &str) -> Result<String, LlmError> {
        let body = json!({
            "model": self.config.anthropic_model,
            "max_tokens": 4096,
            "temperature": 0,
            "messages": [{"role": "user", "content": prompt}],
        });
        let response = self
            .http
            .post(format!("{ANTHROPIC_BASE_URL}/v1/messages"))
            .header("x-api-key", &self.config.anthropic_api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let value = check_status(response).await?;
        parse_anthropic_response(&value)
    }

    async fn invoke_openai(&self, prompt: &str) -> Result<String, LlmError> {
        let body = json!({
            "model": self.config.openai_model,
            "temperature": 0,
            "messages": [{"role": "user", "content": prompt}],
        });
        let response = self
            .http
            .post(format!("{OPENAI_BASE_URL}/v1/chat/completions"))
            .bearer_auth(&self.config.openai_api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let value = check_status(response).await?;
        parse_openai_response(&value)
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    /// Complete with timeout and bounded retry.
    ///
    /// Transient failures (rate limit, timeout, connection) retry with
    /// exponential backoff between 2 s and 30 s; everything else surfaces
    /// immediately as a workflow-level LLM error.
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let mut last_error = LlmError::Other("no attempts made".to_string());
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(retry_backoff(attempt)).await;
            }

            let result = tokio::time::timeout(CALL_TIMEOUT, self.invoke_once(prompt)).await;
            let error = match result {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(e)) => e,
                Err(_elapsed) => LlmError::Timeout(CALL_TIMEOUT.as_secs()),
            };

            if !error.is_transient() {
                return Err(error);
            }
            tracing::warn!(
                "transient LLM failure (attempt {}/{MAX_ATTEMPTS}): {error}",
                attempt + 1
            );
            last_error = error;
        }
        Err(last_error)
    }
}

fn classify_transport_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(CALL_TIMEOUT.as_secs())
    } else if e.is_connect() {
        LlmError::Connection(e.to_string())
    } else {
        LlmError::Other(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<Value, LlmError> {
    let status = response.status();
    if status.as_u16() == 429 {
        return Err(LlmError::RateLimited);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::Other(format!("HTTP {status}: {body}")));
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| LlmError::Other(format!("invalid response body: {e}")))
}

/// Pull the text out of an Anthropic messages response
fn parse_anthropic_response(value: &Value) -> Result<String, LlmError> {
    value["content"]
        .as_array()
        .and_then(|blocks| {
            blocks
                .iter()
                .find(|block| block["type"] == "text")
                .and_then(|block| block["text"].as_str())
        })
        .map(str::to_string)
        .ok_or_else(|| LlmError::Other("response carried no text block".to_string()))
}

/// Pull the text out of an OpenAI chat-completions response
fn parse_openai_response(value: &Value) -> Result<String, LlmError> {
    value["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| LlmError::Other("response carried no message content".to_string()))
}

/// Backoff before attempt n (1-based retries): 2s, 4s, 8s... capped at 30s
fn retry_backoff(attempt: u32) -> Duration {
    let secs = 2u64.saturating_mul(1 << (attempt - 1).min(5));
    Duration::from_secs(secs.min(30))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(LlmError::RateLimited.is_transient());
        assert!(LlmError::Timeout(60).is_transient());
        assert!(LlmError::Connection("refused".into()).is_transient());
        assert!(!LlmError::Other("bad request".into()).is_transient());
    }

    #[test]
    fn error_codes_distinguish_timeout() {
        assert_eq!(LlmError::Timeout(60).error_code(), ErrorCode::LlmTimeout);
        assert_eq!(LlmError::RateLimited.error_code(), ErrorCode::LlmError);
    }

    #[test]
    fn backoff_is_bounded() {
        assert_eq!(retry_backoff(1), Duration::from_secs(2));
        assert_eq!(retry_backoff(2), Duration::from_secs(4));
        assert_eq!(retry_backoff(3), Duration::from_secs(8));
        assert_eq!(retry_backoff(10), Duration::from_secs(30));
    }

    #[test]
    fn anthropic_response_parsing() {
        let value = serde_json::json!({
            "content": [
                {"type": "text", "text": "SELECT 1"}
            ]
        });
        assert_eq!(parse_anthropic_response(&value).unwrap(), "SELECT 1");

        let empty = serde_json::json!({"content": []});
        assert!(parse_anthropic_response(&empty).is_err());
    }

    #[test]
    fn openai_response_parsing() {
        let value = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "hello"}}]
        });
        assert_eq!(parse_openai_response(&value).unwrap(), "hello");
        assert!(parse_openai_response(&serde_json::json!({})).is_err());
    }
}
