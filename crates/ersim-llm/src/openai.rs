//! OpenAI-compatible chat-completion client

use crate::client::{ChatModel, CompletionRequest};
use crate::error::LlmError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default API root
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default timeout for one completion call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

impl<'a> ChatCompletionBody<'a> {
    fn from_request(request: &'a CompletionRequest) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });
        Self {
            model: &request.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        }
    }
}

/// Whether an HTTP status is worth retrying
fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

/// HTTP client for an OpenAI-compatible endpoint
#[derive(Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

impl fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl OpenAiClient {
    /// Create a client for `base_url` (e.g. `https://api.openai.com/v1`)
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, LlmError> {
        let cleaned = base_url.trim_end_matches('/');
        let parsed = reqwest::Url::parse(cleaned)
            .map_err(|e| LlmError::Config(format!("invalid base url '{cleaned}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(LlmError::Config(format!(
                "base url must use http or https, got {}",
                parsed.scheme()
            )));
        }
        if api_key.trim().is_empty() {
            return Err(LlmError::Config("empty API key".to_string()));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Config(format!("failed to build HTTP client: {e}")))?;

        info!("chat client created for {}", cleaned);
        Ok(Self {
            client,
            endpoint: format!("{cleaned}/chat/completions"),
            api_key: api_key.to_string(),
            timeout,
        })
    }

    /// Create a client reading the API key from environment variable `key_var`
    pub fn from_env(base_url: &str, key_var: &str, timeout: Duration) -> Result<Self, LlmError> {
        let key = std::env::var(key_var).map_err(|_| LlmError::MissingApiKey(key_var.to_string()))?;
        Self::new(base_url, &key, timeout)
    }

    /// Completion endpoint URL
    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn headers(&self) -> Result<HeaderMap, LlmError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| LlmError::Config(format!("API key is not a valid header value: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let body = ChatCompletionBody::from_request(request);
        debug!(
            "POST {} model={} temperature={} prompt_chars={}",
            self.endpoint,
            request.model,
            request.temperature,
            request.prompt.len()
        );

        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout.as_secs())
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if is_retryable_status(status) {
            warn!("chat endpoint returned transient status {}", status);
            return Err(LlmError::status(status.as_u16(), &text));
        }
        if !status.is_success() {
            // client errors carry an error envelope for the unwrapper
            debug!("chat endpoint returned {}", status);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn body_includes_system_message_first() {
        let request = CompletionRequest::new("convert this", "gpt-4", 0.5)
            .with_system("you are a converter")
            .with_max_tokens(1000);
        let body = serde_json::to_value(ChatCompletionBody::from_request(&request)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "model": "gpt-4",
                "messages": [
                    {"role": "system", "content": "you are a converter"},
                    {"role": "user", "content": "convert this"}
                ],
                "temperature": 0.5_f32,
                "max_tokens": 1000
            })
        );
    }

    #[test]
    fn rejects_bad_urls_and_keys() {
        assert!(matches!(
            OpenAiClient::new("ftp://example.com", "k", DEFAULT_TIMEOUT),
            Err(LlmError::Config(_))
        ));
        assert!(matches!(
            OpenAiClient::new("not a url", "k", DEFAULT_TIMEOUT),
            Err(LlmError::Config(_))
        ));
        assert!(matches!(
            OpenAiClient::new(DEFAULT_BASE_URL, " ", DEFAULT_TIMEOUT),
            Err(LlmError::Config(_))
        ));
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        let client =
            OpenAiClient::new("https://api.example.com/v1/", "key", DEFAULT_TIMEOUT).unwrap();
        assert_eq!(client.endpoint(), "https://api.example.com/v1/chat/completions");
    }

    #[test]
    fn debug_output_hides_the_api_key() {
        let client = OpenAiClient::new(DEFAULT_BASE_URL, "sk-secret-123", DEFAULT_TIMEOUT).unwrap();
        let printed = format!("{client:?}");
        assert!(!printed.contains("sk-secret-123"));
        assert!(printed.contains("<redacted>"));
        assert!(printed.contains("chat/completions"));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(reqwest::StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(reqwest::StatusCode::BAD_REQUEST));
    }
}
