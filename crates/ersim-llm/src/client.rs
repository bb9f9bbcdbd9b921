//! Chat model interface

use crate::error::LlmError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One chat-completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Optional system message
    pub system: Option<String>,
    /// User prompt
    pub prompt: String,
    /// Model identifier
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Completion token ceiling
    pub max_tokens: u32,
}

impl CompletionRequest {
    /// Create a request for `prompt` against `model`
    #[inline]
    #[must_use]
    pub fn new(prompt: impl Into<String>, model: impl Into<String>, temperature: f32) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            model: model.into(),
            temperature,
            max_tokens: 4000,
        }
    }

    /// Set system message
    #[inline]
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set completion token ceiling
    #[inline]
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Outbound language-model call
///
/// Implementations return the raw response body: a chat-completion envelope
/// on success or an error envelope when the API rejects the call. Only
/// failures that produce no usable body are reported as [`LlmError`].
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Perform exactly one completion call
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}
