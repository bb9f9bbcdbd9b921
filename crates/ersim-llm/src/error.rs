//! Error types for model calls and response envelopes

/// Longest excerpt of a raw response carried inside an error
pub const RAW_EXCERPT_CHARS: usize = 200;

/// Truncate `raw` to [`RAW_EXCERPT_CHARS`] characters for diagnostics
#[must_use]
pub fn excerpt(raw: &str) -> String {
    if raw.chars().count() <= RAW_EXCERPT_CHARS {
        raw.to_string()
    } else {
        let head: String = raw.chars().take(RAW_EXCERPT_CHARS).collect();
        format!("{head}…")
    }
}

/// Errors from the outbound model call
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Connection or protocol failure before a response arrived
    #[error("transport error: {0}")]
    Transport(String),

    /// Request exceeded the client timeout
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// Server answered with a transient failure status (429, 5xx)
    #[error("transient status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body excerpt
        body: String,
    },

    /// Client could not be configured
    #[error("invalid client configuration: {0}")]
    Config(String),

    /// No API key available
    #[error("missing API key (expected in ${0})")]
    MissingApiKey(String),
}

impl LlmError {
    /// Create status error with a truncated body
    pub fn status(status: u16, body: &str) -> Self {
        Self::Status {
            status,
            body: excerpt(body),
        }
    }

    /// Whether repeating the same call may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_) | Self::Status { .. })
    }
}

/// Errors unwrapping a chat-completion envelope
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Outer body is not JSON
    #[error("response body is not JSON ({reason}): {raw}")]
    OuterParse {
        /// Parser message
        reason: String,
        /// Body excerpt
        raw: String,
    },

    /// Body carries an API error object
    #[error("API error: {message}")]
    Api {
        /// Message reported by the API
        message: String,
        /// Body excerpt
        raw: String,
    },

    /// No `choices[0].message.content` string
    #[error("response has no message content: {raw}")]
    MissingContent {
        /// Body excerpt
        raw: String,
    },

    /// Content string is not JSON
    #[error("message content is not JSON ({reason}): {raw}")]
    InnerParse {
        /// Parser message
        reason: String,
        /// Content excerpt
        raw: String,
    },
}

impl EnvelopeError {
    /// Raw text excerpt attached to the error
    #[must_use]
    pub fn raw(&self) -> &str {
        match self {
            Self::OuterParse { raw, .. }
            | Self::Api { raw, .. }
            | Self::MissingContent { raw }
            | Self::InnerParse { raw, .. } => raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_truncates_on_char_boundary() {
        let long = "é".repeat(RAW_EXCERPT_CHARS + 5);
        let cut = excerpt(&long);
        assert_eq!(cut.chars().count(), RAW_EXCERPT_CHARS + 1);
        assert_eq!(excerpt("short"), "short");
    }

    #[test]
    fn retryable_classification() {
        assert!(LlmError::Timeout(30).is_retryable());
        assert!(LlmError::status(429, "slow down").is_retryable());
        assert!(!LlmError::MissingApiKey("OPENAI_API_KEY".into()).is_retryable());
    }
}
